//! Local customer record with notification preferences and the
//! access-control mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the customer was matched to an access-control user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    Email,
    Phone,
    Manual,
}

impl MappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingMethod::Email => "email",
            MappingMethod::Phone => "phone",
            MappingMethod::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "email" => Some(MappingMethod::Email),
            "phone" => Some(MappingMethod::Phone),
            "manual" => Some(MappingMethod::Manual),
            _ => None,
        }
    }
}

/// A customer synced from the payments provider, plus local preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientData {
    pub id: Uuid,
    /// Provider customer id. Unique; sync upserts are keyed on it.
    pub external_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Suppresses overdue reminders entirely when set.
    pub block_daily_messages: bool,
    /// Minimum days between consecutive overdue reminders.
    pub overdue_notice_interval_days: i64,
    /// Access-control user id, when mapped.
    pub traccar_user_id: Option<i64>,
    pub mapping_method: Option<MappingMethod>,
    /// Mirrors the external system's block state. Set only after a confirmed
    /// external call succeeds.
    pub is_traccar_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Default spacing between overdue reminders, in days.
pub const DEFAULT_OVERDUE_INTERVAL_DAYS: i64 = 3;

impl ClientData {
    /// Build a fresh record for a customer first seen during sync.
    pub fn new(external_id: &str, name: &str, email: Option<String>, phone: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            email,
            phone,
            block_daily_messages: false,
            overdue_notice_interval_days: DEFAULT_OVERDUE_INTERVAL_DAYS,
            traccar_user_id: None,
            mapping_method: None,
            is_traccar_blocked: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_defaults() {
        let c = ClientData::new("cus_1", "Maria", None, Some("11987654321".into()));
        assert!(!c.block_daily_messages);
        assert_eq!(c.overdue_notice_interval_days, DEFAULT_OVERDUE_INTERVAL_DAYS);
        assert!(c.traccar_user_id.is_none());
        assert!(!c.is_traccar_blocked);
    }

    #[test]
    fn mapping_method_roundtrip() {
        for m in [MappingMethod::Email, MappingMethod::Phone, MappingMethod::Manual] {
            assert_eq!(MappingMethod::from_string(m.as_str()), Some(m));
        }
        assert_eq!(MappingMethod::from_string("other"), None);
    }
}
