//! Operational configuration.
//!
//! `Settings` is a storage-backed singleton read before every execution, so
//! credentials and templates can be edited at runtime without a restart.
//! Secrets are masked when the struct is handed to the HTTP layer; an update
//! that carries the mask back keeps the stored value (see [`Settings::merge_update`]).

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sentinel returned in place of a stored secret. An incoming update equal to
/// this keeps the existing value.
pub const MASKED_SECRET: &str = "********";

/// Which authentication scheme the access-control client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraccarAuthMode {
    /// Static bearer token.
    #[default]
    Bearer,
    /// Cookie session via login; re-authenticates once on a 401.
    Session,
}

/// Message templates per category. Placeholders are literal `{{token}}`
/// strings substituted by the renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Templates {
    pub due_today: String,
    pub upcoming: String,
    pub overdue: String,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            due_today: "Olá {{nome}}! Sua fatura de {{valor}} vence hoje ({{vencimento}}). \
                        Pague em: {{link}}"
                .to_string(),
            upcoming: "Olá {{nome}}! Sua fatura de {{valor}} vence em {{dias_aviso}} dias \
                       ({{vencimento}}). Pague em: {{link}}"
                .to_string(),
            overdue: "Olá {{nome}}! Você tem {{quantidade_cobrancas}} fatura(s) em atraso, \
                      totalizando {{valor_total}}. Regularize em: {{link}}"
                .to_string(),
        }
    }
}

/// Operational configuration singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Payments provider
    pub provider_url: String,
    pub provider_token: String,

    // Messaging channel
    pub messenger_url: String,
    pub messenger_key: String,
    pub messenger_instance: String,

    // Access control
    pub traccar_url: String,
    pub traccar_auth: TraccarAuthMode,
    pub traccar_token: String,
    pub traccar_user: String,
    pub traccar_password: String,
    /// Overdue-invoice count at or above which a customer is blocked.
    pub overdue_block_threshold: i64,

    /// Days before the due date for the upcoming reminder.
    pub notice_days_ahead: i64,

    pub templates: Templates,

    /// Cron expression (seconds-resolution, `cron` crate syntax) for the
    /// daily trigger, evaluated in UTC-3.
    pub daily_cron: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_url: "https://api.asaas.com/v3".to_string(),
            provider_token: String::new(),
            messenger_url: String::new(),
            messenger_key: String::new(),
            messenger_instance: String::new(),
            traccar_url: String::new(),
            traccar_auth: TraccarAuthMode::Bearer,
            traccar_token: String::new(),
            traccar_user: String::new(),
            traccar_password: String::new(),
            overdue_block_threshold: 3,
            notice_days_ahead: 5,
            templates: Templates::default(),
            daily_cron: "0 0 9 * * *".to_string(),
        }
    }
}

/// Names of the secret fields, used by masking and merge.
const SECRET_FIELDS: &[&str] = &["provider_token", "messenger_key", "traccar_token", "traccar_password"];

impl Settings {
    /// Validate the credentials an execution needs. Called by the
    /// orchestrator before any execution record is created.
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        let required = [
            ("provider_token", &self.provider_token),
            ("messenger_url", &self.messenger_url),
            ("messenger_key", &self.messenger_key),
            ("messenger_instance", &self.messenger_instance),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: key.to_string(),
                    hint: "set it via the settings endpoint before triggering a run".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Copy with every non-empty secret replaced by [`MASKED_SECRET`].
    /// This is what the HTTP layer returns on reads.
    pub fn masked(&self) -> Settings {
        let mut out = self.clone();
        for field in SECRET_FIELDS {
            let slot = out.secret_field_mut(field);
            if !slot.is_empty() {
                *slot = MASKED_SECRET.to_string();
            }
        }
        out
    }

    /// Resolve an incoming update against the current settings: any secret
    /// field carrying the mask sentinel keeps its stored value. All other
    /// fields are taken from the update as-is.
    pub fn merge_update(current: &Settings, mut incoming: Settings) -> Settings {
        for field in SECRET_FIELDS {
            if incoming.secret_field(field) == MASKED_SECRET {
                let kept = current.secret_field(field).to_string();
                *incoming.secret_field_mut(field) = kept;
            }
        }
        incoming
    }

    fn secret_field(&self, name: &str) -> &str {
        match name {
            "provider_token" => &self.provider_token,
            "messenger_key" => &self.messenger_key,
            "traccar_token" => &self.traccar_token,
            "traccar_password" => &self.traccar_password,
            _ => unreachable!("unknown secret field {name}"),
        }
    }

    fn secret_field_mut(&mut self, name: &str) -> &mut String {
        match name {
            "provider_token" => &mut self.provider_token,
            "messenger_key" => &mut self.messenger_key,
            "traccar_token" => &mut self.traccar_token,
            "traccar_password" => &mut self.traccar_password,
            _ => unreachable!("unknown secret field {name}"),
        }
    }
}
