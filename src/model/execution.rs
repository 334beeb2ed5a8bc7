//! Execution records — one per end-to-end run of fetch → categorize →
//! dispatch, with per-invoice log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::invoice::Category;

/// Lifecycle of an execution. `Completed` and `Failed` are terminal; a
/// terminal record is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// One end-to-end run with aggregate counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// Invoices that fell into an actionable category this run.
    pub invoices_processed: i64,
    pub messages_sent: i64,
    pub users_blocked: i64,
    pub errors: i64,
}

impl Execution {
    /// A new run in the `running` state with zeroed counts.
    pub fn started() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            status: ExecutionStatus::Running,
            invoices_processed: 0,
            messages_sent: 0,
            users_blocked: 0,
            errors: 0,
        }
    }
}

/// Outcome of a single dispatch attempt (or skip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Success,
    Error,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOutcome::Success => "success",
            LogOutcome::Error => "error",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "success" => LogOutcome::Success,
            _ => LogOutcome::Error,
        }
    }
}

/// Append-only per-invoice log entry attached to exactly one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub invoice_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub category: Category,
    pub outcome: LogOutcome,
    /// Rendered message on success, reason or failure text on error.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn success(
        execution_id: Uuid,
        invoice: &crate::model::Invoice,
        category: Category,
        detail: impl Into<String>,
    ) -> Self {
        Self::entry(execution_id, invoice, category, LogOutcome::Success, detail)
    }

    pub fn error(
        execution_id: Uuid,
        invoice: &crate::model::Invoice,
        category: Category,
        detail: impl Into<String>,
    ) -> Self {
        Self::entry(execution_id, invoice, category, LogOutcome::Error, detail)
    }

    fn entry(
        execution_id: Uuid,
        invoice: &crate::model::Invoice,
        category: Category,
        outcome: LogOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            invoice_id: invoice.id.clone(),
            customer_name: invoice.customer_name.clone(),
            customer_phone: invoice.customer_phone.clone(),
            category,
            outcome,
            detail: Some(detail.into()),
            created_at: Utc::now(),
        }
    }
}
