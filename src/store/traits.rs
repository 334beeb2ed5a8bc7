//! Unified `Storage` trait — single async interface for all persistence.
//!
//! Everything the processing core touches goes through this trait: settings,
//! invoices, customers, executions with their logs, and the two throttle
//! tables. Backends: libSQL file database in production, `:memory:` in tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::DatabaseError;
use crate::model::{
    Category, ClientData, Execution, ExecutionLog, ExecutionStatus, Invoice, InvoiceStatus,
    MappingMethod,
};

/// Filter for invoice listings. `None` fields are not constrained.
#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub category: Option<Category>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Backend-agnostic storage trait covering the whole domain.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Load the settings singleton. `None` before first save.
    async fn load_settings(&self) -> Result<Option<Settings>, DatabaseError>;

    /// Persist the settings singleton (full replace).
    async fn save_settings(&self, settings: &Settings) -> Result<(), DatabaseError>;

    // ── Invoices ────────────────────────────────────────────────────

    /// Insert or replace an invoice, keyed on the provider id.
    async fn upsert_invoice(&self, invoice: &Invoice) -> Result<(), DatabaseError>;

    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>, DatabaseError>;

    async fn list_invoices(&self, filter: InvoiceFilter) -> Result<Vec<Invoice>, DatabaseError>;

    async fn set_invoice_category(&self, id: &str, category: Category)
    -> Result<(), DatabaseError>;

    async fn set_invoice_status(&self, id: &str, status: InvoiceStatus)
    -> Result<(), DatabaseError>;

    /// Remove local invoices whose ids the provider no longer reports.
    /// Returns the number of rows deleted.
    async fn delete_invoices_not_in(&self, keep_ids: &[String]) -> Result<usize, DatabaseError>;

    /// Current count of OVERDUE invoices for a provider customer id.
    async fn count_overdue_for_customer(&self, customer_id: &str)
    -> Result<i64, DatabaseError>;

    // ── Executions ──────────────────────────────────────────────────

    /// Create a new execution row (status `running`).
    async fn create_execution(&self, execution: &Execution) -> Result<(), DatabaseError>;

    /// Apply the single terminal update to a running execution. Fails with
    /// `Constraint` if the row is already terminal.
    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        invoices_processed: i64,
        messages_sent: i64,
        users_blocked: i64,
        errors: i64,
    ) -> Result<(), DatabaseError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, DatabaseError>;

    /// Most recent executions first.
    async fn list_executions(&self, limit: u32) -> Result<Vec<Execution>, DatabaseError>;

    /// Append a log entry to its execution.
    async fn append_log(&self, log: &ExecutionLog) -> Result<(), DatabaseError>;

    /// Logs for one execution in insertion order.
    async fn list_logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, DatabaseError>;

    // ── Customers ───────────────────────────────────────────────────

    /// Insert or update a customer, keyed on the external id. Local
    /// preferences and block state of an existing row are preserved.
    async fn upsert_client(&self, client: &ClientData) -> Result<(), DatabaseError>;

    async fn get_client_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ClientData>, DatabaseError>;

    async fn list_clients(&self) -> Result<Vec<ClientData>, DatabaseError>;

    async fn update_client_preferences(
        &self,
        external_id: &str,
        block_daily_messages: bool,
        overdue_notice_interval_days: i64,
    ) -> Result<(), DatabaseError>;

    async fn update_client_mapping(
        &self,
        external_id: &str,
        traccar_user_id: Option<i64>,
        method: Option<MappingMethod>,
    ) -> Result<(), DatabaseError>;

    /// Mirror the external block state. Call only after the external call
    /// has succeeded.
    async fn set_client_blocked(&self, external_id: &str, blocked: bool)
    -> Result<(), DatabaseError>;

    // ── Throttle records ────────────────────────────────────────────

    /// Date a message was last sent for this invoice, if ever.
    async fn invoice_last_sent(&self, invoice_id: &str)
    -> Result<Option<NaiveDate>, DatabaseError>;

    /// Record that a message went out for this invoice on `date`.
    async fn record_invoice_sent(&self, invoice_id: &str, date: NaiveDate)
    -> Result<(), DatabaseError>;

    /// Date of the last overdue reminder for this customer, if ever.
    async fn last_overdue_send(&self, customer_id: &str)
    -> Result<Option<NaiveDate>, DatabaseError>;

    /// Record an overdue reminder for this customer on `date`.
    async fn record_overdue_send(&self, customer_id: &str, date: NaiveDate)
    -> Result<(), DatabaseError>;
}
