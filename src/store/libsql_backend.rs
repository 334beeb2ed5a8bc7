//! libSQL backend — async `Storage` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339; calendar dates (due dates, throttle dates) as `YYYY-MM-DD`
//! and read back without any timezone shifting.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::DatabaseError;
use crate::model::{
    Category, ClientData, Execution, ExecutionLog, ExecutionStatus, Invoice, InvoiceStatus,
    LogOutcome, MappingMethod,
};
use crate::store::migrations;
use crate::store::traits::{InvoiceFilter, Storage};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Parse a `YYYY-MM-DD` date column. No timezone is involved.
fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("bad date '{s}': {e}")))
}

fn parse_decimal(s: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(s).map_err(|e| DatabaseError::Serialization(format!("bad decimal '{s}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const INVOICE_COLUMNS: &str =
    "id, customer_id, customer_name, customer_phone, value, due_date, status, invoice_url, \
     description, category";

fn row_to_invoice(row: &libsql::Row) -> Result<Invoice, DatabaseError> {
    let value_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let due_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let status_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let category_str: Option<String> = row.get(9).ok();

    Ok(Invoice {
        id: row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?,
        customer_id: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
        customer_name: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
        customer_phone: row.get(3).map_err(|e| DatabaseError::Query(e.to_string()))?,
        value: parse_decimal(&value_str)?,
        due_date: parse_date(&due_str)?,
        status: InvoiceStatus::from_string(&status_str),
        invoice_url: row.get(7).map_err(|e| DatabaseError::Query(e.to_string()))?,
        description: row.get(8).ok(),
        category: category_str.as_deref().and_then(Category::from_string),
    })
}

const CLIENT_COLUMNS: &str =
    "id, external_id, name, email, phone, block_daily_messages, overdue_notice_interval_days, \
     traccar_user_id, mapping_method, is_traccar_blocked, created_at, updated_at";

fn row_to_client(row: &libsql::Row) -> Result<ClientData, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let block_daily: i64 = row
        .get(5)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let blocked: i64 = row
        .get(9)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let mapping_str: Option<String> = row.get(8).ok();
    let created_str: String = row
        .get(10)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let updated_str: String = row
        .get(11)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    Ok(ClientData {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        external_id: row.get(1).map_err(|e| DatabaseError::Query(e.to_string()))?,
        name: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
        email: row.get(3).ok(),
        phone: row.get(4).ok(),
        block_daily_messages: block_daily != 0,
        overdue_notice_interval_days: row
            .get(6)
            .map_err(|e| DatabaseError::Query(e.to_string()))?,
        traccar_user_id: row.get(7).ok(),
        mapping_method: mapping_str.as_deref().and_then(MappingMethod::from_string),
        is_traccar_blocked: blocked != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const EXECUTION_COLUMNS: &str =
    "id, started_at, finished_at, status, invoices_processed, messages_sent, users_blocked, errors";

fn row_to_execution(row: &libsql::Row) -> Result<Execution, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let started_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let finished_str: Option<String> = row.get(2).ok();
    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    Ok(Execution {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        started_at: parse_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
        status: ExecutionStatus::from_string(&status_str),
        invoices_processed: row.get(4).map_err(|e| DatabaseError::Query(e.to_string()))?,
        messages_sent: row.get(5).map_err(|e| DatabaseError::Query(e.to_string()))?,
        users_blocked: row.get(6).map_err(|e| DatabaseError::Query(e.to_string()))?,
        errors: row.get(7).map_err(|e| DatabaseError::Query(e.to_string()))?,
    })
}

const LOG_COLUMNS: &str =
    "id, execution_id, invoice_id, customer_name, customer_phone, category, outcome, detail, \
     created_at";

fn row_to_log(row: &libsql::Row) -> Result<ExecutionLog, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let exec_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let category_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let outcome_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let created_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    Ok(ExecutionLog {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        execution_id: Uuid::parse_str(&exec_str).unwrap_or_else(|_| Uuid::nil()),
        invoice_id: row.get(2).map_err(|e| DatabaseError::Query(e.to_string()))?,
        customer_name: row.get(3).map_err(|e| DatabaseError::Query(e.to_string()))?,
        customer_phone: row.get(4).map_err(|e| DatabaseError::Query(e.to_string()))?,
        category: Category::from_string(&category_str).unwrap_or(Category::Processada),
        outcome: LogOutcome::from_string(&outcome_str),
        detail: row.get(7).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Storage for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn load_settings(&self) -> Result<Option<Settings>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE id = 1", ())
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let json: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
                let settings = serde_json::from_str(&json)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &Settings) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(settings)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO settings (id, value, updated_at) VALUES (1, ?1, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET value = excluded.value,
                                               updated_at = datetime('now')",
                params![json],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    // ── Invoices ────────────────────────────────────────────────────

    async fn upsert_invoice(&self, invoice: &Invoice) -> Result<(), DatabaseError> {
        // Category is deliberately not touched on conflict: sync refreshes
        // provider-owned fields, categorization owns the category column.
        self.conn()
            .execute(
                "INSERT INTO invoices
                     (id, customer_id, customer_name, customer_phone, value, due_date, status,
                      invoice_url, description, category, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                     customer_id = excluded.customer_id,
                     customer_name = excluded.customer_name,
                     customer_phone = excluded.customer_phone,
                     value = excluded.value,
                     due_date = excluded.due_date,
                     status = excluded.status,
                     invoice_url = excluded.invoice_url,
                     description = excluded.description,
                     updated_at = datetime('now')",
                params![
                    invoice.id.as_str(),
                    invoice.customer_id.as_str(),
                    invoice.customer_name.as_str(),
                    invoice.customer_phone.as_str(),
                    invoice.value.to_string(),
                    invoice.due_date.format("%Y-%m-%d").to_string(),
                    invoice.status.as_str(),
                    invoice.invoice_url.as_str(),
                    opt_text(invoice.description.as_deref()),
                    opt_text(invoice.category.map(|c| c.as_str())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_invoice(&self, id: &str) -> Result<Option<Invoice>, DatabaseError> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_invoice(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_invoices(&self, filter: InvoiceFilter) -> Result<Vec<Invoice>, DatabaseError> {
        let mut sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices");
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(category) = filter.category {
            values.push(libsql::Value::Text(category.as_str().to_string()));
            clauses.push(format!("category = ?{}", values.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY due_date, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_invoice(&row)?);
        }
        Ok(out)
    }

    async fn set_invoice_category(
        &self,
        id: &str,
        category: Category,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE invoices SET category = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![category.as_str(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn set_invoice_status(
        &self,
        id: &str,
        status: InvoiceStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE invoices SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn delete_invoices_not_in(&self, keep_ids: &[String]) -> Result<usize, DatabaseError> {
        if keep_ids.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> =
            (1..=keep_ids.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "DELETE FROM invoices WHERE id NOT IN ({})",
            placeholders.join(", ")
        );
        let values: Vec<libsql::Value> = keep_ids
            .iter()
            .map(|id| libsql::Value::Text(id.clone()))
            .collect();

        let deleted = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(deleted as usize)
    }

    async fn count_overdue_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM invoices WHERE customer_id = ?1 AND status = 'OVERDUE'",
                params![customer_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => row.get(0).map_err(|e| DatabaseError::Query(e.to_string())),
            None => Ok(0),
        }
    }

    // ── Executions ──────────────────────────────────────────────────

    async fn create_execution(&self, execution: &Execution) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO executions
                     (id, started_at, finished_at, status, invoices_processed, messages_sent,
                      users_blocked, errors)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7)",
                params![
                    execution.id.to_string(),
                    execution.started_at.to_rfc3339(),
                    execution.status.as_str(),
                    execution.invoices_processed,
                    execution.messages_sent,
                    execution.users_blocked,
                    execution.errors,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        invoices_processed: i64,
        messages_sent: i64,
        users_blocked: i64,
        errors: i64,
    ) -> Result<(), DatabaseError> {
        // Guard in the WHERE clause: terminal rows are never mutated again.
        let updated = self
            .conn()
            .execute(
                "UPDATE executions
                 SET status = ?1, finished_at = ?2, invoices_processed = ?3,
                     messages_sent = ?4, users_blocked = ?5, errors = ?6
                 WHERE id = ?7 AND status = 'running'",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    invoices_processed,
                    messages_sent,
                    users_blocked,
                    errors,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if updated == 0 {
            return Err(DatabaseError::Constraint(format!(
                "execution {id} is not running (missing or already terminal)"
            )));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, DatabaseError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_executions(&self, limit: u32) -> Result<Vec<Execution>, DatabaseError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions ORDER BY started_at DESC LIMIT ?1"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_execution(&row)?);
        }
        Ok(out)
    }

    async fn append_log(&self, log: &ExecutionLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO execution_logs
                     (id, execution_id, invoice_id, customer_name, customer_phone, category,
                      outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    log.id.to_string(),
                    log.execution_id.to_string(),
                    log.invoice_id.as_str(),
                    log.customer_name.as_str(),
                    log.customer_phone.as_str(),
                    log.category.as_str(),
                    log.outcome.as_str(),
                    opt_text(log.detail.as_deref()),
                    log.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn list_logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, DatabaseError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM execution_logs WHERE execution_id = ?1 ORDER BY rowid"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![execution_id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_log(&row)?);
        }
        Ok(out)
    }

    // ── Customers ───────────────────────────────────────────────────

    async fn upsert_client(&self, client: &ClientData) -> Result<(), DatabaseError> {
        // Preferences, mapping and block state are local; sync must not
        // clobber them on an existing row.
        self.conn()
            .execute(
                "INSERT INTO clients
                     (id, external_id, name, email, phone, block_daily_messages,
                      overdue_notice_interval_days, traccar_user_id, mapping_method,
                      is_traccar_blocked, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(external_id) DO UPDATE SET
                     name = excluded.name,
                     email = excluded.email,
                     phone = excluded.phone,
                     updated_at = excluded.updated_at",
                params![
                    client.id.to_string(),
                    client.external_id.as_str(),
                    client.name.as_str(),
                    opt_text(client.email.as_deref()),
                    opt_text(client.phone.as_deref()),
                    client.block_daily_messages as i64,
                    client.overdue_notice_interval_days,
                    opt_i64(client.traccar_user_id),
                    opt_text(client.mapping_method.map(|m| m.as_str())),
                    client.is_traccar_blocked as i64,
                    client.created_at.to_rfc3339(),
                    client.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_client_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ClientData>, DatabaseError> {
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE external_id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![external_id])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_client(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_clients(&self) -> Result<Vec<ClientData>, DatabaseError> {
        let sql = format!("SELECT {CLIENT_COLUMNS} FROM clients ORDER BY name");
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            out.push(row_to_client(&row)?);
        }
        Ok(out)
    }

    async fn update_client_preferences(
        &self,
        external_id: &str,
        block_daily_messages: bool,
        overdue_notice_interval_days: i64,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE clients
                 SET block_daily_messages = ?1, overdue_notice_interval_days = ?2,
                     updated_at = datetime('now')
                 WHERE external_id = ?3",
                params![
                    block_daily_messages as i64,
                    overdue_notice_interval_days,
                    external_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "client".into(),
                id: external_id.into(),
            });
        }
        Ok(())
    }

    async fn update_client_mapping(
        &self,
        external_id: &str,
        traccar_user_id: Option<i64>,
        method: Option<MappingMethod>,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE clients
                 SET traccar_user_id = ?1, mapping_method = ?2, updated_at = datetime('now')
                 WHERE external_id = ?3",
                params![
                    opt_i64(traccar_user_id),
                    opt_text(method.map(|m| m.as_str())),
                    external_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "client".into(),
                id: external_id.into(),
            });
        }
        Ok(())
    }

    async fn set_client_blocked(
        &self,
        external_id: &str,
        blocked: bool,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE clients
                 SET is_traccar_blocked = ?1, updated_at = datetime('now')
                 WHERE external_id = ?2",
                params![blocked as i64, external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "client".into(),
                id: external_id.into(),
            });
        }
        Ok(())
    }

    // ── Throttle records ────────────────────────────────────────────

    async fn invoice_last_sent(
        &self,
        invoice_id: &str,
    ) -> Result<Option<NaiveDate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_sent_date FROM invoice_sends WHERE invoice_id = ?1",
                params![invoice_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let s: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(parse_date(&s)?))
            }
            None => Ok(None),
        }
    }

    async fn record_invoice_sent(
        &self,
        invoice_id: &str,
        date: NaiveDate,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO invoice_sends (invoice_id, last_sent_date) VALUES (?1, ?2)
                 ON CONFLICT(invoice_id) DO UPDATE SET last_sent_date = excluded.last_sent_date",
                params![invoice_id, date.format("%Y-%m-%d").to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn last_overdue_send(
        &self,
        customer_id: &str,
    ) -> Result<Option<NaiveDate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_sent_date FROM overdue_sends WHERE customer_id = ?1",
                params![customer_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let s: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(parse_date(&s)?))
            }
            None => Ok(None),
        }
    }

    async fn record_overdue_send(
        &self,
        customer_id: &str,
        date: NaiveDate,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO overdue_sends (customer_id, last_sent_date) VALUES (?1, ?2)
                 ON CONFLICT(customer_id) DO UPDATE SET last_sent_date = excluded.last_sent_date",
                params![customer_id, date.format("%Y-%m-%d").to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_invoice(id: &str) -> Invoice {
        Invoice {
            id: id.to_string(),
            customer_id: "cus_1".into(),
            customer_name: "Maria Silva".into(),
            customer_phone: "11987654321".into(),
            value: dec!(150.00),
            due_date: NaiveDate::from_ymd_opt(2026, 8, 10).unwrap(),
            status: InvoiceStatus::Pending,
            invoice_url: "https://pay.example/abc".into(),
            description: Some("Mensalidade".into()),
            category: None,
        }
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        assert!(store.load_settings().await.unwrap().is_none());

        let mut settings = Settings::default();
        settings.provider_token = "tok_1".into();
        store.save_settings(&settings).await.unwrap();

        let loaded = store.load_settings().await.unwrap().unwrap();
        assert_eq!(loaded.provider_token, "tok_1");

        settings.provider_token = "tok_2".into();
        store.save_settings(&settings).await.unwrap();
        let loaded = store.load_settings().await.unwrap().unwrap();
        assert_eq!(loaded.provider_token, "tok_2");
    }

    #[tokio::test]
    async fn invoice_upsert_preserves_category() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut inv = sample_invoice("pay_1");
        store.upsert_invoice(&inv).await.unwrap();
        store
            .set_invoice_category("pay_1", Category::Atraso)
            .await
            .unwrap();

        // Re-sync with fresh provider data; category must survive.
        inv.value = dec!(175.50);
        store.upsert_invoice(&inv).await.unwrap();

        let loaded = store.get_invoice("pay_1").await.unwrap().unwrap();
        assert_eq!(loaded.value, dec!(175.50));
        assert_eq!(loaded.category, Some(Category::Atraso));
    }

    #[tokio::test]
    async fn invoice_filter_by_status_and_category() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut a = sample_invoice("pay_a");
        a.status = InvoiceStatus::Overdue;
        let b = sample_invoice("pay_b");
        store.upsert_invoice(&a).await.unwrap();
        store.upsert_invoice(&b).await.unwrap();
        store
            .set_invoice_category("pay_a", Category::Atraso)
            .await
            .unwrap();

        let overdue = store
            .list_invoices(InvoiceFilter {
                status: Some(InvoiceStatus::Overdue),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, "pay_a");

        let atraso = store
            .list_invoices(InvoiceFilter {
                category: Some(Category::Atraso),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(atraso.len(), 1);

        let all = store.list_invoices(InvoiceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn stale_invoices_are_deleted() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_invoice(&sample_invoice("pay_1")).await.unwrap();
        store.upsert_invoice(&sample_invoice("pay_2")).await.unwrap();
        store.upsert_invoice(&sample_invoice("pay_3")).await.unwrap();

        let deleted = store
            .delete_invoices_not_in(&["pay_1".to_string(), "pay_3".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_invoice("pay_2").await.unwrap().is_none());
        assert!(store.get_invoice("pay_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_with_empty_keep_list_is_a_noop() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        store.upsert_invoice(&sample_invoice("pay_1")).await.unwrap();
        let deleted = store.delete_invoices_not_in(&[]).await.unwrap();
        assert_eq!(deleted, 0);
        assert!(store.get_invoice("pay_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn execution_terminal_update_happens_once() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let exec = Execution::started();
        store.create_execution(&exec).await.unwrap();

        store
            .finish_execution(exec.id, ExecutionStatus::Completed, 5, 4, 0, 1)
            .await
            .unwrap();

        let loaded = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.invoices_processed, 5);
        assert!(loaded.finished_at.is_some());

        // Second terminal update must be rejected.
        let err = store
            .finish_execution(exec.id, ExecutionStatus::Failed, 0, 0, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn logs_are_listed_in_insertion_order() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let exec = Execution::started();
        store.create_execution(&exec).await.unwrap();

        let inv = sample_invoice("pay_1");
        for i in 0..3 {
            let log = ExecutionLog::error(exec.id, &inv, Category::Atraso, format!("reason {i}"));
            store.append_log(&log).await.unwrap();
        }

        let logs = store.list_logs(exec.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].detail.as_deref(), Some("reason 0"));
        assert_eq!(logs[2].detail.as_deref(), Some("reason 2"));
    }

    #[tokio::test]
    async fn client_upsert_preserves_local_state() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let client = ClientData::new("cus_1", "Maria", None, Some("11987654321".into()));
        store.upsert_client(&client).await.unwrap();
        store
            .update_client_preferences("cus_1", true, 7)
            .await
            .unwrap();
        store.set_client_blocked("cus_1", true).await.unwrap();

        // Sync again with a changed name; local state must survive.
        let resynced = ClientData::new("cus_1", "Maria Silva", None, None);
        store.upsert_client(&resynced).await.unwrap();

        let loaded = store.get_client_by_external_id("cus_1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Maria Silva");
        assert!(loaded.block_daily_messages);
        assert_eq!(loaded.overdue_notice_interval_days, 7);
        assert!(loaded.is_traccar_blocked);
    }

    #[tokio::test]
    async fn update_missing_client_is_not_found() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let err = store
            .update_client_preferences("cus_missing", false, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn overdue_count_tracks_status() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut a = sample_invoice("pay_a");
        a.status = InvoiceStatus::Overdue;
        let mut b = sample_invoice("pay_b");
        b.status = InvoiceStatus::Overdue;
        let c = sample_invoice("pay_c");
        store.upsert_invoice(&a).await.unwrap();
        store.upsert_invoice(&b).await.unwrap();
        store.upsert_invoice(&c).await.unwrap();

        assert_eq!(store.count_overdue_for_customer("cus_1").await.unwrap(), 2);

        store
            .set_invoice_status("pay_a", InvoiceStatus::Received)
            .await
            .unwrap();
        assert_eq!(store.count_overdue_for_customer("cus_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn throttle_records_roundtrip() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 8).unwrap();

        assert!(store.invoice_last_sent("pay_1").await.unwrap().is_none());
        store.record_invoice_sent("pay_1", today).await.unwrap();
        assert_eq!(store.invoice_last_sent("pay_1").await.unwrap(), Some(today));

        // Upsert moves the date forward.
        let tomorrow = today.succ_opt().unwrap();
        store.record_invoice_sent("pay_1", tomorrow).await.unwrap();
        assert_eq!(
            store.invoice_last_sent("pay_1").await.unwrap(),
            Some(tomorrow)
        );

        assert!(store.last_overdue_send("cus_1").await.unwrap().is_none());
        store.record_overdue_send("cus_1", today).await.unwrap();
        assert_eq!(store.last_overdue_send("cus_1").await.unwrap(), Some(today));
    }
}
