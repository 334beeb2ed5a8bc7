//! Invoice (cobrança) model.
//!
//! Invoices are owned by the payments provider; the local copy is a synced
//! snapshot keyed on the provider-assigned id. Due dates are calendar dates
//! (`NaiveDate`) end to end and are never timezone-shifted.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Provider-side lifecycle status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Received,
    Confirmed,
    Overdue,
    Deleted,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Received => "RECEIVED",
            InvoiceStatus::Confirmed => "CONFIRMED",
            InvoiceStatus::Overdue => "OVERDUE",
            InvoiceStatus::Deleted => "DELETED",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "RECEIVED" => InvoiceStatus::Received,
            "CONFIRMED" => InvoiceStatus::Confirmed,
            "OVERDUE" => InvoiceStatus::Overdue,
            "DELETED" => InvoiceStatus::Deleted,
            _ => InvoiceStatus::Pending,
        }
    }

    /// Statuses that count as paid, regardless of date math.
    pub fn is_paid(&self) -> bool {
        matches!(self, InvoiceStatus::Received | InvoiceStatus::Confirmed)
    }
}

/// Message category assigned by the categorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Due today.
    VenceHoje,
    /// Upcoming reminder (`notice_days_ahead` days before due).
    Aviso,
    /// Past due.
    Atraso,
    /// Nothing to do (paid, or not yet in any reminder window).
    Processada,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::VenceHoje => "vence_hoje",
            Category::Aviso => "aviso",
            Category::Atraso => "atraso",
            Category::Processada => "processada",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "vence_hoje" => Some(Category::VenceHoje),
            "aviso" => Some(Category::Aviso),
            "atraso" => Some(Category::Atraso),
            "processada" => Some(Category::Processada),
            _ => None,
        }
    }

    /// Whether invoices in this category are dispatch candidates.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Category::Processada)
    }
}

/// A single billable charge with a due date and lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    /// Provider-assigned stable id (primary key).
    pub id: String,
    /// Provider customer id this invoice belongs to.
    pub customer_id: String,
    /// Customer name snapshot taken at sync time.
    pub customer_name: String,
    /// Customer phone snapshot taken at sync time.
    pub customer_phone: String,
    pub value: Decimal,
    pub due_date: NaiveDate,
    pub status: InvoiceStatus,
    pub invoice_url: String,
    pub description: Option<String>,
    /// Set by the categorizer; `None` until the first categorization.
    pub category: Option<Category>,
}

impl Invoice {
    pub fn category_or_default(&self) -> Category {
        self.category.unwrap_or(Category::Processada)
    }
}
