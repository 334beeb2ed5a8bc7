//! Invoice categorization — a pure function of (status, due date, today,
//! notice window).
//!
//! Rules, first match wins:
//! 1. Paid (RECEIVED/CONFIRMED) → `processada`, regardless of date math.
//! 2. OVERDUE, or due before today → `atraso`.
//! 3. Due today → `vence_hoje`.
//! 4. Due exactly `notice_days` from today → `aviso`.
//! 5. Anything else → `processada`.
//!
//! Both sides of every comparison are `NaiveDate`s, so the day difference is
//! exact calendar arithmetic — no daylight-saving or fractional-day
//! artifacts to compensate for.

use chrono::NaiveDate;

use crate::model::{Category, Invoice};

/// Classify a single invoice.
pub fn categorize(invoice: &Invoice, notice_days: i64, today: NaiveDate) -> Category {
    if invoice.status.is_paid() {
        return Category::Processada;
    }

    let days_until_due = (invoice.due_date - today).num_days();

    if invoice.status == crate::model::InvoiceStatus::Overdue || days_until_due < 0 {
        Category::Atraso
    } else if days_until_due == 0 {
        Category::VenceHoje
    } else if days_until_due == notice_days {
        Category::Aviso
    } else {
        Category::Processada
    }
}

/// Tag every invoice in place. Same cardinality in, same out.
pub fn categorize_all(invoices: &mut [Invoice], notice_days: i64, today: NaiveDate) {
    for invoice in invoices.iter_mut() {
        invoice.category = Some(categorize(invoice, notice_days, today));
    }
}
