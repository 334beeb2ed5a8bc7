//! Message rendering — literal substitution of `{{token}}` placeholders
//! into the category's template.
//!
//! Substitution is global (every occurrence) and literal: `str::replace`
//! only, so neither the tokens nor the substituted values are ever treated
//! as patterns. A token present in the template but unknown to the renderer
//! stays as-is; that is accepted behavior, not an error.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::model::Invoice;

/// Rendered in place of the overdue total when it is unknown.
const TOTAL_FALLBACK: &str = "consulte sua fatura";

/// Substitute all placeholder tokens into `template`.
///
/// `overdue_count`/`overdue_total` describe the customer's overdue group and
/// are only meaningful for overdue templates; for the other categories pass
/// `None` and the tokens fall back to the invoice itself.
pub fn render(
    invoice: &Invoice,
    template: &str,
    notice_days: i64,
    overdue_count: Option<usize>,
    overdue_total: Option<Decimal>,
) -> String {
    let count = overdue_count.unwrap_or(1).to_string();
    let total = overdue_total
        .map(format_brl)
        .unwrap_or_else(|| TOTAL_FALLBACK.to_string());

    template
        .replace("{{nome}}", &invoice.customer_name)
        .replace("{{valor}}", &format_brl(invoice.value))
        .replace("{{vencimento}}", &format_date(invoice.due_date))
        .replace("{{link}}", &invoice.invoice_url)
        .replace("{{dias_aviso}}", &notice_days.to_string())
        .replace("{{quantidade_cobrancas}}", &count)
        .replace("{{valor_total}}", &total)
}

/// Format a monetary value the Brazilian way: `R$ 1.234,56`.
pub fn format_brl(value: Decimal) -> String {
    let rounded = value.round_dp(2);
    let negative = rounded.is_sign_negative();
    let text = rounded.abs().to_string();

    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), format!("{f:0<2}")),
        None => (text, "00".to_string()),
    };

    // Group the integer part in threes from the right with dots.
    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(*c);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}R$ {grouped},{frac_part}")
}

/// Format a calendar date as `dd/MM/yyyy`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}
