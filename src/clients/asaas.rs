//! Payments-provider client (Asaas-style REST API).
//!
//! Listings are offset-paginated with a fixed page size; a fixed pause is
//! honored between pages so bulk syncs stay under the provider's rate
//! limits. Due dates arrive as `YYYY-MM-DD` strings and are parsed as
//! calendar dates — no timezone conversion, ever.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::ProviderError;
use crate::model::{Invoice, InvoiceStatus};

/// Fixed page size for all listings.
const PAGE_SIZE: u32 = 100;

/// Pause between pages, to stay clear of provider throttling.
const PAGE_DELAY: Duration = Duration::from_millis(1500);

/// Statuses aggregated by `list_all_invoices` (everything except DELETED).
const KNOWN_STATUSES: [InvoiceStatus; 4] = [
    InvoiceStatus::Pending,
    InvoiceStatus::Received,
    InvoiceStatus::Confirmed,
    InvoiceStatus::Overdue,
];

/// A customer record as the provider reports it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCustomer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile_phone: Option<String>,
}

impl ProviderCustomer {
    /// Preferred contact phone: mobile first, landline as fallback.
    pub fn contact_phone(&self) -> Option<&str> {
        self.mobile_phone
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.phone.as_deref().filter(|p| !p.is_empty()))
    }
}

/// Capabilities the orchestrator consumes from the payments provider.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn list_customers(&self) -> Result<Vec<ProviderCustomer>, ProviderError>;

    async fn list_invoices_by_status(
        &self,
        status: InvoiceStatus,
    ) -> Result<Vec<Invoice>, ProviderError>;

    /// Aggregate across the four known (non-deleted) statuses.
    async fn list_all_invoices(&self) -> Result<Vec<Invoice>, ProviderError> {
        let mut all = Vec::new();
        for status in KNOWN_STATUSES {
            all.extend(self.list_invoices_by_status(status).await?);
        }
        Ok(all)
    }

    async fn list_all_invoice_ids(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .list_all_invoices()
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

/// Paginated envelope the provider wraps every listing in.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct Page<T> {
    #[serde(default)]
    data: Vec<T>,
    #[serde(default, rename = "hasMore")]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentDto {
    id: String,
    customer: String,
    value: Decimal,
    due_date: String,
    status: String,
    #[serde(default)]
    invoice_url: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl PaymentDto {
    fn into_invoice(self) -> Result<Invoice, ProviderError> {
        // Calendar-date parse; the provider sends plain `YYYY-MM-DD`.
        let due_date = chrono::NaiveDate::parse_from_str(&self.due_date, "%Y-%m-%d").map_err(
            |e| ProviderError::InvalidResponse {
                endpoint: "payments".into(),
                reason: format!("bad dueDate '{}': {e}", self.due_date),
            },
        )?;

        Ok(Invoice {
            id: self.id,
            customer_id: self.customer,
            customer_name: String::new(),
            customer_phone: String::new(),
            value: self.value,
            due_date,
            status: InvoiceStatus::from_string(&self.status),
            invoice_url: self.invoice_url.unwrap_or_default(),
            description: self.description,
            category: None,
        })
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Asaas REST client.
pub struct AsaasClient {
    base_url: String,
    token: SecretString,
    http: reqwest::Client,
}

impl AsaasClient {
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Fetch one page of a listing.
    async fn fetch_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        offset: u32,
    ) -> Result<Page<T>, ProviderError> {
        let url = self.endpoint(path);
        let response = self
            .http
            .get(&url)
            .header("access_token", self.token.expose_secret())
            .query(query)
            .query(&[("offset", offset.to_string()), ("limit", PAGE_SIZE.to_string())])
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                return Err(ProviderError::AuthFailed);
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(ProviderError::RateLimited);
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::RequestFailed {
                    endpoint: path.to_string(),
                    reason: format!("{status}: {body}"),
                });
            }
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })
    }

    /// Walk every page of a listing into one materialized list.
    async fn fetch_all<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ProviderError> {
        let mut all = Vec::new();
        let mut offset = 0;

        loop {
            let page: Page<T> = self.fetch_page(path, query, offset).await?;
            let fetched = page.data.len();
            all.extend(page.data);

            debug!(path, offset, fetched, "Provider page fetched");

            if !page.has_more || fetched == 0 {
                break;
            }
            offset += PAGE_SIZE;
            tokio::time::sleep(PAGE_DELAY).await;
        }

        Ok(all)
    }
}

#[async_trait]
impl BillingProvider for AsaasClient {
    async fn list_customers(&self) -> Result<Vec<ProviderCustomer>, ProviderError> {
        self.fetch_all("customers", &[]).await
    }

    async fn list_invoices_by_status(
        &self,
        status: InvoiceStatus,
    ) -> Result<Vec<Invoice>, ProviderError> {
        let dtos: Vec<PaymentDto> = self
            .fetch_all("payments", &[("status", status.as_str().to_string())])
            .await?;
        dtos.into_iter().map(PaymentDto::into_invoice).collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let client = AsaasClient::new("https://api.example/v3/", SecretString::from("t"));
        assert_eq!(client.endpoint("customers"), "https://api.example/v3/customers");
    }

    #[test]
    fn payment_dto_maps_to_invoice() {
        let dto: PaymentDto = serde_json::from_str(
            r#"{
                "id": "pay_1",
                "customer": "cus_1",
                "value": 150.00,
                "dueDate": "2026-08-10",
                "status": "PENDING",
                "invoiceUrl": "https://pay.example/pay_1",
                "description": "Mensalidade"
            }"#,
        )
        .unwrap();

        let invoice = dto.into_invoice().unwrap();
        assert_eq!(invoice.id, "pay_1");
        assert_eq!(invoice.customer_id, "cus_1");
        assert_eq!(invoice.value, dec!(150.00));
        assert_eq!(
            invoice.due_date,
            chrono::NaiveDate::from_ymd_opt(2026, 8, 10).unwrap()
        );
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert!(invoice.category.is_none());
        // Snapshot fields are filled during enrichment, not here.
        assert!(invoice.customer_name.is_empty());
    }

    #[test]
    fn payment_dto_rejects_bad_due_date() {
        let dto: PaymentDto = serde_json::from_str(
            r#"{"id": "p", "customer": "c", "value": 1, "dueDate": "10/08/2026", "status": "PENDING"}"#,
        )
        .unwrap();
        assert!(dto.into_invoice().is_err());
    }

    #[test]
    fn page_envelope_defaults() {
        let page: Page<ProviderCustomer> = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(page.data.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn customer_contact_phone_prefers_mobile() {
        let customer: ProviderCustomer = serde_json::from_str(
            r#"{"id": "c", "name": "Maria", "phone": "1133334444", "mobilePhone": "11987654321"}"#,
        )
        .unwrap();
        assert_eq!(customer.contact_phone(), Some("11987654321"));
    }

    #[test]
    fn customer_contact_phone_falls_back_to_landline() {
        let customer: ProviderCustomer = serde_json::from_str(
            r#"{"id": "c", "name": "Maria", "phone": "1133334444", "mobilePhone": ""}"#,
        )
        .unwrap();
        assert_eq!(customer.contact_phone(), Some("1133334444"));
    }

    #[tokio::test]
    async fn request_against_unreachable_host_fails() {
        let client = AsaasClient::new("http://127.0.0.1:1", SecretString::from("t"));
        let result = client.list_customers().await;
        assert!(matches!(result, Err(ProviderError::RequestFailed { .. })));
    }
}
