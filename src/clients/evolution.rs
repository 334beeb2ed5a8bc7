//! Messaging-channel client (Evolution-API-style WhatsApp gateway).
//!
//! The dispatch pipeline only depends on the `Messenger` trait; the concrete
//! client also exposes instance-management calls (restart, stop, QR code)
//! consumed by the HTTP surface.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MessengerError;

/// Minimum digit count for a dispatchable phone number.
pub const MIN_PHONE_DIGITS: usize = 10;

/// Brazilian country-code prefix added during normalization.
const COUNTRY_PREFIX: &str = "55";

/// Connection state of the messaging instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub status: String,
    pub connected: bool,
    pub phone: Option<String>,
}

/// What the dispatch pipeline consumes from the messaging channel.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a plain text message. Errors on transport failure or a
    /// non-success gateway response.
    async fn send_text(&self, phone: &str, message: &str) -> Result<bool, MessengerError>;

    async fn instance_status(&self) -> Result<InstanceStatus, MessengerError>;
}

// ── Phone helpers ───────────────────────────────────────────────────

/// Strip everything that is not an ASCII digit.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Whether a raw phone has enough digits to be dispatchable.
pub fn is_dispatchable_phone(raw: &str) -> bool {
    digits_only(raw).len() >= MIN_PHONE_DIGITS
}

/// Normalize a raw phone to the wire format the gateway expects:
/// digits only, with the country prefix.
pub fn normalize_msisdn(raw: &str) -> String {
    let digits = digits_only(raw);
    // Local numbers are 10 (landline) or 11 (mobile) digits; anything longer
    // starting with the prefix is assumed to already carry it.
    if digits.len() >= 12 && digits.starts_with(COUNTRY_PREFIX) {
        digits
    } else {
        format!("{COUNTRY_PREFIX}{digits}")
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Evolution API client for one named instance.
pub struct EvolutionClient {
    base_url: String,
    api_key: SecretString,
    instance: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ConnectionStateDto {
    #[serde(default)]
    instance: ConnectionStateInner,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionStateInner {
    #[serde(default)]
    state: String,
    #[serde(default, rename = "ownerJid")]
    owner_jid: Option<String>,
}

impl EvolutionClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            instance: instance.into(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}/{}", self.base_url, self.instance)
    }

    async fn check(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, MessengerError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(MessengerError::RequestFailed {
                endpoint: path.to_string(),
                reason: format!("{status}: {body}"),
            })
        }
    }

    /// Restart the instance.
    pub async fn restart(&self) -> Result<(), MessengerError> {
        let path = "instance/restart";
        let response = self
            .http
            .put(self.endpoint(path))
            .header("apikey", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| MessengerError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        self.check(path, response).await?;
        Ok(())
    }

    /// Disconnect the instance from the phone.
    pub async fn stop(&self) -> Result<(), MessengerError> {
        let path = "instance/logout";
        let response = self
            .http
            .delete(self.endpoint(path))
            .header("apikey", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| MessengerError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        self.check(path, response).await?;
        Ok(())
    }

    /// Pairing QR code as a base64 image string.
    pub async fn qr_code(&self) -> Result<String, MessengerError> {
        let path = "instance/connect";
        let response = self
            .http
            .get(self.endpoint(path))
            .header("apikey", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| MessengerError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        let response = self.check(path, response).await?;

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| MessengerError::RequestFailed {
                    endpoint: path.to_string(),
                    reason: e.to_string(),
                })?;

        body.get("base64")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| MessengerError::RequestFailed {
                endpoint: path.to_string(),
                reason: "response has no QR payload".to_string(),
            })
    }
}

#[async_trait]
impl Messenger for EvolutionClient {
    async fn send_text(&self, phone: &str, message: &str) -> Result<bool, MessengerError> {
        let number = normalize_msisdn(phone);
        if number.len() < MIN_PHONE_DIGITS {
            return Err(MessengerError::InvalidPhone(phone.to_string()));
        }

        let path = "message/sendText";
        let body = serde_json::json!({
            "number": number,
            "text": message,
        });

        let response = self
            .http
            .post(self.endpoint(path))
            .header("apikey", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| MessengerError::SendFailed {
                phone: number.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MessengerError::SendFailed {
                phone: number,
                reason: format!("{status}: {text}"),
            });
        }

        debug!(phone = %number, "Message dispatched");
        Ok(true)
    }

    async fn instance_status(&self) -> Result<InstanceStatus, MessengerError> {
        let path = "instance/connectionState";
        let response = self
            .http
            .get(self.endpoint(path))
            .header("apikey", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| MessengerError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        let response = self.check(path, response).await?;

        let dto: ConnectionStateDto =
            response
                .json()
                .await
                .map_err(|e| MessengerError::RequestFailed {
                    endpoint: path.to_string(),
                    reason: e.to_string(),
                })?;

        // The owner JID looks like `5511987654321@s.whatsapp.net`.
        let phone = dto
            .instance
            .owner_jid
            .as_deref()
            .and_then(|jid| jid.split('@').next())
            .map(String::from);

        Ok(InstanceStatus {
            connected: dto.instance.state == "open",
            status: dto.instance.state,
            phone,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
