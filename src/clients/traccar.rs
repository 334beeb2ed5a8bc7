//! Access-control client (Traccar-style GPS platform).
//!
//! Two authentication schemes are supported, selected at construction time
//! behind the `AuthScheme` strategy trait: a static bearer token, or a
//! cookie session that logs in with email/password and transparently
//! re-authenticates exactly once when a request comes back 401.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clients::evolution::digits_only;
use crate::error::AccessError;

/// A user record on the access-control platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraccarUser {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Remaining attributes, passed through untouched on updates.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Capabilities the reconciler consumes from the access-control system.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn get_users(&self) -> Result<Vec<TraccarUser>, AccessError>;

    async fn get_user_by_id(&self, id: i64) -> Result<TraccarUser, AccessError>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<TraccarUser>, AccessError>;

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<TraccarUser>, AccessError>;

    async fn block_user(&self, id: i64) -> Result<(), AccessError>;

    async fn unblock_user(&self, id: i64) -> Result<(), AccessError>;
}

// ── Auth strategies ─────────────────────────────────────────────────

/// Authentication strategy applied to every outgoing request.
#[async_trait]
pub trait AuthScheme: Send + Sync {
    /// Attach credentials to a request.
    async fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder;

    /// Try to re-establish credentials after a 401. Returns `false` when the
    /// scheme has no way to (static tokens).
    async fn reauthenticate(
        &self,
        http: &reqwest::Client,
        base_url: &str,
    ) -> Result<bool, AccessError>;
}

/// Static bearer token.
pub struct BearerAuth {
    token: SecretString,
}

impl BearerAuth {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthScheme for BearerAuth {
    async fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(self.token.expose_secret())
    }

    async fn reauthenticate(
        &self,
        _http: &reqwest::Client,
        _base_url: &str,
    ) -> Result<bool, AccessError> {
        Ok(false)
    }
}

/// Cookie session established by a login call.
pub struct SessionAuth {
    email: String,
    password: SecretString,
    cookie: RwLock<Option<String>>,
}

impl SessionAuth {
    pub fn new(email: impl Into<String>, password: SecretString) -> Self {
        Self {
            email: email.into(),
            password,
            cookie: RwLock::new(None),
        }
    }
}

#[async_trait]
impl AuthScheme for SessionAuth {
    async fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.cookie.read().await.as_deref() {
            Some(cookie) => req.header(reqwest::header::COOKIE, cookie),
            None => req,
        }
    }

    async fn reauthenticate(
        &self,
        http: &reqwest::Client,
        base_url: &str,
    ) -> Result<bool, AccessError> {
        let url = format!("{base_url}/api/session");
        let response = http
            .post(&url)
            .form(&[
                ("email", self.email.as_str()),
                ("password", self.password.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| AccessError::SessionRenewalFailed {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(AccessError::AuthFailed {
                reason: format!("login returned {}", response.status()),
            });
        }

        let cookie = response
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(String::from)
            .ok_or_else(|| AccessError::SessionRenewalFailed {
                reason: "login response carried no session cookie".to_string(),
            })?;

        debug!("Access-control session established");
        *self.cookie.write().await = Some(cookie);
        Ok(true)
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Traccar REST client.
pub struct TraccarClient {
    base_url: String,
    auth: Box<dyn AuthScheme>,
    http: reqwest::Client,
}

impl TraccarClient {
    pub fn new(base_url: impl Into<String>, auth: Box<dyn AuthScheme>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            http: reqwest::Client::new(),
        }
    }

    /// Issue a request, retrying exactly once after a 401 if the auth scheme
    /// can re-establish credentials.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, AccessError> {
        let mut reauthenticated = false;

        loop {
            let url = format!("{}{path}", self.base_url);
            let mut req = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }
            req = self.auth.apply(req).await;

            let response = req.send().await.map_err(|e| AccessError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!(path, "Access-control request unauthorized, re-authenticating");
                if self.auth.reauthenticate(&self.http, &self.base_url).await? {
                    reauthenticated = true;
                    continue;
                }
                return Err(AccessError::AuthFailed {
                    reason: "request unauthorized and scheme cannot re-authenticate".to_string(),
                });
            }

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(AccessError::RequestFailed {
                    endpoint: path.to_string(),
                    reason: format!("{status}: {text}"),
                });
            }

            return Ok(response);
        }
    }

    /// Flip the `disabled` attribute on a user via a full-record update.
    async fn set_disabled(&self, id: i64, disabled: bool) -> Result<(), AccessError> {
        let mut user = self.get_user_by_id(id).await?;
        user.disabled = disabled;

        let body = serde_json::to_value(&user).map_err(|e| AccessError::RequestFailed {
            endpoint: format!("/api/users/{id}"),
            reason: e.to_string(),
        })?;

        self.request(Method::PUT, &format!("/api/users/{id}"), Some(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccessControl for TraccarClient {
    async fn get_users(&self) -> Result<Vec<TraccarUser>, AccessError> {
        let response = self.request(Method::GET, "/api/users", None).await?;
        response
            .json()
            .await
            .map_err(|e| AccessError::RequestFailed {
                endpoint: "/api/users".to_string(),
                reason: e.to_string(),
            })
    }

    async fn get_user_by_id(&self, id: i64) -> Result<TraccarUser, AccessError> {
        // The platform has no single-user endpoint for non-admin tokens;
        // filter the listing instead.
        self.get_users()
            .await?
            .into_iter()
            .find(|u| u.id == id)
            .ok_or(AccessError::UserNotFound {
                query: format!("id={id}"),
            })
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<TraccarUser>, AccessError> {
        let users = self.get_users().await?;
        Ok(users
            .into_iter()
            .find(|u| matches_email(u.email.as_deref(), email)))
    }

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<TraccarUser>, AccessError> {
        let wanted = digits_only(phone);
        if wanted.is_empty() {
            return Ok(None);
        }
        let users = self.get_users().await?;
        Ok(users
            .into_iter()
            .find(|u| matches_phone(u.phone.as_deref(), &wanted)))
    }

    async fn block_user(&self, id: i64) -> Result<(), AccessError> {
        self.set_disabled(id, true).await
    }

    async fn unblock_user(&self, id: i64) -> Result<(), AccessError> {
        self.set_disabled(id, false).await
    }
}

// ── Matching helpers ────────────────────────────────────────────────

fn matches_email(candidate: Option<&str>, wanted: &str) -> bool {
    candidate.is_some_and(|c| c.eq_ignore_ascii_case(wanted.trim()))
}

/// Phones match on digits, tolerating a country-prefix difference on
/// either side.
fn matches_phone(candidate: Option<&str>, wanted_digits: &str) -> bool {
    let Some(candidate) = candidate else {
        return false;
    };
    let candidate = digits_only(candidate);
    if candidate.is_empty() {
        return false;
    }
    candidate == wanted_digits
        || candidate.ends_with(wanted_digits)
        || wanted_digits.ends_with(&candidate)
}

// ── Tests ───────────────────────────────────────────────────────────
