//! HTTP trigger surface.
//!
//! Thin plumbing only: manual execution trigger, execution history reads,
//! settings read/update (masked secrets), messenger instance management,
//! and the payment webhook that drives the reconciler. All decisions live
//! in the core; handlers just wire storage and clients together.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::{EvolutionClient, Messenger};
use crate::config::Settings;
use crate::core::{Orchestrator, Reconciler};
use crate::error::Error;
use crate::store::Storage;

/// Webhook events that mean "this payment is in".
const PAYMENT_EVENTS: [&str; 2] = ["PAYMENT_CONFIRMED", "PAYMENT_RECEIVED"];

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Storage>,
}

/// Build the Axum router.
pub fn api_routes(store: Arc<dyn Storage>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/health", get(health))
        .route("/api/executions/run", post(run_execution))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/status", get(instance_status))
        .route("/api/instance/restart", post(instance_restart))
        .route("/api/instance/stop", post(instance_stop))
        .route("/api/instance/qrcode", get(instance_qrcode))
        .route("/api/webhooks/payment", post(payment_webhook))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

// ── Helpers ─────────────────────────────────────────────────────────

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.into() }))
}

async fn require_settings(
    store: &Arc<dyn Storage>,
) -> Result<Settings, (StatusCode, Json<serde_json::Value>)> {
    match store.load_settings().await {
        Ok(Some(settings)) => Ok(settings),
        Ok(None) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            error_body("service is not configured yet"),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(e.to_string()),
        )),
    }
}

fn messenger_from(settings: &Settings) -> EvolutionClient {
    EvolutionClient::new(
        &settings.messenger_url,
        secrecy::SecretString::from(settings.messenger_key.clone()),
        &settings.messenger_instance,
    )
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cobrador"
    }))
}

// ── Executions ──────────────────────────────────────────────────────

async fn run_execution(State(state): State<AppState>) -> impl IntoResponse {
    let settings = match require_settings(&state.store).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let orchestrator = Orchestrator::from_settings(state.store.clone(), &settings);
    match orchestrator.run(None).await {
        Ok(execution) => Json(execution).into_response(),
        Err(Error::Config(e)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, error_body(e.to_string())).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response(),
    }
}

async fn list_executions(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_executions(50).await {
        Ok(executions) => Json(executions).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response(),
    }
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let execution = match state.store.get_execution(id).await {
        Ok(Some(e)) => e,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("execution not found")).into_response();
        }
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
                .into_response();
        }
    };

    let logs = match state.store.list_logs(id).await {
        Ok(logs) => logs,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
                .into_response();
        }
    };

    Json(serde_json::json!({
        "execution": execution,
        "logs": logs,
    }))
    .into_response()
}

// ── Settings ────────────────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.load_settings().await {
        Ok(Some(settings)) => Json(settings.masked()).into_response(),
        Ok(None) => Json(Settings::default().masked()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response(),
    }
}

async fn update_settings(
    State(state): State<AppState>,
    Json(incoming): Json<Settings>,
) -> impl IntoResponse {
    let current = match state.store.load_settings().await {
        Ok(current) => current.unwrap_or_default(),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
                .into_response();
        }
    };

    // Masked secrets in the update keep their stored values.
    let resolved = Settings::merge_update(&current, incoming);
    match state.store.save_settings(&resolved).await {
        Ok(()) => {
            info!("Settings updated");
            Json(resolved.masked()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response(),
    }
}

// ── Messenger instance ──────────────────────────────────────────────

async fn instance_status(State(state): State<AppState>) -> impl IntoResponse {
    let settings = match require_settings(&state.store).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match messenger_from(&settings).instance_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, error_body(e.to_string())).into_response(),
    }
}

async fn instance_restart(State(state): State<AppState>) -> impl IntoResponse {
    let settings = match require_settings(&state.store).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match messenger_from(&settings).restart().await {
        Ok(()) => Json(serde_json::json!({ "restarted": true })).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, error_body(e.to_string())).into_response(),
    }
}

async fn instance_stop(State(state): State<AppState>) -> impl IntoResponse {
    let settings = match require_settings(&state.store).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match messenger_from(&settings).stop().await {
        Ok(()) => Json(serde_json::json!({ "stopped": true })).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, error_body(e.to_string())).into_response(),
    }
}

async fn instance_qrcode(State(state): State<AppState>) -> impl IntoResponse {
    let settings = match require_settings(&state.store).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match messenger_from(&settings).qr_code().await {
        Ok(image) => Json(serde_json::json!({ "base64": image })).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, error_body(e.to_string())).into_response(),
    }
}

// ── Payment webhook ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PaymentWebhook {
    event: String,
    payment: PaymentRef,
}

#[derive(Debug, Deserialize)]
struct PaymentRef {
    id: String,
}

async fn payment_webhook(
    State(state): State<AppState>,
    Json(webhook): Json<PaymentWebhook>,
) -> impl IntoResponse {
    if !PAYMENT_EVENTS.contains(&webhook.event.as_str()) {
        // Not ours; acknowledge so the provider stops retrying.
        return Json(serde_json::json!({ "received": true, "handled": false })).into_response();
    }

    let settings = match require_settings(&state.store).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let reconciler = Reconciler::from_settings(state.store.clone(), &settings);
    match reconciler
        .on_payment_confirmed(&webhook.payment.id, &settings)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "received": true, "handled": true })).into_response(),
        Err(e) => {
            warn!(payment = %webhook.payment.id, error = %e, "Payment webhook failed");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response()
        }
    }
}
