//! Error types for cobrador.

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("Access-control error: {0}")]
    Access(#[from] AccessError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No configuration saved yet")]
    NotConfigured,
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Payments-provider client errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Invalid response from provider {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Provider authentication failed")]
    AuthFailed,

    #[error("Provider rate limited")]
    RateLimited,
}

/// Messaging-channel client errors.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("Failed to send message to {phone}: {reason}")]
    SendFailed { phone: String, reason: String },

    #[error("Messenger request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Messenger instance {instance} is not connected")]
    InstanceUnavailable { instance: String },

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),
}

/// Access-control client errors.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("Access-control request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Access-control authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Session renewal failed: {reason}")]
    SessionRenewalFailed { reason: String },

    #[error("Access-control user not found: {query}")]
    UserNotFound { query: String },
}

/// Execution lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution {id} not found")]
    NotFound { id: Uuid },

    #[error("Execution {id} is already in terminal state {state}")]
    AlreadyTerminal { id: Uuid, state: String },

    #[error("Execution {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
