//! Error types for vigil.

use uuid::Uuid;

use crate::cooldown::ActionClass;
use crate::session::HubError;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Could not determine a data directory; set VIGIL_DATA_DIR")]
    NoDataDir,
}

/// Persistence errors, shared by every store backend.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Store at {path} is locked by another writer")]
    Locked { path: String },

    #[error("Store at {path} was opened read-only")]
    ReadOnly { path: String },

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Serialization(err.to_string())
    }
}

/// Rejection of an embedded marker. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkerError {
    #[error("unknown event level '{0}'")]
    UnknownLevel(String),

    #[error("unknown memory category '{0}'")]
    UnknownCategory(String),

    #[error("{kind} marker has no body")]
    EmptyBody { kind: &'static str },
}

/// Errors surfaced by the session supervisor to the caller of `start`/`cancel`.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("A session is already running")]
    AlreadyRunning,

    #[error("Cooldown active: {action} on {service} is not permitted right now")]
    CooldownActive { service: String, action: ActionClass },

    #[error("Invalid tier {tier}, expected 1..={max}")]
    InvalidTier { tier: u8, max: u8 },

    #[error("Failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("No session is running")]
    NotRunning,

    #[error("Session {0} not found")]
    UnknownSession(Uuid),

    #[error("Live output unavailable: {0}")]
    Hub(#[from] HubError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
