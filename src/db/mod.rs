//! Durable store for sessions, events, memories and cooldown ledgers.
//!
//! Two backends implement [`Database`]: [`JsonStore`] (atomic JSON files in
//! a data directory) and [`PgStore`] (PostgreSQL). Raw agent output always
//! goes to per-session files through [`SessionLogs`], whichever backend holds
//! the records.

mod json;
mod log;
mod postgres;

pub use json::JsonStore;
pub use log::{SessionLogWriter, SessionLogs};
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{Config, DatabaseConfig};
use crate::cooldown::{CooldownChange, CooldownRecord};
use crate::error::DatabaseError;
use crate::event::{Event, EventLevel};
use crate::memory::{Memory, MemoryChange, MemoryFilter};
use crate::session::{Session, SessionOutcome};

/// Query over stored events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub level: Option<EventLevel>,
    pub service: Option<String>,
    pub session_id: Option<Uuid>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.level.is_none_or(|l| l == event.level)
            && self
                .service
                .as_deref()
                .is_none_or(|s| event.service.as_deref() == Some(s))
            && self.session_id.is_none_or(|id| id == event.session_id)
    }
}

/// Database abstraction layer.
///
/// Any number of readers may query concurrently; the supervisor, reconciler
/// and cooldown engine are the only writers. `modify_*` operations are
/// atomic read-modify-writes.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Sessions ---

    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError>;

    /// Newest first.
    async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, DatabaseError>;

    /// The one terminal write. Fails with `Conflict` if the session has
    /// already left `running`.
    async fn finish_session(
        &self,
        id: Uuid,
        outcome: &SessionOutcome,
    ) -> Result<Session, DatabaseError>;

    async fn set_session_summary(&self, id: Uuid, summary: &str) -> Result<(), DatabaseError>;

    async fn list_running_sessions(&self) -> Result<Vec<Session>, DatabaseError>;

    // --- Events ---

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, DatabaseError>;

    // --- Memories ---

    async fn insert_memory(&self, memory: &Memory) -> Result<(), DatabaseError>;

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>, DatabaseError>;

    /// Highest confidence first.
    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, DatabaseError>;

    async fn modify_memory(
        &self,
        id: Uuid,
        change: &MemoryChange,
    ) -> Result<Memory, DatabaseError>;

    async fn delete_memory(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // --- Cooldowns ---

    /// Lookup-or-default: an unknown service yields an empty record.
    async fn get_cooldown(&self, service: &str) -> Result<CooldownRecord, DatabaseError>;

    async fn modify_cooldown(
        &self,
        service: &str,
        change: &CooldownChange,
    ) -> Result<CooldownRecord, DatabaseError>;

    async fn list_cooldowns(&self) -> Result<Vec<CooldownRecord>, DatabaseError>;
}

/// Open the backend selected by configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn Database>, DatabaseError> {
    match &config.database {
        DatabaseConfig::Json => {
            let store = JsonStore::open(&config.data_dir).await?;
            Ok(Arc::new(store))
        }
        DatabaseConfig::Postgres { url, pool_size } => {
            let store = PgStore::new(url, *pool_size).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Open the configured backend for reads only.
///
/// The JSON backend skips the writer lock so the CLI can inspect a store
/// while `vigil start` holds it. PostgreSQL needs no such distinction.
pub async fn connect_read_only(config: &Config) -> Result<Arc<dyn Database>, DatabaseError> {
    match &config.database {
        DatabaseConfig::Json => {
            let store = JsonStore::open_read_only(&config.data_dir).await?;
            Ok(Arc::new(store))
        }
        DatabaseConfig::Postgres { url, pool_size } => {
            let store = PgStore::new(url, *pool_size).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Sort memories the way `list_memories` returns them.
pub(crate) fn sort_by_confidence(memories: &mut [Memory]) {
    memories.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
}
