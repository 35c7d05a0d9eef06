//! File-backed store: one JSON document per collection.
//!
//! ```text
//! <data_dir>/
//!   vigil.lock        exclusive advisory lock held by the writer process
//!   sessions.json
//!   events.json
//!   memories.json
//!   cooldowns.json
//!   logs/<id>.jsonl   raw agent output (see SessionLogs)
//! ```
//!
//! Every mutation builds the new collection, writes it to a temp file,
//! fsyncs, and renames it over the old file before swapping it into memory.
//! A crash can lose the latest write but never leaves a half-written file.
//!
//! Only one writer may hold a data directory. Read-only handles take no lock
//! and reload a collection from disk on every read, so they observe either
//! the previous or the next version of a file while the writer runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cooldown::{CooldownChange, CooldownRecord};
use crate::db::{Database, EventFilter, sort_by_confidence};
use crate::error::DatabaseError;
use crate::event::Event;
use crate::memory::{Memory, MemoryChange, MemoryFilter};
use crate::session::{Session, SessionOutcome, SessionStatus};

const LOCK_FILE: &str = "vigil.lock";

#[derive(Debug, Clone, Copy)]
enum Collection {
    Sessions,
    Events,
    Memories,
    Cooldowns,
}

impl Collection {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Sessions => "sessions.json",
            Self::Events => "events.json",
            Self::Memories => "memories.json",
            Self::Cooldowns => "cooldowns.json",
        }
    }
}

#[derive(Debug, Default)]
struct State {
    sessions: Vec<Session>,
    events: Vec<Event>,
    memories: Vec<Memory>,
    cooldowns: BTreeMap<String, CooldownRecord>,
}

impl State {
    async fn load(dir: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            sessions: load(dir, Collection::Sessions).await?,
            events: load(dir, Collection::Events).await?,
            memories: load(dir, Collection::Memories).await?,
            cooldowns: load(dir, Collection::Cooldowns).await?,
        })
    }
}

/// JSON file store.
pub struct JsonStore {
    dir: PathBuf,
    state: RwLock<State>,
    /// Writer lock; `None` for read-only handles.
    lock: Option<std::fs::File>,
}

impl JsonStore {
    /// Open (or create) a store in `dir`, taking the writer lock.
    pub async fn open(dir: &Path) -> Result<Self, DatabaseError> {
        tokio::fs::create_dir_all(dir).await?;
        let lock = acquire_lock(dir)?;
        let state = State::load(dir).await?;

        tracing::info!(
            dir = %dir.display(),
            sessions = state.sessions.len(),
            memories = state.memories.len(),
            "Opened JSON store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            lock: Some(lock),
        })
    }

    /// Open a store for reading alongside a running writer.
    ///
    /// A missing directory reads as empty. Every mutation fails with
    /// `DatabaseError::ReadOnly`.
    pub async fn open_read_only(dir: &Path) -> Result<Self, DatabaseError> {
        let state = State::load(dir).await?;
        tracing::debug!(dir = %dir.display(), "Opened JSON store read-only");
        Ok(Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            lock: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    fn ensure_writable(&self) -> Result<(), DatabaseError> {
        if self.is_read_only() {
            return Err(DatabaseError::ReadOnly {
                path: self.dir.display().to_string(),
            });
        }
        Ok(())
    }

    /// Pick up the writer's latest version of `collection`. A no-op for the
    /// writer itself, whose in-memory state is authoritative.
    async fn refresh(&self, collection: Collection) -> Result<(), DatabaseError> {
        if !self.is_read_only() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        match collection {
            Collection::Sessions => state.sessions = load(&self.dir, collection).await?,
            Collection::Events => state.events = load(&self.dir, collection).await?,
            Collection::Memories => state.memories = load(&self.dir, collection).await?,
            Collection::Cooldowns => state.cooldowns = load(&self.dir, collection).await?,
        }
        Ok(())
    }

    async fn persist<T: Serialize + ?Sized>(
        &self,
        collection: Collection,
        value: &T,
    ) -> Result<(), DatabaseError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(&self.dir.join(collection.file_name()), &bytes).await
    }
}

fn acquire_lock(dir: &Path) -> Result<std::fs::File, DatabaseError> {
    let path = dir.join(LOCK_FILE);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| DatabaseError::Locked {
            path: path.display().to_string(),
        })?;
    Ok(file)
}

async fn load<T: DeserializeOwned + Default>(
    dir: &Path,
    collection: Collection,
) -> Result<T, DatabaseError> {
    let path = dir.join(collection.file_name());
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            DatabaseError::Serialization(format!("{}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write-new-then-swap.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DatabaseError> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn session_not_found(id: Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "session",
        id: id.to_string(),
    }
}

#[async_trait]
impl Database for JsonStore {
    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        if state.sessions.iter().any(|s| s.id == session.id) {
            return Err(DatabaseError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        let mut sessions = state.sessions.clone();
        sessions.push(session.clone());
        self.persist(Collection::Sessions, &sessions).await?;
        state.sessions = sessions;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        self.refresh(Collection::Sessions).await?;
        let state = self.state.read().await;
        Ok(state.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, DatabaseError> {
        self.refresh(Collection::Sessions).await?;
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state.sessions.clone();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn finish_session(
        &self,
        id: Uuid,
        outcome: &SessionOutcome,
    ) -> Result<Session, DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        let mut sessions = state.sessions.clone();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| session_not_found(id))?;
        if !session.finish(outcome) {
            return Err(DatabaseError::Conflict(format!(
                "session {} is already {}",
                id, session.status
            )));
        }
        let finished = session.clone();
        self.persist(Collection::Sessions, &sessions).await?;
        state.sessions = sessions;
        Ok(finished)
    }

    async fn set_session_summary(&self, id: Uuid, summary: &str) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        let mut sessions = state.sessions.clone();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| session_not_found(id))?;
        session.summary = Some(summary.to_string());
        self.persist(Collection::Sessions, &sessions).await?;
        state.sessions = sessions;
        Ok(())
    }

    async fn list_running_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        self.refresh(Collection::Sessions).await?;
        let state = self.state.read().await;
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Running)
            .cloned()
            .collect())
    }

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        let mut events = state.events.clone();
        events.push(event.clone());
        self.persist(Collection::Events, &events).await?;
        state.events = events;
        Ok(())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, DatabaseError> {
        self.refresh(Collection::Events).await?;
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn insert_memory(&self, memory: &Memory) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        let mut memories = state.memories.clone();
        memories.push(memory.clone());
        self.persist(Collection::Memories, &memories).await?;
        state.memories = memories;
        Ok(())
    }

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>, DatabaseError> {
        self.refresh(Collection::Memories).await?;
        let state = self.state.read().await;
        Ok(state.memories.iter().find(|m| m.id == id).cloned())
    }

    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, DatabaseError> {
        self.refresh(Collection::Memories).await?;
        let state = self.state.read().await;
        let mut memories: Vec<Memory> = state
            .memories
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_by_confidence(&mut memories);
        Ok(memories)
    }

    async fn modify_memory(
        &self,
        id: Uuid,
        change: &MemoryChange,
    ) -> Result<Memory, DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        let mut memories = state.memories.clone();
        let memory = memories
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "memory",
                id: id.to_string(),
            })?;
        memory.apply(change);
        let updated = memory.clone();
        self.persist(Collection::Memories, &memories).await?;
        state.memories = memories;
        Ok(updated)
    }

    async fn delete_memory(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        if !state.memories.iter().any(|m| m.id == id) {
            return Ok(false);
        }
        let memories: Vec<Memory> = state
            .memories
            .iter()
            .filter(|m| m.id != id)
            .cloned()
            .collect();
        self.persist(Collection::Memories, &memories).await?;
        state.memories = memories;
        Ok(true)
    }

    async fn get_cooldown(&self, service: &str) -> Result<CooldownRecord, DatabaseError> {
        self.refresh(Collection::Cooldowns).await?;
        let state = self.state.read().await;
        Ok(state
            .cooldowns
            .get(service)
            .cloned()
            .unwrap_or_else(|| CooldownRecord::empty(service)))
    }

    async fn modify_cooldown(
        &self,
        service: &str,
        change: &CooldownChange,
    ) -> Result<CooldownRecord, DatabaseError> {
        self.ensure_writable()?;
        let mut state = self.state.write().await;
        let mut cooldowns = state.cooldowns.clone();
        let record = cooldowns
            .entry(service.to_string())
            .or_insert_with(|| CooldownRecord::empty(service));
        record.apply(change);
        let updated = record.clone();
        self.persist(Collection::Cooldowns, &cooldowns).await?;
        state.cooldowns = cooldowns;
        Ok(updated)
    }

    async fn list_cooldowns(&self) -> Result<Vec<CooldownRecord>, DatabaseError> {
        self.refresh(Collection::Cooldowns).await?;
        let state = self.state.read().await;
        Ok(state.cooldowns.values().cloned().collect())
    }
}
