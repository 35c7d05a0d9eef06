//! Turns extracted markers into store mutations.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::event::Event;
use crate::memory::{
    CONTRADICT_STEP, Memory, MemoryCategory, MemoryChange, MemoryEdit, MemoryFilter,
    REINFORCE_STEP, Relation, ScopeFilter, SimilarityThresholds, normalize_service, relate,
};
use crate::stream::{EventMarker, Marker, MemoryMarker};

/// Session a marker came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerOrigin {
    pub session_id: Uuid,
    pub tier: u8,
}

/// What a memory marker did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryOutcome {
    /// No related memory; stored as new.
    Inserted(Memory),
    /// A near-duplicate gained confidence; nothing new stored.
    Reinforced(Memory),
    /// A conflicting memory lost confidence and the new observation was stored.
    Contradicted { existing: Memory, inserted: Memory },
}

/// Applies event and memory markers from a running session.
pub struct Reconciler {
    store: Arc<dyn Database>,
    thresholds: SimilarityThresholds,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            thresholds: SimilarityThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: SimilarityThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Apply any marker, logging what happened.
    pub async fn apply(&self, marker: &Marker, origin: MarkerOrigin) -> Result<(), DatabaseError> {
        match marker {
            Marker::Event(event) => {
                let stored = self.apply_event(event, origin).await?;
                tracing::info!(
                    session_id = %origin.session_id,
                    level = %stored.level,
                    service = stored.service.as_deref().unwrap_or("general"),
                    "Event recorded: {}",
                    stored.message
                );
            }
            Marker::Memory(memory) => match self.apply_memory(memory, origin).await? {
                MemoryOutcome::Inserted(m) => {
                    tracing::info!(session_id = %origin.session_id, memory_id = %m.id, "Memory stored");
                }
                MemoryOutcome::Reinforced(m) => {
                    tracing::info!(
                        session_id = %origin.session_id,
                        memory_id = %m.id,
                        confidence = m.confidence,
                        "Memory reinforced"
                    );
                }
                MemoryOutcome::Contradicted { existing, inserted } => {
                    tracing::info!(
                        session_id = %origin.session_id,
                        memory_id = %existing.id,
                        confidence = existing.confidence,
                        active = existing.active,
                        new_memory_id = %inserted.id,
                        "Memory contradicted"
                    );
                }
            },
        }
        Ok(())
    }

    /// Events are never deduplicated.
    pub async fn apply_event(
        &self,
        marker: &EventMarker,
        origin: MarkerOrigin,
    ) -> Result<Event, DatabaseError> {
        let event = Event::new(
            origin.session_id,
            marker.level,
            marker.service.clone(),
            marker.message.clone(),
        );
        self.store.insert_event(&event).await?;
        Ok(event)
    }

    /// Reinforce, contradict, or insert.
    ///
    /// Only active memories with the same scope and category are candidates;
    /// the highest-scoring related one wins.
    pub async fn apply_memory(
        &self,
        marker: &MemoryMarker,
        origin: MarkerOrigin,
    ) -> Result<MemoryOutcome, DatabaseError> {
        let candidates = self
            .store
            .list_memories(&MemoryFilter {
                scope: ScopeFilter::exact(marker.service.as_deref()),
                category: Some(marker.category),
                active_only: true,
            })
            .await?;

        let mut best: Option<(&Memory, Relation)> = None;
        for candidate in &candidates {
            let relation = relate(&candidate.observation, &marker.observation, &self.thresholds);
            if relation == Relation::Unrelated {
                continue;
            }
            if best.is_none_or(|(_, b)| relation.score() > b.score()) {
                best = Some((candidate, relation));
            }
        }

        let fresh = || {
            Memory::new(
                marker.service.clone(),
                marker.category,
                marker.observation.clone(),
            )
            .with_origin(origin.session_id, origin.tier)
        };

        match best {
            Some((existing, Relation::Duplicate { .. })) => {
                let updated = self
                    .store
                    .modify_memory(
                        existing.id,
                        &MemoryChange::Adjust {
                            delta: REINFORCE_STEP,
                            at: Utc::now(),
                        },
                    )
                    .await?;
                Ok(MemoryOutcome::Reinforced(updated))
            }
            Some((existing, Relation::Contradiction { .. })) => {
                let updated = self
                    .store
                    .modify_memory(
                        existing.id,
                        &MemoryChange::Adjust {
                            delta: -CONTRADICT_STEP,
                            at: Utc::now(),
                        },
                    )
                    .await?;
                let inserted = fresh();
                self.store.insert_memory(&inserted).await?;
                Ok(MemoryOutcome::Contradicted {
                    existing: updated,
                    inserted,
                })
            }
            _ => {
                let inserted = fresh();
                self.store.insert_memory(&inserted).await?;
                Ok(MemoryOutcome::Inserted(inserted))
            }
        }
    }
}

/// Operator-facing memory management.
pub struct MemoryService {
    store: Arc<dyn Database>,
}

impl MemoryService {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Author a memory by hand. It has no originating session or tier.
    pub async fn create(
        &self,
        service: Option<&str>,
        category: MemoryCategory,
        observation: &str,
        confidence: Option<f64>,
    ) -> Result<Memory, DatabaseError> {
        if let Some(confidence) = confidence {
            check_confidence(confidence)?;
        }
        let mut memory = Memory::new(
            service.and_then(normalize_service),
            category,
            observation.trim(),
        );
        if let Some(confidence) = confidence {
            memory = memory.with_confidence(confidence);
        }
        self.store.insert_memory(&memory).await?;
        Ok(memory)
    }

    pub async fn update(&self, id: Uuid, mut edit: MemoryEdit) -> Result<Memory, DatabaseError> {
        if let Some(confidence) = edit.confidence {
            check_confidence(confidence)?;
        }
        if let Some(service) = edit.service.take() {
            edit.service = Some(service.as_deref().and_then(normalize_service));
        }
        self.store
            .modify_memory(id, &MemoryChange::Edit { edit, at: Utc::now() })
            .await
    }

    /// The only path that physically removes a memory.
    pub async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = self.store.delete_memory(id).await?;
        if deleted {
            tracing::info!(memory_id = %id, "Memory deleted by operator");
        }
        Ok(deleted)
    }

    pub async fn list(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, DatabaseError> {
        self.store.list_memories(filter).await
    }
}

/// Operator-supplied confidence must already lie in [0, 1].
fn check_confidence(value: f64) -> Result<(), DatabaseError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DatabaseError::Invalid {
            field: "confidence",
            message: format!("{} is not within 0.0..=1.0", value),
        })
    }
}
