//! Confidence-scored long-term operational memory.
//!
//! Memories are created from `[MEMORY:...]` markers or by an operator, and
//! their confidence moves with reinforcement, contradiction, staleness decay
//! and manual edits. A memory whose confidence drops below
//! [`DEACTIVATION_THRESHOLD`] is deactivated in the same update.

mod context;
mod reconciler;
mod similarity;

pub use context::{
    ContextBuilder, DEFAULT_TOKEN_BUDGET, MemoryContext, STALE_GRACE_DAYS, estimate_tokens,
    render_context, stale_weeks,
};
pub use reconciler::{MarkerOrigin, MemoryOutcome, MemoryService, Reconciler};
pub use similarity::{Relation, SimilarityThresholds, relate};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MarkerError;

/// Confidence assigned to a memory that has not been reinforced yet.
pub const DEFAULT_CONFIDENCE: f64 = 0.7;
/// Below this a memory is inactive.
pub const DEACTIVATION_THRESHOLD: f64 = 0.3;
pub const REINFORCE_STEP: f64 = 0.1;
pub const CONTRADICT_STEP: f64 = 0.2;
/// Confidence lost per full week a memory sits past the staleness grace period.
pub const DECAY_STEP: f64 = 0.1;

/// Kind of knowledge a memory captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Timing,
    Dependency,
    Behavior,
    Remediation,
    Maintenance,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 5] = [
        Self::Timing,
        Self::Dependency,
        Self::Behavior,
        Self::Remediation,
        Self::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timing => "timing",
            Self::Dependency => "dependency",
            Self::Behavior => "behavior",
            Self::Remediation => "remediation",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timing" => Ok(Self::Timing),
            "dependency" => Ok(Self::Dependency),
            "behavior" => Ok(Self::Behavior),
            "remediation" => Ok(Self::Remediation),
            "maintenance" => Ok(Self::Maintenance),
            _ => Err(MarkerError::UnknownCategory(s.to_string())),
        }
    }
}

/// A unit of persistent operational knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    /// `None` is general knowledge not tied to a service.
    pub service: Option<String>,
    pub category: MemoryCategory,
    pub observation: String,
    pub confidence: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` for operator-authored memories.
    pub session_id: Option<Uuid>,
    pub tier: Option<u8>,
    /// Weeks of staleness decay already charged since `updated_at`.
    #[serde(default)]
    pub stale_weeks_applied: u32,
}

impl Memory {
    pub fn new(
        service: Option<String>,
        category: MemoryCategory,
        observation: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service,
            category,
            observation: observation.into(),
            confidence: DEFAULT_CONFIDENCE,
            active: true,
            created_at: now,
            updated_at: now,
            session_id: None,
            tier: None,
            stale_weeks_applied: 0,
        }
    }

    /// Attribute the memory to the session that produced it.
    pub fn with_origin(mut self, session_id: Uuid, tier: u8) -> Self {
        self.session_id = Some(session_id);
        self.tier = Some(tier);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.set_confidence(confidence);
        self
    }

    /// Set confidence, clamped to [0, 1]. Non-finite values are ignored.
    ///
    /// Crossing below the deactivation threshold deactivates the memory and
    /// crossing back up reactivates it; updates that stay on one side of the
    /// threshold leave `active` alone.
    pub fn set_confidence(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let previous = self.confidence;
        let next = round_confidence(value.clamp(0.0, 1.0));
        self.confidence = next;
        if previous >= DEACTIVATION_THRESHOLD && next < DEACTIVATION_THRESHOLD {
            self.active = false;
        } else if previous < DEACTIVATION_THRESHOLD && next >= DEACTIVATION_THRESHOLD {
            self.active = true;
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.stale_weeks_applied = 0;
    }

    /// Apply a change in place.
    pub fn apply(&mut self, change: &MemoryChange) {
        match change {
            MemoryChange::Adjust { delta, at } => {
                self.set_confidence(self.confidence + delta);
                self.touch(*at);
            }
            MemoryChange::Decay { stale_weeks } => {
                let pending = stale_weeks.saturating_sub(self.stale_weeks_applied);
                if pending > 0 {
                    self.set_confidence(self.confidence - DECAY_STEP * f64::from(pending));
                    self.stale_weeks_applied = *stale_weeks;
                }
            }
            MemoryChange::Edit { edit, at } => {
                if let Some(observation) = &edit.observation {
                    self.observation = observation.clone();
                }
                if let Some(category) = edit.category {
                    self.category = category;
                }
                if let Some(service) = &edit.service {
                    self.service = service.clone();
                }
                if let Some(confidence) = edit.confidence {
                    self.set_confidence(confidence);
                }
                if let Some(active) = edit.active {
                    self.active = active;
                }
                self.touch(*at);
            }
        }
    }
}

/// Keeps repeated ±0.1 steps from drifting (0.7 + 0.1 must be 0.8).
fn round_confidence(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Normalize a service name as written in a marker or by an operator.
pub fn normalize_service(service: &str) -> Option<String> {
    let trimmed = service.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("general") {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

/// A read-modify-write applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryChange {
    /// Reinforcement (+) or contradiction (-). Refreshes `updated_at`.
    Adjust { delta: f64, at: DateTime<Utc> },
    /// Staleness decay up to `stale_weeks` total weeks. Leaves `updated_at` alone.
    Decay { stale_weeks: u32 },
    /// Operator edit.
    Edit { edit: MemoryEdit, at: DateTime<Utc> },
}

/// Fields an operator may change on an existing memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryEdit {
    pub observation: Option<String>,
    pub category: Option<MemoryCategory>,
    pub service: Option<Option<String>>,
    pub confidence: Option<f64>,
    pub active: Option<bool>,
}

/// Which service scope a memory query matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ScopeFilter {
    #[default]
    Any,
    /// Only scope-less (general) memories.
    General,
    Service(String),
}

impl ScopeFilter {
    /// Exact scope match: `None` selects general memories.
    pub fn exact(service: Option<&str>) -> Self {
        match service {
            Some(s) => Self::Service(s.to_string()),
            None => Self::General,
        }
    }

    pub fn matches(&self, service: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::General => service.is_none(),
            Self::Service(s) => service == Some(s.as_str()),
        }
    }
}

/// Query over stored memories.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub scope: ScopeFilter,
    pub category: Option<MemoryCategory>,
    pub active_only: bool,
}

impl MemoryFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, memory: &Memory) -> bool {
        (!self.active_only || memory.active)
            && self.category.is_none_or(|c| c == memory.category)
            && self.scope.matches(memory.service.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn memory(confidence: f64) -> Memory {
        Memory::new(Some("jellyfin".into()), MemoryCategory::Timing, "x").with_confidence(confidence)
    }

    #[test]
    fn test_category_parsing() {
        for category in MemoryCategory::ALL {
            assert_eq!(category.as_str().parse::<MemoryCategory>().unwrap(), category);
        }
        assert_eq!(
            "Timing".parse::<MemoryCategory>().unwrap(),
            MemoryCategory::Timing
        );
        assert!(matches!(
            "vibes".parse::<MemoryCategory>(),
            Err(MarkerError::UnknownCategory(_))
        ));
    }

    #[test]
    fn test_confidence_clamped() {
        let mut m = memory(0.95);
        m.set_confidence(1.4);
        assert_eq!(m.confidence, 1.0);
        m.set_confidence(-2.0);
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_reinforcement_steps_do_not_drift() {
        let mut m = memory(0.7);
        m.apply(&MemoryChange::Adjust {
            delta: REINFORCE_STEP,
            at: Utc::now(),
        });
        assert_eq!(m.confidence, 0.8);
        m.apply(&MemoryChange::Adjust {
            delta: -CONTRADICT_STEP,
            at: Utc::now(),
        });
        assert_eq!(m.confidence, 0.6);
    }

    #[test]
    fn test_crossing_threshold_deactivates_only_on_crossing() {
        let mut m = memory(0.4);
        assert!(m.active);

        m.set_confidence(0.3);
        assert!(m.active, "exactly 0.3 is still active");

        m.set_confidence(0.2);
        assert!(!m.active);

        // Operator re-enables while still below threshold; a further decrease
        // below threshold is not a crossing and leaves it active.
        m.active = true;
        m.set_confidence(0.1);
        assert!(m.active);
    }

    #[test]
    fn test_raising_above_threshold_reactivates() {
        let mut m = memory(0.5);
        m.set_confidence(0.1);
        assert!(!m.active);
        m.set_confidence(0.35);
        assert!(m.active);
    }

    #[test]
    fn test_decay_is_idempotent_per_week() {
        let mut m = memory(0.9);
        let updated = m.updated_at;

        m.apply(&MemoryChange::Decay { stale_weeks: 2 });
        assert_eq!(m.confidence, 0.7);
        assert_eq!(m.updated_at, updated);

        m.apply(&MemoryChange::Decay { stale_weeks: 2 });
        assert_eq!(m.confidence, 0.7);

        m.apply(&MemoryChange::Decay { stale_weeks: 3 });
        assert_eq!(m.confidence, 0.6);
        assert_eq!(m.stale_weeks_applied, 3);
    }

    #[test]
    fn test_adjust_resets_staleness() {
        let mut m = memory(0.9);
        m.apply(&MemoryChange::Decay { stale_weeks: 1 });
        let at = Utc::now() + Duration::seconds(5);
        m.apply(&MemoryChange::Adjust {
            delta: REINFORCE_STEP,
            at,
        });
        assert_eq!(m.stale_weeks_applied, 0);
        assert_eq!(m.updated_at, at);
    }

    #[test]
    fn test_edit_changes_fields() {
        let mut m = memory(0.7);
        m.apply(&MemoryChange::Edit {
            edit: MemoryEdit {
                observation: Some("new text".into()),
                service: Some(None),
                confidence: Some(0.2),
                ..Default::default()
            },
            at: Utc::now(),
        });
        assert_eq!(m.observation, "new text");
        assert_eq!(m.service, None);
        assert!(!m.active);
    }

    #[test]
    fn test_normalize_service() {
        assert_eq!(normalize_service(" Jellyfin "), Some("jellyfin".to_string()));
        assert_eq!(normalize_service("general"), None);
        assert_eq!(normalize_service(""), None);
    }

    #[test]
    fn test_filter_matches_scope_exactly() {
        let general = Memory::new(None, MemoryCategory::Behavior, "g");
        let scoped = Memory::new(Some("nginx".into()), MemoryCategory::Behavior, "s");

        let filter = MemoryFilter {
            scope: ScopeFilter::exact(None),
            ..MemoryFilter::active()
        };
        assert!(filter.matches(&general));
        assert!(!filter.matches(&scoped));

        let filter = MemoryFilter {
            scope: ScopeFilter::exact(Some("nginx")),
            category: Some(MemoryCategory::Behavior),
            active_only: true,
        };
        assert!(filter.matches(&scoped));
        assert!(!filter.matches(&general));
    }
}
