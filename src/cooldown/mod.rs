//! Sliding-window rate limits on remediation attempts, per service.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────┐
//! │ Action       │ Max attempts  │ Rolling window   │
//! ├──────────────┼───────────────┼──────────────────┤
//! │ restart      │ 2             │ 4 hours          │
//! │ redeploy     │ 1             │ 24 hours         │
//! └──────────────┴───────────────┴──────────────────┘
//! ```
//!
//! Failed attempts count the same as successful ones. Two consecutive
//! healthy evaluations wipe a service's history.

mod engine;

pub use engine::{CooldownEngine, CooldownSummary};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive healthy evaluations that clear a service's attempt history.
pub const HEALTHY_STREAK_TO_RESET: u32 = 2;

/// Extra retention past the longest window before attempts are pruned.
pub fn prune_margin() -> Duration {
    Duration::hours(24)
}

/// Class of remediation action, each with its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionClass {
    Restart,
    Redeploy,
}

impl ActionClass {
    /// Maximum attempts allowed inside the window.
    pub fn limit(&self) -> usize {
        match self {
            Self::Restart => 2,
            Self::Redeploy => 1,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            Self::Restart => Duration::hours(4),
            Self::Redeploy => Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Redeploy => "redeploy",
        }
    }
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ActionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "redeploy" => Ok(Self::Redeploy),
            _ => Err(format!(
                "invalid action '{}', expected 'restart' or 'redeploy'",
                s
            )),
        }
    }
}

/// One remediation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-service rate-limit ledger. Absent services behave as an empty record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub service: String,
    #[serde(default)]
    pub restarts: Vec<Attempt>,
    #[serde(default)]
    pub redeploys: Vec<Attempt>,
    #[serde(default)]
    pub consecutive_healthy: u32,
}

impl CooldownRecord {
    pub fn empty(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            restarts: Vec::new(),
            redeploys: Vec::new(),
            consecutive_healthy: 0,
        }
    }

    pub fn attempts(&self, action: ActionClass) -> &[Attempt] {
        match action {
            ActionClass::Restart => &self.restarts,
            ActionClass::Redeploy => &self.redeploys,
        }
    }

    fn attempts_mut(&mut self, action: ActionClass) -> &mut Vec<Attempt> {
        match action {
            ActionClass::Restart => &mut self.restarts,
            ActionClass::Redeploy => &mut self.redeploys,
        }
    }

    /// Attempts strictly inside the trailing window; one exactly a window ago
    /// no longer counts.
    pub fn attempts_within(&self, action: ActionClass, now: DateTime<Utc>) -> usize {
        let cutoff = now - action.window();
        self.attempts(action)
            .iter()
            .filter(|a| a.at > cutoff)
            .count()
    }

    pub fn permits(&self, action: ActionClass, now: DateTime<Utc>) -> bool {
        self.attempts_within(action, now) < action.limit()
    }

    /// Drop attempts older than the longest window plus margin.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let longest = ActionClass::Restart
            .window()
            .max(ActionClass::Redeploy.window());
        let cutoff = now - longest - prune_margin();
        let before = self.restarts.len() + self.redeploys.len();
        self.restarts.retain(|a| a.at >= cutoff);
        self.redeploys.retain(|a| a.at >= cutoff);
        before - (self.restarts.len() + self.redeploys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty() && self.redeploys.is_empty() && self.consecutive_healthy == 0
    }

    /// Apply a change in place.
    pub fn apply(&mut self, change: &CooldownChange) {
        match change {
            CooldownChange::Attempt {
                action,
                success,
                error,
                at,
            } => {
                self.attempts_mut(*action).push(Attempt {
                    at: *at,
                    success: *success,
                    error: error.clone(),
                });
                self.prune(*at);
            }
            CooldownChange::Health { healthy } => {
                if *healthy {
                    self.consecutive_healthy += 1;
                    if self.consecutive_healthy >= HEALTHY_STREAK_TO_RESET {
                        self.restarts.clear();
                        self.redeploys.clear();
                        self.consecutive_healthy = 0;
                    }
                } else {
                    self.consecutive_healthy = 0;
                }
            }
        }
    }
}

/// A read-modify-write applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CooldownChange {
    Attempt {
        action: ActionClass,
        success: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    Health {
        healthy: bool,
    },
}
