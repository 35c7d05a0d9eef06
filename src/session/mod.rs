//! Investigation sessions: the data model, the agent command, live fan-out,
//! and the supervisor that ties them together.

mod agent;
mod hub;
mod supervisor;

pub use agent::{AgentConfig, ToolPolicy};
pub use hub::{Hub, HubError, HubMessage, HubSubscription};
pub use supervisor::{RemediationTarget, SessionView, StartRequest, Supervisor, SupervisorConfig};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SupervisorError;

/// Session identifier.
pub type SessionId = Uuid;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            _ => Err(format!("invalid session status '{}'", s)),
        }
    }
}

/// What caused a session to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Api,
    Alert,
    Escalation,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Api => "api",
            Self::Alert => "alert",
            Self::Escalation => "escalation",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" | "cron" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "api" => Ok(Self::Api),
            "alert" => Ok(Self::Alert),
            "escalation" => Ok(Self::Escalation),
            _ => Err(format!(
                "invalid trigger '{}', expected scheduled, manual, api, alert or escalation",
                s
            )),
        }
    }
}

/// Capability tier of a session. Higher tiers may take more invasive actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Tier(u8);

impl Tier {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    pub fn new(tier: u8) -> Result<Self, SupervisorError> {
        if (Self::MIN..=Self::MAX).contains(&tier) {
            Ok(Self(tier))
        } else {
            Err(SupervisorError::InvalidTier {
                tier,
                max: Self::MAX,
            })
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// The tier an escalation from this one runs at, capped at the maximum.
    pub fn escalated(&self) -> Self {
        Self((self.0 + 1).min(Self::MAX))
    }
}

impl TryFrom<u8> for Tier {
    type Error = SupervisorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.0
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One invocation of the agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub tier: Tier,
    pub model: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub trigger: TriggerKind,
    pub prompt: String,
    pub log_path: PathBuf,
    pub response: Option<String>,
    pub cost_usd: Option<Decimal>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
    pub parent_id: Option<SessionId>,
    pub summary: Option<String>,
}

impl Session {
    /// A freshly spawned session in the `running` state.
    pub fn new(
        tier: Tier,
        model: impl Into<String>,
        trigger: TriggerKind,
        prompt: impl Into<String>,
        parent_id: Option<SessionId>,
        log_path: impl FnOnce(SessionId) -> PathBuf,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            tier,
            model: model.into(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            trigger,
            prompt: prompt.into(),
            log_path: log_path(id),
            response: None,
            cost_usd: None,
            num_turns: None,
            duration_ms: None,
            parent_id,
            summary: None,
        }
    }

    /// Apply the terminal transition. Only valid once, from `running`.
    pub fn finish(&mut self, outcome: &SessionOutcome) -> bool {
        if self.status.is_terminal() || !outcome.status.is_terminal() {
            return false;
        }
        self.status = outcome.status;
        self.ended_at = Some(outcome.ended_at);
        self.exit_code = outcome.exit_code;
        if let Some(meta) = &outcome.metadata {
            self.response = meta.response.clone();
            self.cost_usd = meta.cost_usd;
            self.num_turns = meta.num_turns;
            self.duration_ms = meta.duration_ms;
        }
        true
    }
}

/// Metadata extracted from the agent's terminal result record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalMetadata {
    pub response: Option<String>,
    pub cost_usd: Option<Decimal>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
}

/// The single terminal update written for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub ended_at: DateTime<Utc>,
    /// Present only when `status` is `succeeded`.
    pub metadata: Option<TerminalMetadata>,
}

impl SessionOutcome {
    pub fn new(
        status: SessionStatus,
        exit_code: Option<i32>,
        metadata: Option<TerminalMetadata>,
    ) -> Self {
        let metadata = if status == SessionStatus::Succeeded {
            metadata
        } else {
            None
        };
        Self {
            status,
            exit_code,
            ended_at: Utc::now(),
            metadata,
        }
    }
}
