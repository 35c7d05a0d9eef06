//! Session supervisor: owns the agent subprocess from spawn to terminal state.
//!
//! ```text
//! start ──► slot ──► cooldown ──► memory context ──► session row ──► spawn
//!                                                                   │
//!            ┌──────────────────── reader task ◄────────────────────┘
//!            │  raw line ─► log ─► classify ─► hub / reconciler
//!            ▼
//!   exit ─► terminal write ─► cooldown record ─► hub close ─► slot freed
//! ```
//!
//! At most one session runs at a time. The slot is a single semaphore permit
//! owned by the reader task, so it is released only after the terminal state
//! has been written.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, oneshot, watch};
use tokio::time::Instant;

use crate::cooldown::{ActionClass, CooldownEngine};
use crate::db::{Database, SessionLogWriter, SessionLogs};
use crate::error::{DatabaseError, SupervisorError};
use crate::memory::{
    ContextBuilder, DEFAULT_TOKEN_BUDGET, MarkerOrigin, MemoryContext, Reconciler,
    SimilarityThresholds,
};
use crate::session::agent::{BoundedLine, LineReader};
use crate::session::hub::DEFAULT_CAPACITY;
use crate::session::{
    AgentConfig, Hub, HubError, HubSubscription, Session, SessionId, SessionOutcome,
    SessionStatus, Tier, ToolPolicy, TriggerKind,
};
use crate::stream::{ResultSummary, classify, render_log};

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub agent: AgentConfig,
    /// Directory for raw `<session_id>.jsonl` logs.
    pub logs_dir: PathBuf,
    pub memory_budget_tokens: usize,
    pub hub_capacity: usize,
    /// Per-hub viewer cap; `None` means unlimited.
    pub max_subscribers: Option<u64>,
    pub thresholds: SimilarityThresholds,
}

impl SupervisorConfig {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent: AgentConfig::default(),
            logs_dir: logs_dir.into(),
            memory_budget_tokens: DEFAULT_TOKEN_BUDGET,
            hub_capacity: DEFAULT_CAPACITY,
            max_subscribers: None,
            thresholds: SimilarityThresholds::default(),
        }
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_memory_budget(mut self, tokens: usize) -> Self {
        self.memory_budget_tokens = tokens;
        self
    }
}

/// A remediation the session is expected to perform, gated by cooldowns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationTarget {
    pub service: String,
    pub action: ActionClass,
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tier: Tier,
    /// Overrides the tier's default model.
    pub model: Option<String>,
    pub prompt: String,
    pub trigger: TriggerKind,
    pub parent: Option<SessionId>,
    pub remediation: Option<RemediationTarget>,
}

impl StartRequest {
    pub fn new(tier: Tier, prompt: impl Into<String>, trigger: TriggerKind) -> Self {
        Self {
            tier,
            model: None,
            prompt: prompt.into(),
            trigger,
            parent: None,
            remediation: None,
        }
    }

    /// Follow-up to `parent` one tier higher (capped at the top tier).
    pub fn escalation(parent: &Session, prompt: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.id),
            ..Self::new(parent.tier.escalated(), prompt, TriggerKind::Escalation)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_parent(mut self, parent: SessionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_remediation(mut self, service: impl Into<String>, action: ActionClass) -> Self {
        self.remediation = Some(RemediationTarget {
            service: service.into(),
            action,
        });
        self
    }
}

/// How a viewer sees a session's output.
pub enum SessionView {
    /// Lines as they are produced, ending with the terminal status.
    Live(HubSubscription),
    /// Re-rendered from the durable log.
    Replay { session: Session, lines: Vec<String> },
}

struct ActiveSession {
    id: SessionId,
    hub: Arc<Hub>,
    kill_tx: Option<oneshot::Sender<()>>,
    done: watch::Receiver<Option<SessionStatus>>,
}

struct Inner {
    store: Arc<dyn Database>,
    config: SupervisorConfig,
    logs: SessionLogs,
    context: ContextBuilder,
    reconciler: Reconciler,
    cooldowns: CooldownEngine,
    slot: Arc<Semaphore>,
    active: RwLock<Option<ActiveSession>>,
}

/// Runs agent sessions one at a time.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn Database>, config: SupervisorConfig) -> Self {
        let inner = Inner {
            logs: SessionLogs::new(config.logs_dir.clone()),
            context: ContextBuilder::new(Arc::clone(&store))
                .with_budget(config.memory_budget_tokens),
            reconciler: Reconciler::new(Arc::clone(&store)).with_thresholds(config.thresholds),
            cooldowns: CooldownEngine::new(Arc::clone(&store)),
            slot: Arc::new(Semaphore::new(1)),
            active: RwLock::new(None),
            store,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn cooldowns(&self) -> &CooldownEngine {
        &self.inner.cooldowns
    }

    /// Spawn a session and return its id without waiting for it to finish.
    ///
    /// Fails fast with `AlreadyRunning` while another session holds the slot,
    /// and with `CooldownActive` (before any session row exists) when the
    /// requested remediation is rate limited.
    pub async fn start(&self, request: StartRequest) -> Result<SessionId, SupervisorError> {
        let inner = &self.inner;
        let permit = Arc::clone(&inner.slot)
            .try_acquire_owned()
            .map_err(|_| SupervisorError::AlreadyRunning)?;

        if let Some(target) = &request.remediation
            && !inner.cooldowns.permit(&target.service, target.action).await?
        {
            return Err(SupervisorError::CooldownActive {
                service: target.service.clone(),
                action: target.action,
            });
        }

        let context = match inner.context.build().await {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build memory context, starting without it");
                MemoryContext::default()
            }
        };
        let prompt = assemble_prompt(&request.prompt, &context);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| inner.config.agent.model_for(request.tier).to_string());

        let session = Session::new(
            request.tier,
            model,
            request.trigger,
            request.prompt.clone(),
            request.parent,
            |id| inner.logs.path_for(id),
        );
        inner.store.create_session(&session).await?;

        let log = match inner.logs.open_writer(&session.log_path).await {
            Ok(log) => log,
            Err(e) => {
                self.fail_unstarted(&session).await;
                return Err(e.into());
            }
        };

        let policy = ToolPolicy::for_tier(session.tier);
        let (mut child, stdout) =
            match spawn_agent(&inner.config.agent, &prompt, &session.model, &policy) {
                Ok(spawned) => spawned,
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "Failed to spawn agent");
                    self.fail_unstarted(&session).await;
                    return Err(SupervisorError::Spawn(e));
                }
            };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(session.id, stderr));
        }

        let hub = Arc::new(Hub::new(
            session.id,
            inner.config.hub_capacity,
            inner.config.max_subscribers,
        ));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(None);

        *inner.active.write().await = Some(ActiveSession {
            id: session.id,
            hub: Arc::clone(&hub),
            kill_tx: Some(kill_tx),
            done: done_rx,
        });

        tracing::info!(
            session_id = %session.id,
            tier = session.tier.get(),
            model = %session.model,
            trigger = %session.trigger,
            memories = context.included,
            "Session started"
        );

        let run = SessionRun {
            inner: Arc::clone(inner),
            id: session.id,
            origin: MarkerOrigin {
                session_id: session.id,
                tier: session.tier.get(),
            },
            hub,
            log,
            remediation: request.remediation,
        };
        tokio::spawn(run.drive(child, stdout, kill_rx, done_tx, permit));

        Ok(session.id)
    }

    /// Kill the active session and return its final status once the reader
    /// has drained and the terminal state is written.
    pub async fn cancel(&self) -> Result<SessionStatus, SupervisorError> {
        let (id, kill_tx, mut done) = {
            let mut active = self.inner.active.write().await;
            let Some(session) = active.as_mut() else {
                return Err(SupervisorError::NotRunning);
            };
            (session.id, session.kill_tx.take(), session.done.clone())
        };

        tracing::info!(session_id = %id, "Cancelling session");
        if let Some(kill_tx) = kill_tx {
            // The reader may already be finishing on its own.
            let _ = kill_tx.send(());
        }

        match done.wait_for(Option::is_some).await {
            Ok(status) => Ok((*status).unwrap_or(SessionStatus::Killed)),
            Err(_) => self.stored_status(id).await,
        }
    }

    /// Wait for a session to reach a terminal state.
    ///
    /// A session that is not the active one is reported as stored.
    pub async fn wait(&self, id: SessionId) -> Result<SessionStatus, SupervisorError> {
        let done = {
            let active = self.inner.active.read().await;
            active
                .as_ref()
                .filter(|a| a.id == id)
                .map(|a| a.done.clone())
        };
        if let Some(mut done) = done
            && let Ok(status) = done.wait_for(Option::is_some).await
            && let Some(status) = *status
        {
            return Ok(status);
        }
        self.stored_status(id).await
    }

    /// The running session, if any.
    pub async fn active(&self) -> Option<SessionId> {
        self.inner.active.read().await.as_ref().map(|a| a.id)
    }

    /// Live lines for the running session, a replay for anything else.
    pub async fn subscribe(&self, id: SessionId) -> Result<SessionView, SupervisorError> {
        {
            let active = self.inner.active.read().await;
            if let Some(session) = active.as_ref().filter(|a| a.id == id) {
                match session.hub.subscribe() {
                    Ok(subscription) => return Ok(SessionView::Live(subscription)),
                    // Finishing; the log is complete.
                    Err(HubError::Closed) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let (session, lines) = self.replay(id).await?;
        Ok(SessionView::Replay { session, lines })
    }

    /// Re-render a session's display lines from its durable log.
    pub async fn replay(&self, id: SessionId) -> Result<(Session, Vec<String>), SupervisorError> {
        let session = self
            .inner
            .store
            .get_session(id)
            .await?
            .ok_or(SupervisorError::UnknownSession(id))?;
        let raw = SessionLogs::read_lines(&session.log_path).await?;
        let lines = render_log(raw.iter().map(String::as_str));
        Ok((session, lines))
    }

    /// Mark sessions left `running` by a previous process as failed.
    pub async fn recover_orphans(&self) -> Result<Vec<SessionId>, SupervisorError> {
        let active = self.active().await;
        let mut recovered = Vec::new();
        for session in self.inner.store.list_running_sessions().await? {
            if Some(session.id) == active {
                continue;
            }
            let outcome = SessionOutcome::new(SessionStatus::Failed, None, None);
            match self.inner.store.finish_session(session.id, &outcome).await {
                Ok(_) => {
                    tracing::warn!(
                        session_id = %session.id,
                        started_at = %session.started_at,
                        "Recovered orphaned session as failed"
                    );
                    recovered.push(session.id);
                }
                Err(DatabaseError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(recovered)
    }

    async fn stored_status(&self, id: SessionId) -> Result<SessionStatus, SupervisorError> {
        self.inner
            .store
            .get_session(id)
            .await?
            .map(|s| s.status)
            .ok_or(SupervisorError::UnknownSession(id))
    }

    /// Terminal write for a session whose agent never ran.
    async fn fail_unstarted(&self, session: &Session) {
        let outcome = SessionOutcome::new(SessionStatus::Failed, None, None);
        if let Err(e) = self.inner.store.finish_session(session.id, &outcome).await {
            tracing::error!(session_id = %session.id, error = %e, "Failed to mark session failed");
        }
    }
}

fn assemble_prompt(prompt: &str, context: &MemoryContext) -> String {
    if context.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{}", prompt, context.text)
    }
}

fn spawn_agent(
    agent: &AgentConfig,
    prompt: &str,
    model: &str,
    policy: &ToolPolicy,
) -> std::io::Result<(Child, ChildStdout)> {
    let mut child = agent.command(prompt, model, policy).spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("agent stdout was not captured"))?;
    Ok((child, stdout))
}

async fn log_stderr(session_id: SessionId, stderr: ChildStderr) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(session_id = %session_id, "agent stderr: {}", line);
    }
}

/// State owned by one session's reader task.
struct SessionRun {
    inner: Arc<Inner>,
    id: SessionId,
    origin: MarkerOrigin,
    hub: Arc<Hub>,
    log: SessionLogWriter,
    remediation: Option<RemediationTarget>,
}

impl SessionRun {
    async fn drive(
        mut self,
        mut child: Child,
        stdout: ChildStdout,
        mut kill_rx: oneshot::Receiver<()>,
        done_tx: watch::Sender<Option<SessionStatus>>,
        permit: OwnedSemaphorePermit,
    ) {
        let agent = &self.inner.config.agent;
        let mut reader = LineReader::new(stdout, agent.max_line_bytes);
        let kill_grace = agent.kill_grace;

        let mut kill_armed = true;
        let mut killed = false;
        let mut deadline: Option<Instant> = None;
        let mut result: Option<ResultSummary> = None;

        loop {
            tokio::select! {
                line = reader.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(line, &mut result).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, error = %e, "Reading agent output failed");
                        break;
                    }
                },
                signal = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if signal.is_ok() && self.kill_if_alive(&mut child) {
                        killed = true;
                        deadline = Some(Instant::now() + kill_grace);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::warn!(session_id = %self.id, "Agent output still open after kill, abandoning drain");
                    break;
                }
            }
        }

        // Output is closed; the process may still be alive.
        let exit = loop {
            tokio::select! {
                biased;
                exit = child.wait() => break exit,
                signal = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if signal.is_ok() && self.kill_if_alive(&mut child) {
                        killed = true;
                    }
                }
            }
        };
        let exit_code = match &exit {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to reap agent");
                None
            }
        };

        let status = if killed {
            SessionStatus::Killed
        } else if result.as_ref().is_some_and(|r| !r.is_error) {
            SessionStatus::Succeeded
        } else {
            SessionStatus::Failed
        };
        let outcome = SessionOutcome::new(status, exit_code, result.map(|r| r.metadata()));

        let lines = self.log.lines_written();
        if let Err(e) = self.log.close().await {
            tracing::error!(session_id = %self.id, error = %e, "Failed to close session log");
        }
        self.finish(&outcome).await;
        self.record_remediation(status).await;

        self.hub.close(status);
        {
            let mut active = self.inner.active.write().await;
            if active.as_ref().is_some_and(|a| a.id == self.id) {
                *active = None;
            }
        }
        drop(permit);
        let _ = done_tx.send(Some(status));

        tracing::info!(
            session_id = %self.id,
            status = %status,
            exit_code = ?exit_code,
            lines,
            "Session finished"
        );
    }

    /// Kill the agent unless it already exited on its own, in which case its
    /// own outcome stands. Returns whether a kill was issued.
    fn kill_if_alive(&self, child: &mut Child) -> bool {
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(session_id = %self.id, %status, "Kill requested after agent exited");
            return false;
        }
        if let Err(e) = child.start_kill() {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to kill agent");
        }
        true
    }

    async fn handle_line(&mut self, line: BoundedLine, result: &mut Option<ResultSummary>) {
        if line.truncated {
            tracing::warn!(
                session_id = %self.id,
                limit = self.inner.config.agent.max_line_bytes,
                "Agent output line over limit, kept prefix only"
            );
        }
        // Durable before anything else looks at it.
        if let Err(e) = self.log.append(&line.text).await {
            tracing::error!(session_id = %self.id, error = %e, "Failed to append to session log");
        }

        let classified = classify(&line.text);
        if let Some(display) = classified.display {
            self.hub.publish(display);
        }
        for rejected in &classified.rejected {
            tracing::warn!(session_id = %self.id, error = %rejected, "Marker rejected");
        }
        for marker in &classified.markers {
            if let Err(e) = self.inner.reconciler.apply(marker, self.origin).await {
                tracing::error!(session_id = %self.id, error = %e, "Failed to apply marker");
            }
        }
        if let Some(summary) = classified.result
            && result.is_none()
        {
            *result = Some(summary);
        }
    }

    /// The single terminal write, retried once on a store failure.
    async fn finish(&self, outcome: &SessionOutcome) {
        for attempt in 1..=2 {
            match self.inner.store.finish_session(self.id, outcome).await {
                Ok(_) => return,
                Err(DatabaseError::Conflict(reason)) => {
                    tracing::warn!(session_id = %self.id, %reason, "Session already terminal");
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %self.id,
                        attempt,
                        error = %e,
                        "Failed to write terminal state"
                    );
                }
            }
        }
    }

    async fn record_remediation(&self, status: SessionStatus) {
        let Some(target) = &self.remediation else {
            return;
        };
        let success = status == SessionStatus::Succeeded;
        let error = (!success).then(|| format!("session {} {}", self.id, status));
        if let Err(e) = self
            .inner
            .cooldowns
            .record(&target.service, target.action, success, error)
            .await
        {
            tracing::error!(
                session_id = %self.id,
                service = %target.service,
                error = %e,
                "Failed to record remediation attempt"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_bumps_tier_and_links_parent() {
        let parent = Session::new(
            Tier::new(2).unwrap(),
            "sonnet",
            TriggerKind::Scheduled,
            "check",
            None,
            |id| PathBuf::from(format!("{}.jsonl", id)),
        );
        let request = StartRequest::escalation(&parent, "dig deeper");
        assert_eq!(request.tier.get(), 3);
        assert_eq!(request.trigger, TriggerKind::Escalation);
        assert_eq!(request.parent, Some(parent.id));
        assert!(request.model.is_none());

        let top = Session {
            tier: Tier::new(3).unwrap(),
            ..parent
        };
        assert_eq!(StartRequest::escalation(&top, "again").tier.get(), 3);
    }

    #[test]
    fn test_prompt_assembly() {
        assert_eq!(assemble_prompt("check nginx", &MemoryContext::default()), "check nginx");

        let context = MemoryContext {
            text: "## Operational memory (1 of 1 memories, ~10 tokens)".into(),
            included: 1,
            eligible: 1,
            tokens: 10,
        };
        assert_eq!(
            assemble_prompt("check nginx", &context),
            "check nginx\n\n## Operational memory (1 of 1 memories, ~10 tokens)"
        );
    }
}
