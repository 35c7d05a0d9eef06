//! The agent subprocess: tier tool policy, command line, and bounded output
//! reading.
//!
//! # Tier policy
//!
//! ```text
//! ┌──────┬─────────────────────────────────────────────────────────────┐
//! │ Tier │ Allowed tools                                               │
//! ├──────┼─────────────────────────────────────────────────────────────┤
//! │ 1    │ Read, Grep, Glob, docker ps/logs/inspect, curl              │
//! │ 2    │ tier 1 + docker restart                                     │
//! │ 3    │ tier 2 + docker compose, Edit, Write                        │
//! └──────┴─────────────────────────────────────────────────────────────┘
//! ```

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::session::Tier;

/// Longest raw line kept from the agent's stdout (1 MB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How long the reader keeps draining after a kill before giving up.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

const TIER1_TOOLS: &[&str] = &[
    "Read",
    "Grep",
    "Glob",
    "Bash(docker ps:*)",
    "Bash(docker logs:*)",
    "Bash(docker inspect:*)",
    "Bash(curl:*)",
];

const TIER2_TOOLS: &[&str] = &["Bash(docker restart:*)"];

const TIER3_TOOLS: &[&str] = &["Bash(docker compose:*)", "Edit", "Write"];

/// Tools a session may use, derived from its tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPolicy {
    allowed: Vec<&'static str>,
}

impl ToolPolicy {
    pub fn for_tier(tier: Tier) -> Self {
        let mut allowed: Vec<&'static str> = TIER1_TOOLS.to_vec();
        if tier.get() >= 2 {
            allowed.extend_from_slice(TIER2_TOOLS);
        }
        if tier.get() >= 3 {
            allowed.extend_from_slice(TIER3_TOOLS);
        }
        Self { allowed }
    }

    pub fn allowed(&self) -> &[&'static str] {
        &self.allowed
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed.contains(&tool)
    }

    /// Value for the agent's `--allowedTools` flag.
    pub fn to_arg(&self) -> String {
        self.allowed.join(",")
    }
}

/// How to invoke the agent binary.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub program: String,
    /// Arguments placed before the generated ones.
    pub leading_args: Vec<String>,
    /// Default model per tier, index 0 is tier 1.
    pub models: [String; 3],
    pub max_line_bytes: usize,
    pub kill_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            leading_args: Vec::new(),
            models: [
                "haiku".to_string(),
                "sonnet".to_string(),
                "opus".to_string(),
            ],
            max_line_bytes: MAX_LINE_BYTES,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl AgentConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn model_for(&self, tier: Tier) -> &str {
        &self.models[usize::from(tier.get() - Tier::MIN)]
    }

    /// Build the command for one session. Stdout is piped for the reader,
    /// stderr is piped for logging, and the child dies with its handle.
    pub fn command(&self, prompt: &str, model: &str, policy: &ToolPolicy) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(model)
            .args(["--output-format", "stream-json", "--verbose"])
            .arg("--allowedTools")
            .arg(policy.to_arg())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// One line of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedLine {
    pub text: String,
    /// The line was longer than the limit and only its prefix was kept.
    pub truncated: bool,
}

/// Newline-delimited reader with a per-line size cap.
///
/// Partial lines live in the reader itself, so `next_line` is safe to use
/// in `tokio::select!`.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    truncated: bool,
    max: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            truncated: false,
            max,
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<BoundedLine>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && !self.truncated {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let (content, used) = match newline {
                Some(i) => (&available[..i], i + 1),
                None => (available, available.len()),
            };
            let room = self.max.saturating_sub(self.buf.len());
            if content.len() > room {
                self.truncated = true;
            }
            self.buf
                .extend_from_slice(&content[..content.len().min(room)]);
            self.inner.consume(used);

            if newline.is_some() {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> BoundedLine {
        let bytes = std::mem::take(&mut self.buf);
        let truncated = std::mem::replace(&mut self.truncated, false);
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if text.ends_with('\r') {
            text.pop();
        }
        BoundedLine { text, truncated }
    }
}
