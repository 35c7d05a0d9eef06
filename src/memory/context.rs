//! Token-budgeted rendering of active memories for prompt injection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::db::{Database, sort_by_confidence};
use crate::error::DatabaseError;
use crate::memory::{Memory, MemoryChange, MemoryFilter};

/// Default context budget, in estimated tokens.
pub const DEFAULT_TOKEN_BUDGET: usize = 2000;

/// Days a memory may go without reinforcement before it starts to decay.
pub const STALE_GRACE_DAYS: i64 = 30;

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Full weeks elapsed past the grace period since `updated_at`.
pub fn stale_weeks(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let past_grace = now - updated_at - Duration::days(STALE_GRACE_DAYS);
    if past_grace <= Duration::zero() {
        return 0;
    }
    u32::try_from(past_grace.num_weeks()).unwrap_or(u32::MAX)
}

/// Rendered memory block plus what went into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryContext {
    /// Empty when no memory was eligible.
    pub text: String,
    pub included: usize,
    pub eligible: usize,
    /// Estimated tokens of `text`, headings included. Never below the
    /// estimate of the rendered text and never above the budget.
    pub tokens: usize,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.included == 0
    }
}

fn render_entry(memory: &Memory) -> String {
    format!(
        "- [{}] {} (confidence {:.2})",
        memory.category, memory.observation, memory.confidence
    )
}

fn render_header(included: usize, eligible: usize, tokens: usize) -> String {
    format!(
        "## Operational memory ({} of {} memories, ~{} tokens)",
        included, eligible, tokens
    )
}

fn group_heading(service: Option<&str>) -> String {
    format!("### {}", service.unwrap_or("general"))
}

/// Render `memories` within `budget_tokens`.
///
/// Inactive memories are ignored. Entries are taken in descending confidence
/// and selection stops at the first one that would overflow the budget. The
/// header and the per-service headings count against the budget too.
pub fn render_context(memories: &[Memory], budget_tokens: usize) -> MemoryContext {
    let mut eligible: Vec<Memory> = memories.iter().filter(|m| m.active).cloned().collect();
    sort_by_confidence(&mut eligible);

    // The header at its widest, plus the blank line after it.
    let mut used_chars = render_header(eligible.len(), eligible.len(), budget_tokens)
        .chars()
        .count()
        + 2;
    let mut groups: BTreeMap<Option<&str>, Vec<String>> = BTreeMap::new();
    let mut included = 0usize;

    for memory in &eligible {
        let service = memory.service.as_deref();
        let entry = render_entry(memory);
        // +1 for the newline
        let mut cost = entry.chars().count() + 1;
        if !groups.contains_key(&service) {
            cost += group_heading(service).chars().count() + 1;
            if !groups.is_empty() {
                // blank separator line
                cost += 1;
            }
        }
        let next = used_chars + cost;
        if next.div_ceil(4) > budget_tokens {
            break;
        }
        used_chars = next;
        included += 1;
        groups.entry(service).or_default().push(entry);
    }

    if included == 0 {
        return MemoryContext {
            eligible: eligible.len(),
            ..Default::default()
        };
    }

    let tokens = used_chars.div_ceil(4);
    let mut lines = vec![render_header(included, eligible.len(), tokens), String::new()];
    // `None` sorts first, so general knowledge leads.
    for (i, (service, entries)) in groups.into_iter().enumerate() {
        if i > 0 {
            lines.push(String::new());
        }
        lines.push(group_heading(service));
        lines.extend(entries);
    }

    MemoryContext {
        text: lines.join("\n"),
        included,
        eligible: eligible.len(),
        tokens,
    }
}

/// Builds the memory block injected at the start of every session.
pub struct ContextBuilder {
    store: Arc<dyn Database>,
    budget_tokens: usize,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            budget_tokens: DEFAULT_TOKEN_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget_tokens: usize) -> Self {
        self.budget_tokens = budget_tokens;
        self
    }

    pub fn budget(&self) -> usize {
        self.budget_tokens
    }

    /// Charge decay for stale active memories. Returns how many changed.
    ///
    /// Weeks already charged are skipped, so repeated sweeps are harmless.
    pub async fn sweep_staleness(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let memories = self.store.list_memories(&MemoryFilter::active()).await?;
        let mut decayed = 0;

        for memory in memories {
            let weeks = stale_weeks(memory.updated_at, now);
            if weeks <= memory.stale_weeks_applied {
                continue;
            }
            let updated = self
                .store
                .modify_memory(memory.id, &MemoryChange::Decay { stale_weeks: weeks })
                .await?;
            decayed += 1;
            if !updated.active {
                tracing::info!(
                    memory_id = %updated.id,
                    confidence = updated.confidence,
                    "Stale memory deactivated"
                );
            } else {
                tracing::debug!(
                    memory_id = %updated.id,
                    confidence = updated.confidence,
                    weeks,
                    "Stale memory decayed"
                );
            }
        }

        Ok(decayed)
    }

    pub async fn build(&self) -> Result<MemoryContext, DatabaseError> {
        self.build_at(Utc::now()).await
    }

    /// Sweep staleness, then render the active memories.
    pub async fn build_at(&self, now: DateTime<Utc>) -> Result<MemoryContext, DatabaseError> {
        self.sweep_staleness(now).await?;
        let memories = self.store.list_memories(&MemoryFilter::active()).await?;
        let context = render_context(&memories, self.budget_tokens);
        tracing::debug!(
            included = context.included,
            eligible = context.eligible,
            tokens = context.tokens,
            "Built memory context"
        );
        Ok(context)
    }
}
