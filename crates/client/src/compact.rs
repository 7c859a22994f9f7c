//! Session compaction — bounds the active message window between
//! iterations while preserving the most recent turns verbatim.
//!
//! Two strategies: **prune** (archiving the old prefix alone reaches the
//! target; a stub summary records what was removed) and **summarize** (the
//! summarizer model rewrites the prefix into one system-summary message).
//! The archive + insert is one store transaction; if the summarizer call
//! fails, nothing changes.

use serde::Serialize;

use mill_domain::agent::Agent;
use mill_domain::message::{estimate_tokens, text_content, ContentBlock, Message, Role};
use mill_domain::model::{ModelClient, ModelRequest, Turn};
use mill_domain::Result;
use mill_store::{CompactionApply, Store};
use uuid::Uuid;

use crate::assemble::consume_stream;

const SUMMARY_PROMPT: &str = "Summarize the following conversation history into a concise \
summary that preserves the current goal, key decisions, open questions, and any tool state. \
Write in present tense; omit pleasantries.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    NoOp,
    Prune,
    Summarize,
}

/// Reported to the `on_compaction` hook after each invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionOutcome {
    pub session_id: Uuid,
    pub strategy: CompactionStrategy,
    pub original_tokens: i64,
    pub compacted_tokens: i64,
    pub messages_removed: usize,
    pub summary: Option<String>,
}

impl CompactionOutcome {
    fn noop(session_id: Uuid, tokens: i64) -> Self {
        Self {
            session_id,
            strategy: CompactionStrategy::NoOp,
            original_tokens: tokens,
            compacted_tokens: tokens,
            messages_removed: 0,
            summary: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Partitioning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Index where the protected suffix begins: the last `preserve_last_n`
/// messages, or the trailing suffix within `protected_tokens`, whichever is
/// the larger set.
fn protected_start(messages: &[Message], preserve_last_n: usize, protected_tokens: i64) -> usize {
    let by_count = messages.len().saturating_sub(preserve_last_n);

    let mut by_tokens = messages.len();
    let mut cumulative = 0i64;
    for (i, m) in messages.iter().enumerate().rev() {
        if cumulative + m.token_count > protected_tokens {
            break;
        }
        cumulative += m.token_count;
        by_tokens = i;
    }

    by_count.min(by_tokens)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compact the session if its active window crossed the agent's trigger.
/// Invoked by the run worker between iterations; serialization per session
/// is the store's advisory lock.
pub async fn maybe_compact<S: Store>(
    store: &S,
    model: &dyn ModelClient,
    agent: &Agent,
    session_id: Uuid,
) -> Result<CompactionOutcome> {
    let messages = store.list_messages(session_id, false).await?;
    let total: i64 = messages.iter().map(|m| m.token_count).sum();
    if total < agent.config.compaction_trigger_tokens() {
        return Ok(CompactionOutcome::noop(session_id, total));
    }

    let cfg = &agent.config;
    let start = protected_start(
        &messages,
        cfg.compaction_preserve_n,
        cfg.compaction_protected_tokens,
    );
    let prunable = &messages[..start];
    if prunable.is_empty() {
        return Ok(CompactionOutcome::noop(session_id, total));
    }
    let protected_sum: i64 = messages[start..].iter().map(|m| m.token_count).sum();
    let prunable_ids: Vec<Uuid> = prunable.iter().map(|m| m.id).collect();

    let archive_up_to_seq = prunable.last().expect("non-empty").seq;
    let summary_seq = prunable.first().expect("non-empty").seq;

    // Prune strategy: archiving alone reaches the target; the stub only
    // records which messages were removed.
    let stub_text = format!(
        "[{} earlier messages archived: {}]",
        prunable.len(),
        prunable_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let stub_tokens = estimate_tokens(&text_content(stub_text.clone()));

    let (content, tokens, strategy, summary_text) =
        if protected_sum + stub_tokens <= cfg.compaction_target {
            (
                text_content(stub_text),
                stub_tokens,
                CompactionStrategy::Prune,
                None,
            )
        } else {
            let summary = summarize(model, agent, prunable).await?;
            let tokens = estimate_tokens(&text_content(summary.clone()));
            (
                text_content(summary.clone()),
                tokens,
                CompactionStrategy::Summarize,
                Some(summary),
            )
        };

    store
        .apply_compaction(
            session_id,
            CompactionApply {
                archive_up_to_seq,
                summary_seq,
                summary_content: content,
                summary_tokens: tokens,
            },
        )
        .await?;

    let outcome = CompactionOutcome {
        session_id,
        strategy,
        original_tokens: total,
        compacted_tokens: protected_sum + tokens,
        messages_removed: prunable.len(),
        summary: summary_text,
    };
    tracing::info!(
        session_id = %session_id,
        strategy = ?outcome.strategy,
        original_tokens = outcome.original_tokens,
        compacted_tokens = outcome.compacted_tokens,
        messages_removed = outcome.messages_removed,
        "session compacted"
    );
    Ok(outcome)
}

/// Render the prunable prefix and ask the summarizer model for a summary.
async fn summarize(model: &dyn ModelClient, agent: &Agent, prunable: &[Message]) -> Result<String> {
    let mut conversation = String::new();
    for m in prunable {
        let label = match m.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::ToolResult => "Tool",
            Role::SystemSummary => "Summary",
        };
        conversation.push_str(label);
        conversation.push_str(": ");
        for block in &m.content {
            match block {
                ContentBlock::Text { text } => conversation.push_str(text),
                ContentBlock::ToolUse { name, .. } => {
                    conversation.push_str(&format!("[tool call: {name}]"));
                }
                ContentBlock::ToolResult { content, .. } => conversation.push_str(content),
            }
        }
        conversation.push('\n');
    }

    let summarizer_model = if agent.config.summarizer_model.is_empty() {
        agent.model.clone()
    } else {
        agent.config.summarizer_model.clone()
    };

    let request = ModelRequest {
        model: summarizer_model,
        system: SUMMARY_PROMPT.into(),
        messages: vec![Turn {
            role: Role::User,
            content: text_content(conversation),
        }],
        tools: Vec::new(),
        max_tokens: Some(2000),
        temperature: Some(0.1),
        stop_sequences: Vec::new(),
        extended_context: false,
    };

    let stream = model.stream(request).await?;
    let assembled = consume_stream(stream, || false).await?;
    Ok(assembled.text())
}
