//! Conversation messages and their structured content blocks.
//!
//! A message is one persisted turn in a session. Content is a list of typed
//! blocks (text, tool use, tool result) in the provider-agnostic shape every
//! model adapter converts to and from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
    /// Synthetic summary inserted by compaction.
    #[serde(rename = "system-summary")]
    SystemSummary,
}

/// One structured block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Strictly increasing per session, no gaps on append.
    pub seq: i64,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub token_count: i64,
    /// True for the synthetic message produced by compaction.
    pub is_summary: bool,
    /// True once compaction has archived this message out of the active
    /// window. Archived rows stay stored.
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Extract and join all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool-use blocks in emission order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rough token estimate for content blocks (~4 chars per token).
///
/// Used wherever the model did not report usage for a message: user prompts,
/// tool results, compaction accounting. Never zero for non-empty content.
pub fn estimate_tokens(content: &[ContentBlock]) -> i64 {
    let chars: usize = content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            ContentBlock::ToolResult { content, .. } => content.len(),
        })
        .sum();
    ((chars + 3) / 4).max(1) as i64
}

/// Convenience: a single text block.
pub fn text_content(text: impl Into<String>) -> Vec<ContentBlock> {
    vec![ContentBlock::Text { text: text.into() }]
}
