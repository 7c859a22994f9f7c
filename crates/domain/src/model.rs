//! The model endpoint contract.
//!
//! The orchestrator never speaks HTTP itself; it consumes a streaming
//! [`ModelClient`] and assembles the events into one [`AssembledMessage`]
//! per iteration. Adapters for concrete providers live outside this
//! workspace and implement the trait.

use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{ContentBlock, Role};
use crate::tool::ToolSpec;

/// A boxed async stream, used for model streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One turn of accumulated conversation as handed to the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

/// A provider-agnostic model request for one iteration.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Turn>,
    /// Concrete tools plus tool-projections of delegable sub-agents.
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
    /// Request the provider's extended context window.
    pub extended_context: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
}

/// Token usage reported by the endpoint for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Events emitted while streaming one model response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ModelEvent {
    /// Incremental assistant text.
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// A tool-use block has started.
    #[serde(rename = "tool_use_start")]
    ToolUseStart { id: String, name: String },

    /// Incremental JSON fragment of a tool-use block's input.
    #[serde(rename = "tool_use_delta")]
    ToolUseDelta { id: String, partial_input: String },

    /// Stream finished.
    #[serde(rename = "done")]
    Done {
        usage: Usage,
        stop_reason: StopReason,
    },
}

/// The fully assembled response for one iteration.
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    /// Ordered content blocks: text and tool_use.
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

impl AssembledMessage {
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

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The foundation-model endpoint the run workers call.
///
/// The endpoint must expose a streaming interface; failures carry an
/// HTTP-family status via [`crate::Error::Model`] so the worker can classify
/// them (rate-limit and overloaded responses are transient).
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<BoxStream<'static, Result<ModelEvent>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_serde() {
        assert_eq!(
            serde_json::to_string(&StopReason::EndTurn).unwrap(),
            "\"end_turn\""
        );
        assert_eq!(
            serde_json::to_string(&StopReason::ToolUse).unwrap(),
            "\"tool_use\""
        );
    }

    #[test]
    fn assembled_text_skips_tool_use() {
        let msg = AssembledMessage {
            content: vec![
                ContentBlock::Text { text: "hi".into() },
                ContentBlock::ToolUse {
                    id: "tu".into(),
                    name: "calc".into(),
                    input: serde_json::json!({}),
                },
            ],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
        };
        assert_eq!(msg.text(), "hi");
        assert!(msg.has_tool_use());
    }
}
