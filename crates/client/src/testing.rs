//! Test support: a scripted model endpoint.
//!
//! Replays a queue of pre-baked responses as event streams, so the full
//! orchestrator can be exercised without any network. Each `stream` call
//! consumes one scripted step; an empty script fails the call with a 500 so
//! runaway loops surface as failed runs instead of hangs.

use std::collections::VecDeque;

use futures_util::stream;
use parking_lot::Mutex;

use mill_domain::message::ContentBlock;
use mill_domain::model::{
    BoxStream, ModelClient, ModelEvent, ModelRequest, StopReason, Usage,
};
use mill_domain::{Error, Result};

enum Step {
    Respond {
        content: Vec<ContentBlock>,
        stop_reason: StopReason,
        usage: Usage,
    },
    Fail {
        status: Option<u16>,
        message: String,
    },
}

/// A [`ModelClient`] that replays scripted responses in order.
#[derive(Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text response.
    pub fn push_text(&self, text: impl Into<String>, stop_reason: StopReason) {
        self.push_message(
            vec![ContentBlock::Text { text: text.into() }],
            stop_reason,
        );
    }

    /// Queue a response with explicit content blocks.
    pub fn push_message(&self, content: Vec<ContentBlock>, stop_reason: StopReason) {
        self.steps.lock().push_back(Step::Respond {
            content,
            stop_reason,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
        });
    }

    /// Queue a response that calls one tool.
    pub fn push_tool_use(&self, tool_use_id: &str, name: &str, input: serde_json::Value) {
        self.push_message(
            vec![ContentBlock::ToolUse {
                id: tool_use_id.into(),
                name: name.into(),
                input,
            }],
            StopReason::ToolUse,
        );
    }

    /// Queue a failure with an HTTP-family status.
    pub fn push_error(&self, status: Option<u16>, message: impl Into<String>) {
        self.steps.lock().push_back(Step::Fail {
            status,
            message: message.into(),
        });
    }

    /// Requests seen so far (for asserting on prepared prompts/tools).
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait::async_trait]
impl ModelClient for ScriptedModel {
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<BoxStream<'static, Result<ModelEvent>>> {
        self.requests.lock().push(request);
        let step = self.steps.lock().pop_front();
        match step {
            None => Err(Error::model(
                Some(500),
                "scripted model has no more responses",
            )),
            Some(Step::Fail { status, message }) => Err(Error::model(status, message)),
            Some(Step::Respond {
                content,
                stop_reason,
                usage,
            }) => {
                let mut events: Vec<Result<ModelEvent>> = Vec::new();
                for block in content {
                    match block {
                        ContentBlock::Text { text } => {
                            events.push(Ok(ModelEvent::TextDelta { text }));
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            events.push(Ok(ModelEvent::ToolUseStart {
                                id: id.clone(),
                                name,
                            }));
                            events.push(Ok(ModelEvent::ToolUseDelta {
                                id,
                                partial_input: input.to_string(),
                            }));
                        }
                        ContentBlock::ToolResult { .. } => {
                            // Models never emit tool_result blocks.
                        }
                    }
                }
                events.push(Ok(ModelEvent::Done { usage, stop_reason }));
                Ok(Box::pin(stream::iter(events)))
            }
        }
    }
}
