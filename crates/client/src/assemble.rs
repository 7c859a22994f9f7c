//! Stream assembly: fold a model event stream into one assembled message.
//!
//! Content blocks keep their emission order; tool_use inputs arrive as JSON
//! fragments and are parsed once the stream finishes. A stream that ends
//! without a `done` event is a transport failure (transient); a tool_use
//! whose input is not valid JSON is a malformed response (permanent).

use futures_util::StreamExt;

use mill_domain::message::ContentBlock;
use mill_domain::model::{AssembledMessage, BoxStream, ModelEvent, StopReason, Usage};
use mill_domain::{Error, Result};

enum Block {
    Text(String),
    Tool {
        id: String,
        name: String,
        input_buf: String,
    },
}

/// Consume a model stream into the final message. The `interrupt` callback
/// is polled between events; returning true aborts the in-flight stream
/// with `Error::Cancelled`.
pub async fn consume_stream(
    mut stream: BoxStream<'static, Result<ModelEvent>>,
    mut interrupt: impl FnMut() -> bool,
) -> Result<AssembledMessage> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut done: Option<(Usage, StopReason)> = None;

    while let Some(event) = stream.next().await {
        if interrupt() {
            return Err(Error::Cancelled);
        }
        match event? {
            ModelEvent::TextDelta { text } => match blocks.last_mut() {
                Some(Block::Text(buf)) => buf.push_str(&text),
                _ => blocks.push(Block::Text(text)),
            },
            ModelEvent::ToolUseStart { id, name } => {
                blocks.push(Block::Tool {
                    id,
                    name,
                    input_buf: String::new(),
                });
            }
            ModelEvent::ToolUseDelta { id, partial_input } => {
                let target = blocks.iter_mut().rev().find_map(|b| match b {
                    Block::Tool {
                        id: block_id,
                        input_buf,
                        ..
                    } if *block_id == id => Some(input_buf),
                    _ => None,
                });
                match target {
                    Some(buf) => buf.push_str(&partial_input),
                    None => {
                        return Err(Error::Permanent(format!(
                            "model emitted input delta for unknown tool_use {id:?}"
                        )))
                    }
                }
            }
            ModelEvent::Done { usage, stop_reason } => {
                done = Some((usage, stop_reason));
            }
        }
    }

    let Some((usage, stop_reason)) = done else {
        return Err(Error::model(None, "stream ended without a done event"));
    };

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block {
            Block::Text(text) => {
                if !text.is_empty() {
                    content.push(ContentBlock::Text { text });
                }
            }
            Block::Tool {
                id,
                name,
                input_buf,
            } => {
                let input = if input_buf.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    serde_json::from_str(&input_buf).map_err(|e| {
                        Error::Permanent(format!(
                            "malformed tool_use input for {name:?}: {e}"
                        ))
                    })?
                };
                content.push(ContentBlock::ToolUse { id, name, input });
            }
        }
    }

    Ok(AssembledMessage {
        content,
        usage,
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn events(v: Vec<Result<ModelEvent>>) -> BoxStream<'static, Result<ModelEvent>> {
        Box::pin(stream::iter(v))
    }

    fn done() -> ModelEvent {
        ModelEvent::Done {
            usage: Usage {
                input_tokens: 1,
                output_tokens: 2,
            },
            stop_reason: StopReason::EndTurn,
        }
    }

    #[tokio::test]
    async fn text_deltas_coalesce() {
        let msg = consume_stream(
            events(vec![
                Ok(ModelEvent::TextDelta { text: "hel".into() }),
                Ok(ModelEvent::TextDelta { text: "lo".into() }),
                Ok(done()),
            ]),
            || false,
        )
        .await
        .unwrap();
        assert_eq!(msg.content, vec![ContentBlock::Text { text: "hello".into() }]);
        assert_eq!(msg.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn tool_use_assembled_in_order() {
        let msg = consume_stream(
            events(vec![
                Ok(ModelEvent::TextDelta { text: "thinking".into() }),
                Ok(ModelEvent::ToolUseStart {
                    id: "tu_1".into(),
                    name: "calc".into(),
                }),
                Ok(ModelEvent::ToolUseDelta {
                    id: "tu_1".into(),
                    partial_input: "{\"x\":".into(),
                }),
                Ok(ModelEvent::ToolUseDelta {
                    id: "tu_1".into(),
                    partial_input: "1}".into(),
                }),
                Ok(ModelEvent::Done {
                    usage: Usage::default(),
                    stop_reason: StopReason::ToolUse,
                }),
            ]),
            || false,
        )
        .await
        .unwrap();
        assert_eq!(msg.content.len(), 2);
        assert!(matches!(&msg.content[0], ContentBlock::Text { .. }));
        match &msg.content[1] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "calc");
                assert_eq!(input, &serde_json::json!({"x": 1}));
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_tool_input_defaults_to_object() {
        let msg = consume_stream(
            events(vec![
                Ok(ModelEvent::ToolUseStart {
                    id: "tu".into(),
                    name: "noop".into(),
                }),
                Ok(ModelEvent::Done {
                    usage: Usage::default(),
                    stop_reason: StopReason::ToolUse,
                }),
            ]),
            || false,
        )
        .await
        .unwrap();
        match &msg.content[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert_eq!(input, &serde_json::json!({}));
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_tool_input_is_permanent() {
        let err = consume_stream(
            events(vec![
                Ok(ModelEvent::ToolUseStart {
                    id: "tu".into(),
                    name: "calc".into(),
                }),
                Ok(ModelEvent::ToolUseDelta {
                    id: "tu".into(),
                    partial_input: "{not json".into(),
                }),
                Ok(done()),
            ]),
            || false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Permanent(_)));
    }

    #[tokio::test]
    async fn missing_done_is_transient() {
        let err = consume_stream(
            events(vec![Ok(ModelEvent::TextDelta { text: "cut off".into() })]),
            || false,
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn interrupt_cancels_midstream() {
        let mut calls = 0;
        let err = consume_stream(
            events(vec![
                Ok(ModelEvent::TextDelta { text: "a".into() }),
                Ok(ModelEvent::TextDelta { text: "b".into() }),
                Ok(done()),
            ]),
            move || {
                calls += 1;
                calls > 1
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
