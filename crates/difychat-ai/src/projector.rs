use serde_json::Value;
use tracing::{debug, warn};

use crate::error::DifyError;
use crate::event::{EventKind, StreamEvent};
use crate::session::ConversationScope;
use crate::transport::BlockingResponse;
use crate::types::{DifyMetadata, FinishReason, GenerateResult, StreamPart, Usage};

pub fn project_blocking(response: &BlockingResponse, request_body: Value) -> GenerateResult {
    let usage = response
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.usage.as_ref());
    let tokens = |pick: fn(&crate::transport::BlockingUsage) -> Option<u64>| {
        usage
            .and_then(pick)
            .map(|value| value as f64)
            .unwrap_or(f64::NAN)
    };

    GenerateResult {
        text: response.answer.clone(),
        finish_reason: FinishReason::Stop,
        usage: Usage {
            prompt_tokens: tokens(|usage| usage.prompt_tokens),
            completion_tokens: tokens(|usage| usage.completion_tokens),
        },
        metadata: DifyMetadata {
            conversation_id: response.conversation_id.clone(),
            message_id: response.message_id.clone().or_else(|| response.id.clone()),
            task_id: response.task_id.clone(),
        },
        request_body,
    }
}

/// Folds decoded stream events into [`StreamPart`]s for one call.
///
/// Usage on the streaming path comes from `workflow_finished`, which only
/// reports a total: it is surfaced as `completion_tokens` with
/// `prompt_tokens = 0`. Blocking calls report both counts, so the two paths
/// do not agree; callers should not sum them across modes.
pub struct StreamProjector {
    scope: ConversationScope,
    metadata: DifyMetadata,
    message_end_usage: Option<Usage>,
    finished: bool,
}

impl StreamProjector {
    pub fn new(scope: ConversationScope) -> Self {
        Self {
            scope,
            metadata: DifyMetadata::default(),
            message_end_usage: None,
            finished: false,
        }
    }

    /// True once the terminal part has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn metadata(&self) -> &DifyMetadata {
        &self.metadata
    }

    pub fn project(&mut self, decoded: Result<StreamEvent, DifyError>) -> Option<StreamPart> {
        if self.finished {
            return None;
        }
        let event = match decoded {
            Ok(event) => event,
            Err(error) => {
                warn!(error = %error, "skipping undecodable Dify stream frame");
                return Some(StreamPart::Error { error });
            }
        };
        self.observe(&event);

        if event.is_workflow_finished() {
            let total_tokens = event.workflow_total_tokens().unwrap_or(0);
            return Some(self.finish(Usage {
                prompt_tokens: 0.0,
                completion_tokens: total_tokens as f64,
            }));
        }

        match event.kind {
            EventKind::Message(message) => Some(StreamPart::TextDelta {
                text_delta: message.answer,
            }),
            EventKind::MessageEnd(end) => {
                let usage = &end.metadata.usage;
                self.message_end_usage = Some(Usage {
                    prompt_tokens: usage.prompt_tokens as f64,
                    completion_tokens: usage.completion_tokens as f64,
                });
                None
            }
            _ => None,
        }
    }

    /// Terminal part for a body that ended without `workflow_finished`.
    /// Plain chat apps only send `message_end`, whose usage is used then.
    pub fn end_of_stream(&mut self) -> Option<StreamPart> {
        if self.finished {
            return None;
        }
        if let Some(usage) = self.message_end_usage {
            return Some(self.finish(usage));
        }
        self.finished = true;
        Some(StreamPart::Error {
            error: DifyError::transport("Dify stream ended before a terminal event"),
        })
    }

    fn observe(&mut self, event: &StreamEvent) {
        if let Some(conversation_id) = event.meta.conversation_id.as_deref() {
            self.scope.observe(conversation_id);
            self.metadata.conversation_id = Some(conversation_id.to_string());
        }
        if let Some(message_id) = event.message_id() {
            self.metadata.message_id = Some(message_id.to_string());
        }
        if let Some(task_id) = event.meta.task_id.as_deref() {
            self.metadata.task_id = Some(task_id.to_string());
        }
        debug!(event = event.name(), "observed Dify stream event");
    }

    fn finish(&mut self, usage: Usage) -> StreamPart {
        self.finished = true;
        StreamPart::Finish {
            finish_reason: FinishReason::Stop,
            usage,
            metadata: self.metadata.clone(),
        }
    }
}
