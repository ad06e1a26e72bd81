//! Decoding of Dify `chat-messages` stream frames.
//!
//! Every frame is a JSON object whose `event` field names its shape. Known
//! kinds are checked structurally; anything that does not fit (a new kind, or
//! a known kind with missing fields) is kept as [`EventKind::Unknown`] with
//! every original field, so protocol additions never break the stream.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::DifyError;

const META_FIELDS: [&str; 4] = ["conversation_id", "message_id", "task_id", "created_at"];

/// Fields any event may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_at: Option<i64>,
}

impl EventMeta {
    fn from_fields(fields: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            conversation_id: text("conversation_id"),
            message_id: text("message_id"),
            task_id: text("task_id"),
            created_at: fields.get("created_at").and_then(|value| {
                value
                    .as_i64()
                    .or_else(|| value.as_f64().map(|seconds| seconds as i64))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunData {
    pub id: String,
    pub workflow_id: String,
    pub created_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStarted {
    pub workflow_run_id: String,
    pub data: WorkflowRunData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFinishedData {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    pub created_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFinished {
    pub workflow_run_id: String,
    pub data: WorkflowFinishedData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    pub node_id: String,
    pub node_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub workflow_run_id: String,
    pub data: NodeData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(default)]
    pub id: Option<String>,
    pub answer: String,
    #[serde(default)]
    pub from_variable_selector: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEndMetadata {
    pub usage: TokenUsage,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnd {
    pub id: String,
    pub metadata: MessageEndMetadata,
    #[serde(default)]
    pub files: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsAudio {
    pub audio: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    WorkflowStarted(WorkflowStarted),
    WorkflowFinished(WorkflowFinished),
    NodeStarted(NodeEvent),
    NodeFinished(NodeEvent),
    Message(MessageChunk),
    MessageEnd(MessageEnd),
    TtsMessage(TtsAudio),
    TtsMessageEnd(TtsAudio),
    /// Unrecognised or partially shaped event, with the full original object.
    Unknown {
        event: String,
        fields: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub meta: EventMeta,
    pub kind: EventKind,
}

impl StreamEvent {
    /// The `event` discriminator as sent by the remote.
    pub fn name(&self) -> &str {
        match &self.kind {
            EventKind::WorkflowStarted(_) => "workflow_started",
            EventKind::WorkflowFinished(_) => "workflow_finished",
            EventKind::NodeStarted(_) => "node_started",
            EventKind::NodeFinished(_) => "node_finished",
            EventKind::Message(_) => "message",
            EventKind::MessageEnd(_) => "message_end",
            EventKind::TtsMessage(_) => "tts_message",
            EventKind::TtsMessageEnd(_) => "tts_message_end",
            EventKind::Unknown { event, .. } => event.as_str(),
        }
    }

    pub fn is_workflow_finished(&self) -> bool {
        self.name() == "workflow_finished"
    }

    /// `data.total_tokens` of a `workflow_finished` event, read from the raw
    /// fields when the event did not match the full shape.
    pub fn workflow_total_tokens(&self) -> Option<u64> {
        match &self.kind {
            EventKind::WorkflowFinished(finished) => finished.data.total_tokens,
            EventKind::Unknown { event, fields } if event == "workflow_finished" => fields
                .get("data")
                .and_then(|data| data.get("total_tokens"))
                .and_then(|tokens| {
                    tokens
                        .as_u64()
                        .or_else(|| tokens.as_f64().map(|value| value as u64))
                }),
            _ => None,
        }
    }

    /// Message id from the envelope, falling back to the `id` of message events.
    pub fn message_id(&self) -> Option<&str> {
        if let Some(message_id) = self.meta.message_id.as_deref() {
            return Some(message_id);
        }
        match &self.kind {
            EventKind::Message(message) => message.id.as_deref(),
            EventKind::MessageEnd(end) => Some(end.id.as_str()),
            _ => None,
        }
    }
}

pub fn decode_event(frame: &str) -> Result<StreamEvent, DifyError> {
    let value: Value = serde_json::from_str(frame).map_err(|error| {
        DifyError::decode(format!("Invalid Dify stream event JSON: {error}"))
            .with_details(json!({ "frame": frame }))
    })?;
    let Value::Object(fields) = value else {
        return Err(DifyError::decode("Dify stream event is not a JSON object")
            .with_details(json!({ "frame": frame })));
    };
    let Some(event) = fields.get("event").and_then(Value::as_str).map(str::to_string) else {
        return Err(DifyError::decode("Dify stream event missing `event` field")
            .with_details(json!({ "frame": frame })));
    };

    let meta = EventMeta::from_fields(&fields);
    let kind = match event.as_str() {
        "workflow_started" => shaped(&fields, EventKind::WorkflowStarted),
        "workflow_finished" => shaped(&fields, EventKind::WorkflowFinished),
        "node_started" => shaped(&fields, EventKind::NodeStarted),
        "node_finished" => shaped(&fields, EventKind::NodeFinished),
        "message" => shaped(&fields, EventKind::Message),
        "message_end" => shaped(&fields, EventKind::MessageEnd),
        "tts_message" => shaped(&fields, EventKind::TtsMessage),
        "tts_message_end" => shaped(&fields, EventKind::TtsMessageEnd),
        _ => None,
    }
    .unwrap_or(EventKind::Unknown { event, fields });

    Ok(StreamEvent { meta, kind })
}

fn shaped<T, F>(fields: &Map<String, Value>, wrap: F) -> Option<EventKind>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> EventKind,
{
    let mut payload = fields.clone();
    payload.remove("event");
    for key in META_FIELDS {
        payload.remove(key);
    }
    serde_json::from_value::<T>(Value::Object(payload))
        .ok()
        .map(wrap)
}
