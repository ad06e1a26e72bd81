use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::abort::AbortSignal;
use crate::error::DifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "file")]
    File {
        url: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<TurnPart>),
}

/// One message of the conversation as the caller sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<TurnPart>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Parts(parts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationMode {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "structured-json")]
    StructuredJson,
    #[serde(rename = "tool-call")]
    ToolCall,
}

/// File descriptor produced by the upload route. Unknown fields ride along
/// untouched into the outbound `files` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transfer_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upload_file_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token accounting. `NaN` means the remote did not report the count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: f64,
    #[serde(rename = "completionTokens")]
    pub completion_tokens: f64,
}

impl Usage {
    pub fn unknown() -> Self {
        Self {
            prompt_tokens: f64::NAN,
            completion_tokens: f64::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    #[serde(rename = "stop")]
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifyMetadata {
    #[serde(rename = "conversationId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamPart {
    #[serde(rename = "text-delta")]
    TextDelta {
        #[serde(rename = "textDelta")]
        text_delta: String,
    },
    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        usage: Usage,
        #[serde(rename = "difyWorkflowData")]
        metadata: DifyMetadata,
    },
    #[serde(rename = "error")]
    Error { error: DifyError },
}

impl StreamPart {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::TextDelta { .. } => false,
            Self::Finish { .. } => true,
            Self::Error { error } => !error.is_recoverable(),
        }
    }

    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::TextDelta { text_delta } => Some(text_delta.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    #[serde(rename = "finishReason")]
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub metadata: DifyMetadata,
    /// The JSON body that was posted to `chat-messages`.
    #[serde(rename = "requestBody")]
    pub request_body: Value,
}

/// Per-call knobs that do not belong to the turn list.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Caller's chat/thread key. Keys the shared conversation store.
    pub handle: Option<String>,
    /// Always wins over tracked state when set.
    pub conversation_id: Option<String>,
    pub user: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: HashMap<String, String>,
    pub signal: Option<AbortSignal>,
}

impl CallOptions {
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}
