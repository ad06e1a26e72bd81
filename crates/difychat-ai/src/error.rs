use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifyErrorCode {
    /// The caller violated the turn-shape contract.
    Protocol,
    UnsupportedMode,
    /// Non-success HTTP status with a parsed error envelope.
    Remote,
    Decode,
    /// Network failure or abort.
    Transport,
    AuthMissing,
    Config,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifyError {
    pub code: DifyErrorCode,
    pub message: String,
    #[serde(rename = "httpStatus", skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl DifyError {
    pub fn new(code: DifyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: None,
            details: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DifyErrorCode::Protocol, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DifyErrorCode::Decode, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(DifyErrorCode::Transport, message)
    }

    pub fn aborted() -> Self {
        Self::transport("request aborted")
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Per-frame decode failures are reported in-band and do not end a stream.
    pub fn is_recoverable(&self) -> bool {
        self.code == DifyErrorCode::Decode
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"transport\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for DifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{:?} (HTTP {status}): {}", self.code, self.message),
            None => write!(f, "{:?}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for DifyError {}
