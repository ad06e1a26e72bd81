use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::abort::AbortSignal;
use crate::error::{DifyError, DifyErrorCode};
use crate::projector::{project_blocking, StreamProjector};
use crate::request::{build_request, OutboundRequest, RequestDefaults, ResponseMode};
use crate::session::{ConversationScope, ConversationStoreRef, SessionManager};
use crate::stream::ChatStream;
use crate::transport::ChatTransportRef;
use crate::types::{CallOptions, GenerateResult, GenerationMode, Turn};

/// Per-model settings for a Dify app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifyChatSettings {
    /// App variables sent as `inputs` on every call.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// End-user identifier used when a call does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_generate_name: Option<bool>,
    /// Falls back to `DIFY_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

pub struct DifyChatLanguageModel {
    model_id: String,
    provider: String,
    settings: DifyChatSettings,
    transport: ChatTransportRef,
    store: ConversationStoreRef,
    session: Arc<SessionManager>,
}

impl DifyChatLanguageModel {
    pub fn new(
        model_id: impl Into<String>,
        provider: impl Into<String>,
        settings: DifyChatSettings,
        transport: ChatTransportRef,
        store: ConversationStoreRef,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
            settings,
            transport,
            store,
            session: Arc::new(SessionManager::new()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn settings(&self) -> &DifyChatSettings {
        &self.settings
    }

    pub fn supports_structured_outputs(&self) -> bool {
        true
    }

    /// Conversation cell used by calls without a handle.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn conversation_store(&self) -> &ConversationStoreRef {
        &self.store
    }

    /// One blocking call; returns the full answer.
    pub async fn generate(
        &self,
        turns: &[Turn],
        mode: &GenerationMode,
        options: CallOptions,
    ) -> Result<GenerateResult, DifyError> {
        let scope = self.scope(&options);
        let request = self.build(turns, mode, &scope, &options, ResponseMode::Blocking)?;
        let request_body = encode_body(&request)?;
        debug!(model = %self.model_id, body = %request_body, "Dify blocking request");

        let response = until_aborted(
            options.signal.as_ref(),
            self.transport.send_blocking(&request, &options.headers),
        )
        .await?;

        if let Some(conversation_id) = response.conversation_id.as_deref() {
            scope.observe(conversation_id);
        }
        Ok(project_blocking(&response, request_body))
    }

    /// Opens a streaming call. Turn-shape and mode errors, as well as a
    /// non-success HTTP status, fail here; everything after the first byte is
    /// reported through the returned sequence.
    pub async fn stream(
        &self,
        turns: &[Turn],
        mode: &GenerationMode,
        options: CallOptions,
    ) -> Result<ChatStream, DifyError> {
        let scope = self.scope(&options);
        let request = self.build(turns, mode, &scope, &options, ResponseMode::Streaming)?;
        let request_body = encode_body(&request)?;
        debug!(model = %self.model_id, body = %request_body, "Dify streaming request");

        let source = until_aborted(
            options.signal.as_ref(),
            self.transport.open_stream(&request, &options.headers),
        )
        .await?;

        Ok(ChatStream::new(
            source,
            StreamProjector::new(scope),
            options.signal,
            request_body,
        ))
    }

    fn scope(&self, options: &CallOptions) -> ConversationScope {
        ConversationScope::new(
            Arc::clone(&self.store),
            Arc::clone(&self.session),
            options.handle.clone(),
        )
    }

    fn build(
        &self,
        turns: &[Turn],
        mode: &GenerationMode,
        scope: &ConversationScope,
        options: &CallOptions,
        response_mode: ResponseMode,
    ) -> Result<OutboundRequest, DifyError> {
        build_request(
            turns,
            mode,
            scope,
            options,
            RequestDefaults {
                inputs: &self.settings.inputs,
                user: self.settings.user.as_deref(),
                auto_generate_name: self.settings.auto_generate_name,
            },
            response_mode,
        )
    }
}

fn encode_body(request: &OutboundRequest) -> Result<Value, DifyError> {
    serde_json::to_value(request).map_err(|error| {
        DifyError::new(
            DifyErrorCode::Protocol,
            format!("Failed to encode Dify request: {error}"),
        )
    })
}

async fn until_aborted<T, F>(signal: Option<&AbortSignal>, call: F) -> Result<T, DifyError>
where
    F: Future<Output = Result<T, DifyError>>,
{
    let Some(signal) = signal else {
        return call.await;
    };
    if signal.is_aborted() {
        return Err(DifyError::aborted());
    }
    tokio::select! {
        _ = signal.cancelled() => Err(DifyError::aborted()),
        result = call => result,
    }
}
