use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DifyError, DifyErrorCode};
use crate::model::{DifyChatLanguageModel, DifyChatSettings};
use crate::session::{ConversationStoreRef, InMemoryConversationStore};
use crate::transport::{ChatTransportRef, HttpTransport};

pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai/v1";
pub const API_KEY_ENV: &str = "DIFY_API_KEY";
pub const PROVIDER_ID: &str = "dify.chat";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifyProviderSettings {
    /// Defaults to [`DEFAULT_BASE_URL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Builds chat models that share one conversation store.
pub struct DifyProvider {
    settings: DifyProviderSettings,
    store: ConversationStoreRef,
}

impl DifyProvider {
    pub fn new(settings: DifyProviderSettings) -> Self {
        Self {
            settings,
            store: Arc::new(InMemoryConversationStore::default()),
        }
    }

    pub fn with_conversation_store(mut self, store: ConversationStoreRef) -> Self {
        self.store = store;
        self
    }

    pub fn base_url(&self) -> &str {
        self.settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn conversation_store(&self) -> &ConversationStoreRef {
        &self.store
    }

    /// Creates a model talking HTTP to the configured Dify endpoint.
    pub fn chat(
        &self,
        model_id: impl Into<String>,
        settings: DifyChatSettings,
    ) -> Result<DifyChatLanguageModel, DifyError> {
        let api_key = resolve_api_key(settings.api_key.as_deref(), env::var(API_KEY_ENV).ok())?;
        let headers = provider_headers(&api_key, &self.settings.headers);
        let transport: ChatTransportRef = Arc::new(HttpTransport::new(self.base_url(), headers));
        Ok(self.chat_with_transport(model_id, settings, transport))
    }

    /// Creates a model over an arbitrary transport.
    pub fn chat_with_transport(
        &self,
        model_id: impl Into<String>,
        settings: DifyChatSettings,
        transport: ChatTransportRef,
    ) -> DifyChatLanguageModel {
        DifyChatLanguageModel::new(
            model_id,
            PROVIDER_ID,
            settings,
            transport,
            Arc::clone(&self.store),
        )
    }
}

impl Default for DifyProvider {
    fn default() -> Self {
        Self::new(DifyProviderSettings::default())
    }
}

/// Custom headers replace the bearer header when they name it in any case.
fn provider_headers(api_key: &str, custom: &HashMap<String, String>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if !custom
        .keys()
        .any(|name| name.trim().eq_ignore_ascii_case("authorization"))
    {
        headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
    }
    headers.extend(custom.clone());
    headers
}

fn resolve_api_key(explicit: Option<&str>, from_env: Option<String>) -> Result<String, DifyError> {
    if let Some(api_key) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(api_key.to_string());
    }
    if let Some(api_key) = from_env.filter(|value| !value.trim().is_empty()) {
        return Ok(api_key.trim().to_string());
    }
    Err(DifyError::new(
        DifyErrorCode::AuthMissing,
        format!(
            "Dify API key is missing. Pass it using the 'api_key' setting or the {API_KEY_ENV} environment variable."
        ),
    ))
}
