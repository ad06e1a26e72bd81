//! Dify chat-messages adapter behind a provider-agnostic chat-model contract.

mod abort;
mod error;
mod event;
mod model;
mod projector;
mod provider;
mod request;
mod session;
mod sse;
mod stream;
mod transport;
mod types;

pub use abort::{AbortController, AbortSignal};
pub use error::{DifyError, DifyErrorCode};
pub use event::{
    decode_event, EventKind, EventMeta, MessageChunk, MessageEnd, MessageEndMetadata, NodeData,
    NodeEvent, StreamEvent, TokenUsage, TtsAudio, WorkflowFinished, WorkflowFinishedData,
    WorkflowRunData, WorkflowStarted,
};
pub use model::{DifyChatLanguageModel, DifyChatSettings};
pub use projector::{project_blocking, StreamProjector};
pub use provider::{DifyProvider, DifyProviderSettings, API_KEY_ENV, DEFAULT_BASE_URL, PROVIDER_ID};
pub use request::{
    build_request, extract_query, is_new_conversation, resolve_conversation_id, OutboundRequest,
    RequestDefaults, ResponseFormat, ResponseMode,
};
pub use session::{
    ConversationScope, ConversationStore, ConversationStoreRef, InMemoryConversationStore,
    SessionManager, StorePolicy, DEFAULT_SESSION_MAX_ENTRIES, DEFAULT_SESSION_TTL,
};
pub use sse::SseFrameReader;
pub use stream::ChatStream;
pub use transport::{
    parse_blocking_response, remote_error, BlockingMetadata, BlockingResponse, BlockingUsage,
    BoxChunkSource, ChatTransport, ChatTransportRef, ChunkSource, ErrorEnvelope, HttpTransport,
};
pub use types::{
    Attachment, CallOptions, DifyMetadata, FinishReason, GenerateResult, GenerationMode, Role,
    StreamPart, Turn, TurnContent, TurnPart, Usage,
};
