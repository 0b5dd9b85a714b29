use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub mod emit;
pub mod engine;
pub mod event;
pub mod resolve;
pub mod session;
pub mod sse;
pub mod thinking;
pub mod trace;

pub use emit::{ChunkEmitter, EmitterState, SseFrame};
pub use engine::{RelayEngine, RelaySettings};
pub use event::{ErrorDepth, Phase, UpstreamErrorDetail, UpstreamEvent};
pub use resolve::{
    AliasTemplateResolver, FixedModelResolver, ModelResolutionError, ModelResolver, ResolvedModel,
    Template,
};
pub use session::{SystemRolePolicy, UpstreamRequest};
pub use sse::SseLineDecoder;
pub use thinking::{ContentTransform, ThinkingMode};
pub use trace::{RequestOutcome, RequestTrace, StatsSink};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    ModelResolution(#[from] ModelResolutionError),
    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),
    #[error("upstream transport failed: {0}")]
    UpstreamTransport(String),
    #[error("upstream returned status {status}: {detail}")]
    UpstreamStatus { status: u16, detail: String },
    #[error("internal error: {0}")]
    Internal(String),
}

/// Raw upstream response body, delivered in whatever pieces the transport hands out.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CoreError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamModel {
    pub id: String,
    pub name: Option<String>,
}

impl UpstreamModel {
    pub fn label(&self) -> &str {
        self.name.as_deref().filter(|name| !name.trim().is_empty()).unwrap_or(&self.id)
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Value reported as `owned_by` in the model list.
    fn owned_by(&self) -> &str;

    /// Sends the chat request and returns the SSE body once the upstream answered 2xx.
    async fn open_chat(&self, request: &UpstreamRequest) -> Result<ByteStream, CoreError>;

    async fn list_models(&self) -> Result<Vec<UpstreamModel>, CoreError>;
}
