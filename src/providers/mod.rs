use crate::types::{CompletionRequest, CompletionResponse, ProviderDescriptor, StreamChunk};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Errors raised by backend adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("{0}")]
    Other(String),
}

/// Trait every backend adapter implements.
///
/// Adapters must not retry internally and must not swallow errors; retries
/// and failover are the request manager's job.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static configuration for this backend.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Execute a completion (non-streaming).
    async fn complete(&self, request: &CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;

    /// Stream a completion. The sequence is finite and not restartable; a
    /// mid-stream failure terminates it with `Err` rather than truncating
    /// silently.
    fn stream_complete(
        &self,
        request: &CompletionRequest,
    ) -> BoxStream<'static, Result<StreamChunk, ProviderError>>;
}
