//! Embedding pipeline: a text → vector capability with remote and local
//! producers, an LRU cache decorator, and the write-triggered queue drained
//! by a single background worker.

pub mod cache;
pub mod local;
pub mod queue;
pub mod remote;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::CachedEmbedder;
pub use local::LocalEmbedder;
pub use queue::{EmbedQueue, EmbedStats, EmbedStatus};
pub use remote::{RemoteEmbedder, RemoteFlavor};

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding producer unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("bad embedding input: {0}")]
    BadInput(String),
}

/// The embedding capability. Implementations are selected by configuration
/// at startup and published behind `Arc<dyn Embedder>` after a successful
/// health probe.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds one text. The producer's own deadline applies; exceeding it
    /// surfaces as [`EmbedError::Timeout`].
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError>;

    fn model(&self) -> &str;

    fn dimension(&self) -> usize;
}

/// One probe call with a known input, used at startup to decide whether the
/// pipeline is published or demoted to disabled.
pub async fn health_probe(embedder: &dyn Embedder) -> std::result::Result<(), EmbedError> {
    let vector = embedder.embed("nornicdb startup probe").await?;
    if vector.len() != embedder.dimension() {
        return Err(EmbedError::DimensionMismatch {
            expected: embedder.dimension(),
            got: vector.len(),
        });
    }
    Ok(())
}
