// Embeddings module
// Maps narrative text to fixed-dimension vectors, singly or in batches.

pub mod ollama;

pub use ollama::OllamaClient;

use crate::Result;

/// Capability required of an embedding backend.
///
/// `embed_batch` exists purely for throughput and must produce results
/// identical to calling `embed` element-wise, in input order. The dimension
/// is fixed at construction and never varies across calls from the same
/// instance.
pub trait EmbeddingProvider {
    /// Fixed output dimension of this provider
    fn dimension(&self) -> usize;

    /// Embed a single text. Empty text maps to the zero vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, order preserved 1:1 with the input.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
