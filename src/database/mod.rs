// Vector database module
// Persists narrative chunks with their embeddings and answers filtered
// similarity queries.

pub mod lancedb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;

/// A chunk of memo narrative ready for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Unique identifier, derived from `(source_id, sequence_index)`
    pub chunk_id: String,
    /// Identifier of the originating memo (not unique alone)
    pub source_id: String,
    /// 1-based position of this chunk within its source
    pub sequence_index: u32,
    /// The chunk text
    pub text: String,
    /// Length of `text` in characters
    pub length: u32,
    /// Provenance metadata, frozen after first insert
    pub metadata: ChunkMetadata,
    /// Fixed-dimension embedding vector
    pub embedding: Vec<f32>,
}

/// Metadata stored alongside a chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: Option<String>,
    pub borrower_category: Option<String>,
    pub loan_type: Option<String>,
    /// Risk score in 1..=5
    pub risk_score: Option<i32>,
    pub recommendation: Option<String>,
}

/// Optional equality/substring filters applied during search
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Exact match on risk score
    pub risk_score: Option<i32>,
    /// Case-insensitive substring match on borrower category.
    ///
    /// The value is wrapped in a `LIKE '%..%'` pattern, so `%` and `_`
    /// inside it act as wildcards rather than literal characters.
    pub borrower_category: Option<String>,
}

/// A search hit annotated with its cosine similarity
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub source_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// `1 - cosine_distance`, higher is better
    pub similarity: f32,
    pub distance: f32,
}

/// Aggregate statistics over the stored collection
#[derive(Debug, Clone, Default, Serialize)]
pub struct KbStatistics {
    pub total_chunks: u64,
    /// Chunk count per risk score
    pub risk_score_distribution: BTreeMap<i32, u64>,
    /// Most frequent borrower categories, descending by count
    pub top_borrower_categories: Vec<(String, u64)>,
    pub embedding_dimension: Option<usize>,
}

/// Connection lifecycle of a store client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Capability required of the backing store: schema lifecycle, idempotent
/// upsert, ANN similarity search with metadata filters, aggregate
/// statistics.
///
/// When the client is not `Connected`, mutating and query operations
/// degrade to empty results instead of failing, so a missing store never
/// crashes the caller. `setup` is the exception: schema creation is fatal
/// at initialization time.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    /// Idempotent creation of the chunk table for the given embedding
    /// dimension. Re-invoking on an existing schema is a no-op; an existing
    /// schema with a different dimension is a fatal configuration error.
    async fn setup(&mut self, dimension: usize) -> Result<()>;

    /// Insert chunks in batches; on `chunk_id` conflict only `text`,
    /// `length`, and `embedding` are replaced. Returns the number of rows
    /// actually written; a failed batch is logged and skipped.
    async fn upsert(&mut self, chunks: &[ChunkRecord], batch_size: usize) -> Result<u64>;

    /// ANN search ranked by cosine similarity descending, ties broken by
    /// `chunk_id` ascending. Returns up to `limit` rows.
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>>;

    async fn statistics(&self) -> Result<KbStatistics>;

    /// Remove every chunk from the collection
    async fn clear(&mut self) -> Result<()>;

    /// Release the connection; subsequent operations are no-ops
    async fn close(&mut self);
}
