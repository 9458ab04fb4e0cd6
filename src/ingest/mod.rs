// Ingestion module
// Offline pipeline that loads source memos from JSON, chunks their
// narratives, embeds each batch, and upserts the results into the vector
// store.


use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunking::{ChunkingConfig, chunk_id, split_text, text_length};
use crate::database::{ChunkMetadata, ChunkRecord, VectorStore};
use crate::embeddings::EmbeddingProvider;
use crate::{KbError, Result};

/// A credit memo as it arrives from the source system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMemo {
    pub memo_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub borrower_category: Option<String>,
    #[serde(default)]
    pub loan_type: Option<String>,
    #[serde(default)]
    pub risk_score: Option<i32>,
    #[serde(default)]
    pub recommendation: Option<String>,
    pub narrative: String,
}

/// Counters reported after an ingestion run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub memos_processed: usize,
    pub chunks_created: usize,
    pub chunks_written: u64,
    pub batches_skipped: usize,
}

/// Load source memos from a JSON array file
#[inline]
pub fn load_memos(path: &Path) -> Result<Vec<SourceMemo>> {
    let data = std::fs::read_to_string(path)?;
    let memos: Vec<SourceMemo> = serde_json::from_str(&data)
        .map_err(|e| KbError::Config(format!("Invalid memo file {}: {}", path.display(), e)))?;
    Ok(memos)
}

/// Chunk every memo narrative into ordered records awaiting embeddings.
///
/// Sequence indices are 1-based per memo. Risk scores outside 1..=5 are
/// logged and stored as null rather than rejecting the memo.
#[inline]
pub fn chunk_memos(memos: &[SourceMemo], config: &ChunkingConfig) -> Vec<ChunkRecord> {
    let mut records = Vec::new();

    for memo in memos {
        let risk_score = match memo.risk_score {
            Some(score) if !(1..=5).contains(&score) => {
                warn!(
                    "Memo {} has out-of-range risk score {}, storing as unrated",
                    memo.memo_id, score
                );
                None
            }
            other => other,
        };

        let metadata = ChunkMetadata {
            title: memo.title.clone(),
            borrower_category: memo.borrower_category.clone(),
            loan_type: memo.loan_type.clone(),
            risk_score,
            recommendation: memo.recommendation.clone(),
        };

        for (i, text) in split_text(&memo.narrative, config.max_chunk_length)
            .into_iter()
            .enumerate()
        {
            let sequence_index = (i + 1) as u32;
            records.push(ChunkRecord {
                chunk_id: chunk_id(&memo.memo_id, sequence_index),
                source_id: memo.memo_id.clone(),
                sequence_index,
                length: text_length(&text) as u32,
                text,
                metadata: metadata.clone(),
                embedding: Vec::new(),
            });
        }
    }

    records
}

/// Drives chunk batches through the embedding backend and into the store
pub struct Ingestor<'a, E, S> {
    embedder: &'a E,
    store: &'a mut S,
}

impl<'a, E: EmbeddingProvider, S: VectorStore> Ingestor<'a, E, S> {
    #[inline]
    pub fn new(embedder: &'a E, store: &'a mut S) -> Self {
        Self { embedder, store }
    }

    /// Embed and persist the given memos in batches of `batch_size`.
    ///
    /// A batch whose embedding request fails with an unavailable backend is
    /// logged and skipped; the remaining batches still go through. A
    /// dimension mismatch is a configuration error and aborts the run.
    #[inline]
    pub async fn ingest(
        &mut self,
        memos: &[SourceMemo],
        chunking: &ChunkingConfig,
        batch_size: usize,
    ) -> Result<IngestStats> {
        let records = chunk_memos(memos, chunking);
        let mut stats = IngestStats {
            memos_processed: memos.len(),
            chunks_created: records.len(),
            ..IngestStats::default()
        };

        if records.is_empty() {
            info!("No chunks produced from {} memos", memos.len());
            return Ok(stats);
        }

        let batch_count = records.len().div_ceil(batch_size);
        let bar = if console::user_attended_stderr() {
            ProgressBar::new(batch_count as u64).with_style(
                ProgressStyle::with_template("{spinner} [{pos}/{len}] Embedding batches")
                    .expect("style template is valid"),
            )
        } else {
            ProgressBar::hidden()
        };

        for batch in records.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

            let embeddings = match self.embedder.embed_batch(&texts) {
                Ok(embeddings) => embeddings,
                Err(KbError::EmbeddingUnavailable(e)) => {
                    warn!(
                        "Skipping batch of {} chunks, embedding backend unavailable: {}",
                        batch.len(),
                        e
                    );
                    stats.batches_skipped += 1;
                    bar.inc(1);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut embedded: Vec<ChunkRecord> = batch.to_vec();
            for (record, embedding) in embedded.iter_mut().zip(embeddings) {
                record.embedding = embedding;
            }

            let written = self.store.upsert(&embedded, batch_size).await?;
            stats.chunks_written += written;
            debug!("Wrote {} chunks in batch", written);
            bar.inc(1);
        }

        bar.finish_and_clear();
        info!(
            "Ingested {} memos: {} chunks created, {} written, {} batches skipped",
            stats.memos_processed, stats.chunks_created, stats.chunks_written, stats.batches_skipped
        );
        Ok(stats)
    }
}
