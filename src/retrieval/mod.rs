// Retrieval module
// Turns structured financial signals into a semantic query, ranks stored
// memo chunks against it, and renders the survivors into an LLM-ready
// context string. Everything here is best-effort: the generation step that
// consumes the context must never fail because retrieval did.


use tracing::{debug, info, warn};

use crate::Result;
use crate::config::RetrievalConfig;
use crate::database::{KbStatistics, SearchFilters, SearchResult, VectorStore};
use crate::embeddings::EmbeddingProvider;

/// Fixed sentinel returned whenever no usable context exists
pub const NO_EXAMPLES_SENTINEL: &str = "No relevant examples found in knowledge base.";

/// Structured financial signals describing the memo under preparation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinancialSignals {
    /// Debt service coverage ratio
    pub dscr: Option<f64>,
    pub current_ratio: Option<f64>,
    pub leverage_ratio: Option<f64>,
    pub industry: Option<String>,
}

/// Map ratio buckets to descriptive phrases and concatenate with the
/// industry descriptor. Missing ratios are omitted; a missing industry
/// falls back to the generic "business".
///
/// A ratio of zero is present data and gets bucketed like any other value
/// (weakest coverage and liquidity buckets, lowest leverage bucket). Only
/// `None` is omitted.
#[inline]
pub fn build_query(signals: &FinancialSignals) -> String {
    let mut parts = Vec::new();

    parts.push(
        signals
            .industry
            .clone()
            .unwrap_or_else(|| "business".to_string()),
    );

    if let Some(dscr) = signals.dscr {
        if dscr >= 1.5 {
            parts.push("strong debt service coverage".to_string());
        } else if dscr >= 1.25 {
            parts.push("adequate debt service coverage".to_string());
        } else {
            parts.push("weak debt service coverage".to_string());
        }
    }

    if let Some(current_ratio) = signals.current_ratio {
        if current_ratio >= 2.0 {
            parts.push("strong liquidity".to_string());
        } else if current_ratio >= 1.5 {
            parts.push("adequate liquidity".to_string());
        } else {
            parts.push("liquidity concerns".to_string());
        }
    }

    if let Some(leverage) = signals.leverage_ratio {
        if leverage <= 0.3 {
            parts.push("low leverage".to_string());
        } else if leverage <= 0.5 {
            parts.push("moderate leverage".to_string());
        } else {
            parts.push("high leverage".to_string());
        }
    }

    parts.join(" ")
}

/// Render retrieved chunks as numbered example blocks for the generation
/// prompt. Zero results renders the fixed sentinel.
#[inline]
pub fn format_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return NO_EXAMPLES_SENTINEL.to_string();
    }

    let mut blocks = Vec::with_capacity(results.len());
    for (i, result) in results.iter().enumerate() {
        let mut lines = vec![
            format!("--- Example {} ---", i + 1),
            format!("Memo ID: {}", result.source_id),
            format!(
                "Title: {}",
                result.metadata.title.as_deref().unwrap_or("unknown")
            ),
            format!(
                "Borrower Type: {}",
                result
                    .metadata
                    .borrower_category
                    .as_deref()
                    .unwrap_or("unknown")
            ),
            format!(
                "Loan Type: {}",
                result.metadata.loan_type.as_deref().unwrap_or("unknown")
            ),
            match result.metadata.risk_score {
                Some(score) => format!("Risk Score: {}/5", score),
                None => "Risk Score: unrated".to_string(),
            },
            format!("Similarity: {:.3}", result.similarity),
            String::new(),
            "Risk Analysis:".to_string(),
            result.text.clone(),
        ];

        if let Some(recommendation) = &result.metadata.recommendation {
            lines.push(String::new());
            lines.push(format!("Recommendation: {}", recommendation));
        }

        blocks.push(lines.join("\n"));
    }

    blocks.join("\n\n")
}

/// Orchestrates query embedding, similarity search, threshold filtering,
/// and context formatting over any embedding backend and vector store.
pub struct Retriever<E, S> {
    embedder: E,
    store: S,
    config: RetrievalConfig,
}

impl<E: EmbeddingProvider, S: VectorStore> Retriever<E, S> {
    #[inline]
    pub fn new(embedder: E, store: S, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    /// Retrieve up to `limit` chunks with similarity at or above
    /// `threshold`.
    ///
    /// The store is asked for an oversampled candidate set to compensate
    /// for threshold losses. If fewer than `limit` candidates survive, the
    /// smaller set is returned as-is; there is no retry with a relaxed
    /// threshold or larger oversample.
    #[inline]
    pub async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResult>> {
        self.retrieve_filtered(query, limit, threshold, &SearchFilters::default())
            .await
    }

    /// `retrieve` with optional metadata filters pushed down to the store
    #[inline]
    pub async fn retrieve_filtered(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let query_embedding = self.embedder.embed(query)?;

        let candidates = self
            .store
            .search(
                &query_embedding,
                limit * self.config.oversample_factor,
                filters,
            )
            .await?;

        let results: Vec<SearchResult> = candidates
            .into_iter()
            .filter(|r| r.similarity >= threshold)
            .take(limit)
            .collect();

        debug!(
            "Retrieved {} chunks above threshold {} for query '{}'",
            results.len(),
            threshold,
            query
        );
        Ok(results)
    }

    /// Retrieve prior-memo context for a financial profile and render it
    /// for the generation prompt.
    ///
    /// This is the sole contract the enclosing generation workflow depends
    /// on: it never fails and always returns a non-empty string, degrading
    /// to the sentinel when the store or the embedding backend is
    /// unavailable.
    #[inline]
    pub async fn retrieve_similar(&self, signals: &FinancialSignals, limit: usize) -> String {
        let query = build_query(signals);
        debug!("Knowledge base query: {}", query);

        match self
            .retrieve(&query, limit, self.config.similarity_threshold)
            .await
        {
            Ok(results) => {
                if results.is_empty() {
                    info!("No similar memos found for query '{}'", query);
                } else {
                    info!("Retrieved {} similar memo chunks", results.len());
                }
                format_context(&results)
            }
            Err(e) => {
                warn!("Retrieval degraded to empty context: {}", e);
                NO_EXAMPLES_SENTINEL.to_string()
            }
        }
    }

    /// Keyword-driven retrieval with an optional risk score filter,
    /// rendered like `retrieve_similar`
    #[inline]
    pub async fn retrieve_by_keywords(
        &self,
        keywords: &[String],
        limit: usize,
        risk_score: Option<i32>,
    ) -> String {
        let query = keywords.join(" ");
        let filters = SearchFilters {
            risk_score,
            borrower_category: None,
        };

        match self
            .retrieve_filtered(&query, limit, self.config.similarity_threshold, &filters)
            .await
        {
            Ok(results) => format_context(&results),
            Err(e) => {
                warn!("Keyword retrieval degraded to empty context: {}", e);
                NO_EXAMPLES_SENTINEL.to_string()
            }
        }
    }

    /// Aggregate statistics of the underlying knowledge base
    #[inline]
    pub async fn statistics(&self) -> Result<KbStatistics> {
        self.store.statistics().await
    }

    /// Release the store connection
    #[inline]
    pub async fn close(&mut self) {
        self.store.close().await;
    }
}
