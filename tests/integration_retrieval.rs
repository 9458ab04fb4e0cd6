#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

use memo_kb::Result;
use memo_kb::chunking::ChunkingConfig;
use memo_kb::config::RetrievalConfig;
use memo_kb::database::lancedb::LanceVectorStore;
use memo_kb::database::VectorStore;
use memo_kb::embeddings::EmbeddingProvider;
use memo_kb::ingest::{Ingestor, SourceMemo};
use memo_kb::retrieval::{FinancialSignals, NO_EXAMPLES_SENTINEL, Retriever};
use tempfile::TempDir;

const DIMENSION: usize = 8;

/// Deterministic bag-of-terms embedder: each vocabulary term owns one axis,
/// so texts sharing terms score high cosine similarity.
struct TermEmbedder;

const VOCABULARY: [&str; DIMENSION] = [
    "coverage",
    "liquidity",
    "leverage",
    "bakery",
    "manufacturing",
    "equipment",
    "strong",
    "weak",
];

#[expect(
    clippy::cast_precision_loss,
    reason = "term counts are tiny in these tests"
)]
fn term_vector(text: &str) -> Vec<f32> {
    let lowered = text.to_lowercase();
    let mut vector: Vec<f32> = VOCABULARY
        .iter()
        .map(|term| lowered.matches(term).count() as f32)
        .collect();
    // Avoid the zero vector so cosine distance stays defined
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 0.001;
    }
    vector
}

impl EmbeddingProvider for TermEmbedder {
    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(term_vector(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

fn memo(
    memo_id: &str,
    borrower_category: &str,
    risk_score: i32,
    narrative: &str,
) -> SourceMemo {
    SourceMemo {
        memo_id: memo_id.to_string(),
        title: Some(format!("Memo {}", memo_id)),
        borrower_category: Some(borrower_category.to_string()),
        loan_type: Some("Term Loan".to_string()),
        risk_score: Some(risk_score),
        recommendation: Some("Approve with standard covenants".to_string()),
        narrative: narrative.to_string(),
    }
}

async fn seeded_store(temp_dir: &TempDir) -> LanceVectorStore {
    let mut store = LanceVectorStore::connect(&temp_dir.path().join("vectors"), "memo_chunks").await;
    store.setup(DIMENSION).await.expect("setup should succeed");

    let memos = vec![
        memo(
            "CM-100",
            "Retail Bakery",
            2,
            "The bakery shows strong coverage and strong liquidity with low leverage.",
        ),
        memo(
            "CM-200",
            "Manufacturing",
            4,
            "The manufacturing borrower carries weak coverage and high leverage.",
        ),
        memo(
            "CM-300",
            "Equipment Rental",
            3,
            "Equipment utilization supports adequate coverage.",
        ),
    ];

    let stats = Ingestor::new(&TermEmbedder, &mut store)
        .ingest(&memos, &ChunkingConfig::default(), 100)
        .await
        .expect("ingest should succeed");
    assert_eq!(stats.chunks_written, 3);

    store
}

#[tokio::test]
async fn ingest_then_retrieve_returns_formatted_context() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = seeded_store(&temp_dir).await;
    let retriever = Retriever::new(TermEmbedder, store, RetrievalConfig::default());

    let signals = FinancialSignals {
        dscr: Some(1.6),
        current_ratio: Some(2.2),
        leverage_ratio: Some(0.2),
        industry: Some("bakery".to_string()),
    };
    let context = retriever.retrieve_similar(&signals, 3).await;

    assert!(context.contains("--- Example 1 ---"));
    assert!(context.contains("Memo ID: CM-100"));
    assert!(context.contains("Borrower Type: Retail Bakery"));
    assert!(context.contains("Risk Score: 2/5"));
    assert!(context.contains("Recommendation: Approve with standard covenants"));
}

#[tokio::test]
async fn retrieval_ranks_the_on_topic_memo_first() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = seeded_store(&temp_dir).await;
    let retriever = Retriever::new(TermEmbedder, store, RetrievalConfig::default());

    let results = retriever
        .retrieve("weak coverage high leverage manufacturing", 3, 0.4)
        .await
        .expect("retrieve should succeed");

    assert!(!results.is_empty());
    assert_eq!(results[0].source_id, "CM-200");
    for pair in results.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test]
async fn keyword_retrieval_honors_risk_filter() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = seeded_store(&temp_dir).await;
    let retriever = Retriever::new(TermEmbedder, store, RetrievalConfig::default());

    let context = retriever
        .retrieve_by_keywords(&["equipment".to_string(), "coverage".to_string()], 3, Some(3))
        .await;

    assert!(context.contains("Memo ID: CM-300"));
    assert!(!context.contains("Memo ID: CM-100"));
    assert!(!context.contains("Memo ID: CM-200"));
}

#[tokio::test]
async fn unreachable_store_degrades_to_sentinel() {
    // A path that cannot be created forces the disconnected state
    let store = LanceVectorStore::connect(
        std::path::Path::new("/proc/no-such-dir/vectors"),
        "memo_chunks",
    )
    .await;
    let retriever = Retriever::new(TermEmbedder, store, RetrievalConfig::default());

    let context = retriever
        .retrieve_similar(&FinancialSignals::default(), 3)
        .await;
    assert_eq!(context, NO_EXAMPLES_SENTINEL);
}

#[tokio::test]
async fn statistics_flow_through_the_retriever() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = seeded_store(&temp_dir).await;
    let retriever = Retriever::new(TermEmbedder, store, RetrievalConfig::default());

    let stats = retriever.statistics().await.expect("statistics should succeed");
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(stats.risk_score_distribution.get(&2), Some(&1));
    assert_eq!(stats.embedding_dimension, Some(DIMENSION));
}
