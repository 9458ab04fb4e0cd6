use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::config::{Config, default_base_dir};
use crate::database::lancedb::LanceVectorStore;
use crate::database::{SearchFilters, VectorStore};
use crate::embeddings::OllamaClient;
use crate::ingest::{Ingestor, load_memos};
use crate::retrieval::{FinancialSignals, Retriever};

fn load_config() -> Result<Config> {
    let base_dir = default_base_dir().context("Failed to resolve base directory")?;
    Config::load(base_dir)
}

async fn open_store(config: &Config) -> Result<LanceVectorStore> {
    let mut store =
        LanceVectorStore::connect(&config.vector_database_path(), &config.store.table_name).await;
    store
        .setup(config.ollama.embedding_dimension as usize)
        .await
        .context("Failed to set up vector store schema")?;
    Ok(store)
}

/// Show the current configuration, or write the defaults to disk
#[inline]
pub fn configure(show: bool) -> Result<()> {
    if show {
        let config = load_config()?;
        let content =
            toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
        println!("Configuration file: {}", config.config_file_path().display());
        println!();
        print!("{}", content);
        return Ok(());
    }

    let config = load_config()?;
    config.save().context("Failed to write configuration")?;
    println!("Wrote configuration to {}", config.config_file_path().display());
    println!("Edit the file and re-run 'memo-kb config --show' to verify.");
    Ok(())
}

/// Ingest a JSON file of credit memos into the knowledge base
#[inline]
pub async fn ingest(file: PathBuf) -> Result<()> {
    let config = load_config()?;
    let memos = load_memos(&file)
        .with_context(|| format!("Failed to load memos from {}", file.display()))?;
    println!("Loaded {} memos from {}", memos.len(), file.display());

    let client = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;
    client
        .health_check()
        .context("Embedding backend is not available")?;

    let mut store = open_store(&config).await?;

    info!("Starting ingestion of {} memos", memos.len());
    let stats = Ingestor::new(&client, &mut store)
        .ingest(&memos, &config.chunking, config.store.insert_batch_size)
        .await
        .context("Ingestion failed")?;
    store.close().await;

    println!("Ingestion complete!");
    println!("  Memos processed: {}", stats.memos_processed);
    println!("  Chunks created: {}", stats.chunks_created);
    println!("  Chunks written: {}", stats.chunks_written);
    if stats.batches_skipped > 0 {
        println!(
            "  ⚠️  Batches skipped (embedding backend unavailable): {}",
            stats.batches_skipped
        );
    }

    Ok(())
}

/// Run a free-text similarity search and print the raw hits
#[inline]
pub async fn search(
    query: String,
    limit: Option<usize>,
    risk_score: Option<i32>,
    category: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    let limit = limit.unwrap_or(config.retrieval.limit);

    let client = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;
    let store = open_store(&config).await?;
    let retriever = Retriever::new(client, store, config.retrieval.clone());

    let filters = SearchFilters {
        risk_score,
        borrower_category: category,
    };
    let results = retriever
        .retrieve_filtered(&query, limit, config.retrieval.similarity_threshold, &filters)
        .await
        .context("Search failed")?;

    if results.is_empty() {
        println!("No chunks matched the query.");
        return Ok(());
    }

    println!("Found {} matching chunks:", results.len());
    println!();
    for result in &results {
        println!(
            "  {} (similarity {:.3})",
            console::style(&result.chunk_id).bold(),
            result.similarity
        );
        if let Some(category) = &result.metadata.borrower_category {
            println!("    Borrower: {}", category);
        }
        if let Some(score) = result.metadata.risk_score {
            println!("    Risk Score: {}/5", score);
        }
        println!("    {}", result.text);
        println!();
    }

    Ok(())
}

/// Build the generation-ready context block for a financial profile
#[inline]
pub async fn context(
    dscr: Option<f64>,
    current_ratio: Option<f64>,
    leverage_ratio: Option<f64>,
    industry: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let config = load_config()?;
    let limit = limit.unwrap_or(config.retrieval.limit);

    let client = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;
    let store = open_store(&config).await?;
    let retriever = Retriever::new(client, store, config.retrieval.clone());

    let signals = FinancialSignals {
        dscr,
        current_ratio,
        leverage_ratio,
        industry,
    };
    let context = retriever.retrieve_similar(&signals, limit).await;
    println!("{}", context);

    Ok(())
}

/// Show aggregate statistics of the knowledge base
#[inline]
pub async fn stats() -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;

    let stats = store.statistics().await.context("Failed to read statistics")?;

    println!("📊 Knowledge Base Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total chunks: {}", stats.total_chunks);
    if let Some(dimension) = stats.embedding_dimension {
        println!("  Embedding dimension: {}", dimension);
    }

    if !stats.risk_score_distribution.is_empty() {
        println!();
        println!("  Risk score distribution:");
        for (score, count) in &stats.risk_score_distribution {
            println!("    {}/5: {} chunks", score, count);
        }
    }

    if !stats.top_borrower_categories.is_empty() {
        println!();
        println!("  Top borrower categories:");
        for (category, count) in &stats.top_borrower_categories {
            println!("    {}: {} chunks", category, count);
        }
    }

    Ok(())
}

/// Delete every chunk from the knowledge base
#[inline]
pub async fn clear(yes: bool) -> Result<()> {
    if !yes {
        println!("This will delete every chunk in the knowledge base.");
        println!("Re-run with --yes to confirm.");
        return Ok(());
    }

    let config = load_config()?;
    let mut store = open_store(&config).await?;
    store.clear().await.context("Failed to clear knowledge base")?;
    store.close().await;

    println!("✓ Knowledge base cleared");
    Ok(())
}
