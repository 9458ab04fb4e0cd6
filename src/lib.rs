use thiserror::Error;

pub type Result<T> = std::result::Result<T, KbError>;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vector store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod chunking;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod ingest;
pub mod retrieval;
