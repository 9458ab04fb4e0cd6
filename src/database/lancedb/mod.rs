
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::{
    Connection, DistanceType, Table,
    index::{Index, vector::IvfPqIndexBuilder},
    query::{ExecutableQuery, QueryBase},
};
use tracing::{debug, error, info, warn};

use super::{
    ChunkMetadata, ChunkRecord, ConnectionState, KbStatistics, SearchFilters, SearchResult,
    VectorStore,
};
use crate::{KbError, Result};

/// Vector store backed by LanceDB.
///
/// Holds a single persistent connection; concurrent use of one instance
/// from multiple threads is out of contract. A failed connection leaves the
/// client in `Disconnected`, where every operation degrades to an empty
/// result instead of an error.
pub struct LanceVectorStore {
    connection: Option<Connection>,
    db_path: PathBuf,
    table_name: String,
    dimension: Option<usize>,
    state: ConnectionState,
}

/// Persisted fields of an existing row that survive a re-upsert unchanged
struct StoredRow {
    source_id: String,
    sequence_index: u32,
    metadata: ChunkMetadata,
    created_at: String,
}

/// Fully resolved row about to be written
struct PersistRow {
    chunk_id: String,
    source_id: String,
    sequence_index: u32,
    text: String,
    length: u32,
    metadata: ChunkMetadata,
    embedding: Vec<f32>,
    created_at: String,
}

impl LanceVectorStore {
    /// Open a connection to the LanceDB directory at `db_path`.
    ///
    /// Connection failure does not error: the store comes back
    /// `Disconnected` and degrades, because retrieval is a best-effort
    /// enhancement for its callers.
    #[inline]
    pub async fn connect(db_path: &Path, table_name: &str) -> Self {
        debug!("Initializing LanceDB at path: {:?}", db_path);

        let mut store = Self {
            connection: None,
            db_path: db_path.to_path_buf(),
            table_name: table_name.to_string(),
            dimension: None,
            state: ConnectionState::Connecting,
        };

        if let Some(parent) = db_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("Failed to create vector database directory: {}", e);
                store.state = ConnectionState::Disconnected;
                return store;
            }
        }

        let uri = format!("file://{}", db_path.display());
        match lancedb::connect(&uri).execute().await {
            Ok(connection) => {
                store.connection = Some(connection);
                store.state = ConnectionState::Connected;
                info!("Connected to LanceDB at {:?}", db_path);
            }
            Err(e) => {
                error!("Failed to connect to LanceDB: {}", e);
                store.state = ConnectionState::Disconnected;
            }
        }

        store
    }

    fn require_connection(&self) -> Result<&Connection> {
        self.connection.as_ref().ok_or_else(|| {
            KbError::StoreUnreachable(format!("Not connected to {:?}", self.db_path))
        })
    }

    fn require_dimension(&self) -> Result<usize> {
        self.dimension
            .ok_or_else(|| KbError::SchemaSetup("setup() has not been called".to_string()))
    }

    async fn open_table(&self) -> Result<Table> {
        self.require_connection()?
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| KbError::Store(format!("Failed to open table: {}", e)))
    }

    /// Schema of the chunk table for a given embedding dimension
    fn create_schema(&self, dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("source_id", DataType::Utf8, false),
            Field::new("sequence_index", DataType::UInt32, false),
            Field::new("title", DataType::Utf8, true),
            Field::new("borrower_category", DataType::Utf8, true),
            Field::new("loan_type", DataType::Utf8, true),
            Field::new("text", DataType::Utf8, false),
            Field::new("length", DataType::UInt32, false),
            Field::new("risk_score", DataType::Int32, true),
            Field::new("recommendation", DataType::Utf8, true),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    dimension as i32,
                ),
                false,
            ),
            Field::new("created_at", DataType::Utf8, false),
        ]))
    }

    /// Read the embedding dimension off an existing table's schema
    async fn detect_existing_dimension(&self) -> Result<usize> {
        let table = self.open_table().await?;
        let schema = table
            .schema()
            .await
            .map_err(|e| KbError::Store(format!("Failed to get table schema: {}", e)))?;

        for field in schema.fields() {
            if field.name() == "embedding" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(KbError::SchemaSetup(
            "Could not find embedding column or determine dimension".to_string(),
        ))
    }

    /// Best-effort index maintenance after inserts. LanceDB refuses to
    /// build an ANN index on a near-empty table, so failures here are
    /// logged and searches fall back to exact scan.
    async fn ensure_indexes(&self, table: &Table) {
        let ann = Index::IvfPq(IvfPqIndexBuilder::default().distance_type(DistanceType::Cosine));
        if let Err(e) = table.create_index(&["embedding"], ann).execute().await {
            debug!("ANN index creation skipped: {}", e);
        }

        for columns in [["risk_score"], ["source_id"]] {
            if let Err(e) = table.create_index(&columns, Index::Auto).execute().await {
                debug!("Index creation on {:?} skipped: {}", columns, e);
            }
        }
    }

    /// Fetch rows matching the given chunk ids, keyed by chunk id
    async fn fetch_existing(
        &self,
        table: &Table,
        chunk_ids: &[&str],
    ) -> Result<HashMap<String, StoredRow>> {
        let predicate = chunk_id_predicate(chunk_ids);
        let mut stream = table
            .query()
            .only_if(predicate)
            .execute()
            .await
            .map_err(|e| KbError::Store(format!("Failed to query existing chunks: {}", e)))?;

        let mut existing = HashMap::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| KbError::Store(format!("Failed to read result stream: {}", e)))?
        {
            let chunk_ids = string_column(&batch, "chunk_id")?;
            let source_ids = string_column(&batch, "source_id")?;
            let sequence_indices = uint32_column(&batch, "sequence_index")?;
            let titles = string_column(&batch, "title")?;
            let borrower_categories = string_column(&batch, "borrower_category")?;
            let loan_types = string_column(&batch, "loan_type")?;
            let risk_scores = int32_column(&batch, "risk_score")?;
            let recommendations = string_column(&batch, "recommendation")?;
            let created_ats = string_column(&batch, "created_at")?;

            for row in 0..batch.num_rows() {
                existing.insert(
                    chunk_ids.value(row).to_string(),
                    StoredRow {
                        source_id: source_ids.value(row).to_string(),
                        sequence_index: sequence_indices.value(row),
                        metadata: ChunkMetadata {
                            title: opt_string(titles, row),
                            borrower_category: opt_string(borrower_categories, row),
                            loan_type: opt_string(loan_types, row),
                            risk_score: opt_int(risk_scores, row),
                            recommendation: opt_string(recommendations, row),
                        },
                        created_at: created_ats.value(row).to_string(),
                    },
                );
            }
        }

        Ok(existing)
    }

    /// Write one batch: matched rows keep their stored metadata and
    /// `created_at`, taking only the new text, length, and embedding.
    ///
    /// The replacement batch is fully built before any matched row is
    /// deleted, so a conversion failure leaves the stored rows untouched.
    async fn upsert_batch(&self, table: &Table, batch: &[ChunkRecord]) -> Result<u64> {
        let ids: Vec<&str> = batch.iter().map(|c| c.chunk_id.as_str()).collect();
        let mut existing = self.fetch_existing(table, &ids).await?;
        let matched_any = !existing.is_empty();

        let now = Utc::now().to_rfc3339();
        let rows: Vec<PersistRow> = batch
            .iter()
            .map(|chunk| match existing.remove(&chunk.chunk_id) {
                Some(stored) => PersistRow {
                    chunk_id: chunk.chunk_id.clone(),
                    source_id: stored.source_id,
                    sequence_index: stored.sequence_index,
                    text: chunk.text.clone(),
                    length: chunk.length,
                    metadata: stored.metadata,
                    embedding: chunk.embedding.clone(),
                    created_at: stored.created_at,
                },
                None => PersistRow {
                    chunk_id: chunk.chunk_id.clone(),
                    source_id: chunk.source_id.clone(),
                    sequence_index: chunk.sequence_index,
                    text: chunk.text.clone(),
                    length: chunk.length,
                    metadata: chunk.metadata.clone(),
                    embedding: chunk.embedding.clone(),
                    created_at: now.clone(),
                },
            })
            .collect();

        let record_batch = self.create_record_batch(&rows)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        if matched_any {
            table
                .delete(&chunk_id_predicate(&ids))
                .await
                .map_err(|e| KbError::Store(format!("Failed to replace existing chunks: {}", e)))?;
        }

        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| KbError::Store(format!("Failed to insert chunks: {}", e)))?;

        Ok(rows.len() as u64)
    }

    fn create_record_batch(&self, rows: &[PersistRow]) -> Result<RecordBatch> {
        let len = rows.len();
        let dimension = self.require_dimension()?;

        let mut chunk_ids = Vec::with_capacity(len);
        let mut source_ids = Vec::with_capacity(len);
        let mut sequence_indices = Vec::with_capacity(len);
        let mut titles = Vec::with_capacity(len);
        let mut borrower_categories = Vec::with_capacity(len);
        let mut loan_types = Vec::with_capacity(len);
        let mut texts = Vec::with_capacity(len);
        let mut lengths = Vec::with_capacity(len);
        let mut risk_scores = Vec::with_capacity(len);
        let mut recommendations = Vec::with_capacity(len);
        let mut created_ats = Vec::with_capacity(len);

        for row in rows {
            chunk_ids.push(row.chunk_id.as_str());
            source_ids.push(row.source_id.as_str());
            sequence_indices.push(row.sequence_index);
            titles.push(row.metadata.title.as_deref());
            borrower_categories.push(row.metadata.borrower_category.as_deref());
            loan_types.push(row.metadata.loan_type.as_deref());
            texts.push(row.text.as_str());
            lengths.push(row.length);
            risk_scores.push(row.metadata.risk_score);
            recommendations.push(row.metadata.recommendation.as_deref());
            created_ats.push(row.created_at.as_str());
        }

        let mut flat_values = Vec::with_capacity(len * dimension);
        for row in rows {
            flat_values.extend_from_slice(&row.embedding);
        }
        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let embedding_array =
            FixedSizeListArray::try_new(field, dimension as i32, Arc::new(values_array), None)
                .map_err(|e| KbError::Store(format!("Failed to create embedding array: {}", e)))?;

        let schema = self.create_schema(dimension);
        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(chunk_ids)),
            Arc::new(StringArray::from(source_ids)),
            Arc::new(UInt32Array::from(sequence_indices)),
            Arc::new(StringArray::from(titles)),
            Arc::new(StringArray::from(borrower_categories)),
            Arc::new(StringArray::from(loan_types)),
            Arc::new(StringArray::from(texts)),
            Arc::new(UInt32Array::from(lengths)),
            Arc::new(Int32Array::from(risk_scores)),
            Arc::new(StringArray::from(recommendations)),
            Arc::new(embedding_array),
            Arc::new(StringArray::from(created_ats)),
        ];

        RecordBatch::try_new(schema, arrays)
            .map_err(|e| KbError::Store(format!("Failed to create record batch: {}", e)))
    }

    fn parse_search_batch(&self, batch: &RecordBatch) -> Result<Vec<SearchResult>> {
        let chunk_ids = string_column(batch, "chunk_id")?;
        let source_ids = string_column(batch, "source_id")?;
        let titles = string_column(batch, "title")?;
        let borrower_categories = string_column(batch, "borrower_category")?;
        let loan_types = string_column(batch, "loan_type")?;
        let texts = string_column(batch, "text")?;
        let risk_scores = int32_column(batch, "risk_score")?;
        let recommendations = string_column(batch, "recommendation")?;

        let distances = batch
            .column_by_name("_distance")
            .map(|col| col.as_any().downcast_ref::<Float32Array>());

        let mut results = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let distance = distances
                .flatten()
                .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

            results.push(SearchResult {
                chunk_id: chunk_ids.value(row).to_string(),
                source_id: source_ids.value(row).to_string(),
                text: texts.value(row).to_string(),
                metadata: ChunkMetadata {
                    title: opt_string(titles, row),
                    borrower_category: opt_string(borrower_categories, row),
                    loan_type: opt_string(loan_types, row),
                    risk_score: opt_int(risk_scores, row),
                    recommendation: opt_string(recommendations, row),
                },
                similarity: 1.0 - distance,
                distance,
            });
        }

        Ok(results)
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    #[inline]
    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    async fn setup(&mut self, dimension: usize) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(KbError::StoreUnreachable(
                "Cannot set up schema while disconnected".to_string(),
            ));
        }

        let table_names = self
            .require_connection()?
            .table_names()
            .execute()
            .await
            .map_err(|e| KbError::SchemaSetup(format!("Failed to list tables: {}", e)))?;

        if table_names.contains(&self.table_name) {
            let existing = self.detect_existing_dimension().await?;
            if existing != dimension {
                return Err(KbError::DimensionMismatch {
                    expected: dimension,
                    actual: existing,
                });
            }
            debug!(
                "Chunk table already exists with dimension {}, setup is a no-op",
                existing
            );
            self.dimension = Some(existing);
            return Ok(());
        }

        let schema = self.create_schema(dimension);
        self.require_connection()?
            .create_empty_table(&self.table_name, schema)
            .execute()
            .await
            .map_err(|e| KbError::SchemaSetup(format!("Failed to create table: {}", e)))?;

        self.dimension = Some(dimension);
        info!(
            "Chunk table '{}' created with dimension {}",
            self.table_name, dimension
        );
        Ok(())
    }

    #[inline]
    async fn upsert(&mut self, chunks: &[ChunkRecord], batch_size: usize) -> Result<u64> {
        if self.state != ConnectionState::Connected {
            warn!("Not connected, skipping upsert of {} chunks", chunks.len());
            return Ok(0);
        }
        if chunks.is_empty() {
            debug!("No chunks to upsert");
            return Ok(0);
        }

        let dimension = self.require_dimension()?;
        for chunk in chunks {
            if chunk.embedding.len() != dimension {
                return Err(KbError::DimensionMismatch {
                    expected: dimension,
                    actual: chunk.embedding.len(),
                });
            }
        }

        let table = self.open_table().await?;
        let batch_size = batch_size.max(1);
        let mut written = 0;

        for batch in chunks.chunks(batch_size) {
            match self.upsert_batch(&table, batch).await {
                Ok(count) => written += count,
                Err(e) => {
                    warn!(
                        "Batch upsert failed, skipping {} chunks and continuing: {}",
                        batch.len(),
                        e
                    );
                }
            }
        }

        self.ensure_indexes(&table).await;

        info!("Upserted {}/{} chunks", written, chunks.len());
        Ok(written)
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        if self.state != ConnectionState::Connected {
            warn!("Not connected, returning empty search result");
            return Ok(Vec::new());
        }

        let dimension = self.require_dimension()?;
        if query.len() != dimension {
            return Err(KbError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        debug!("Searching for similar chunks with limit: {}", limit);

        let table = self.open_table().await?;
        let mut vector_query = table
            .vector_search(query)
            .map_err(|e| KbError::Store(format!("Failed to create vector search: {}", e)))?
            .column("embedding")
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        let mut predicates = Vec::new();
        if let Some(score) = filters.risk_score {
            predicates.push(format!("risk_score = {}", score));
        }
        if let Some(category) = &filters.borrower_category {
            // Only quotes are escaped; `%` and `_` in the filter keep their
            // LIKE wildcard meaning, as documented on `SearchFilters`.
            predicates.push(format!(
                "lower(borrower_category) LIKE '%{}%'",
                escape_literal(&category.to_lowercase())
            ));
        }
        if !predicates.is_empty() {
            vector_query = vector_query.only_if(predicates.join(" AND "));
        }

        let mut stream = vector_query
            .execute()
            .await
            .map_err(|e| KbError::Store(format!("Failed to execute search: {}", e)))?;

        let mut results = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| KbError::Store(format!("Failed to read result stream: {}", e)))?
        {
            results.extend(self.parse_search_batch(&batch)?);
        }

        // Deterministic ranking: similarity descending, chunk id breaking ties
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(limit);

        debug!("Search returned {} results", results.len());
        Ok(results)
    }

    #[inline]
    async fn statistics(&self) -> Result<KbStatistics> {
        if self.state != ConnectionState::Connected {
            warn!("Not connected, returning empty statistics");
            return Ok(KbStatistics::default());
        }

        let table = self.open_table().await?;
        let total_chunks = table
            .count_rows(None)
            .await
            .map_err(|e| KbError::Store(format!("Failed to count rows: {}", e)))?
            as u64;

        let mut risk_counts: BTreeMap<i32, u64> = BTreeMap::new();
        let mut category_counts: HashMap<String, u64> = HashMap::new();

        let mut stream = table
            .query()
            .execute()
            .await
            .map_err(|e| KbError::Store(format!("Failed to scan chunks: {}", e)))?;

        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| KbError::Store(format!("Failed to read result stream: {}", e)))?
        {
            let risk_scores = int32_column(&batch, "risk_score")?;
            let borrower_categories = string_column(&batch, "borrower_category")?;

            for row in 0..batch.num_rows() {
                if let Some(score) = opt_int(risk_scores, row) {
                    *risk_counts.entry(score).or_default() += 1;
                }
                if let Some(category) = opt_string(borrower_categories, row) {
                    *category_counts.entry(category).or_default() += 1;
                }
            }
        }

        let top_borrower_categories = category_counts
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .take(10)
            .collect();

        Ok(KbStatistics {
            total_chunks,
            risk_score_distribution: risk_counts,
            top_borrower_categories,
            embedding_dimension: self.dimension,
        })
    }

    #[inline]
    async fn clear(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            warn!("Not connected, nothing to clear");
            return Ok(());
        }

        let table = self.open_table().await?;
        table
            .delete("chunk_id IS NOT NULL")
            .await
            .map_err(|e| KbError::Store(format!("Failed to clear chunks: {}", e)))?;

        info!("Cleared all chunks from '{}'", self.table_name);
        Ok(())
    }

    #[inline]
    async fn close(&mut self) {
        self.connection = None;
        self.state = ConnectionState::Disconnected;
        info!("Disconnected from LanceDB at {:?}", self.db_path);
    }
}

/// SQL-ish `IN` predicate over chunk ids, with quotes escaped
fn chunk_id_predicate(chunk_ids: &[&str]) -> String {
    let quoted = chunk_ids
        .iter()
        .map(|id| format!("'{}'", escape_literal(id)))
        .join(", ");
    format!("chunk_id IN ({})", quoted)
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| KbError::Store(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| KbError::Store(format!("Invalid {} column type", name)))
}

fn uint32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| KbError::Store(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| KbError::Store(format!("Invalid {} column type", name)))
}

fn int32_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int32Array> {
    batch
        .column_by_name(name)
        .ok_or_else(|| KbError::Store(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| KbError::Store(format!("Invalid {} column type", name)))
}

fn opt_string(array: &StringArray, row: usize) -> Option<String> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row).to_string())
    }
}

fn opt_int(array: &Int32Array, row: usize) -> Option<i32> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}
