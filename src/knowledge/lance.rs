//! LanceDB Vector Store - 디스크 기반 벡터 검색
//!
//! 필터 페이로드(사용자, 소스, 종류, 시각)를 벡터와 같은 행에 저장하고
//! 검색 시 `only_if` 프리필터로 테넌트/시간/종류를 좁힙니다.
//! 유사도는 코사인 거리에서 `1 - distance`로 환산합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::Table;
use uuid::Uuid;

use super::types::{SearchFilter, SourceKind};
use super::vector::{check_dimension, VectorEntry, VectorHit, VectorIndex, VectorPayload};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunk_vectors";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소
pub struct LanceVectorStore {
    db: Connection,
    path: PathBuf,
    dimension: usize,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// 기존 테이블의 임베딩 차원이 `dimension`과 다르면 에러입니다.
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            anyhow::bail!("Embedding dimension must be positive");
        }

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let store = Self {
            db,
            path: path.to_path_buf(),
            dimension,
        };

        if let Some(table) = store.open_table().await? {
            let schema = table.schema().await.context("Failed to read table schema")?;
            let stored = embedding_dimension(&schema)?;
            if stored != dimension {
                anyhow::bail!(
                    "Vector table at {} has dimension {}, configured {}",
                    store.path.display(),
                    stored,
                    dimension
                );
            }
        }

        tracing::debug!("Opened LanceDB at {:?} (dimension {})", store.path, dimension);
        Ok(store)
    }

    /// 저장소 경로
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("source_id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, false),
            Field::new("source_type", DataType::Utf8, false),
            // 마이크로초 (UTC)
            Field::new("timestamp", DataType::Int64, false),
            Field::new("chunk_text", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
        ]))
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(&self, entries: &[VectorEntry]) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        let chunk_ids: Vec<String> = entries.iter().map(|e| e.chunk_id.to_string()).collect();
        let source_ids: Vec<String> = entries.iter().map(|e| e.payload.source_id.to_string()).collect();
        let user_ids: Vec<String> = entries.iter().map(|e| e.payload.user_id.to_string()).collect();
        let kinds: Vec<&str> = entries.iter().map(|e| e.payload.source_type.as_str()).collect();
        let timestamps: Vec<i64> = entries.iter().map(|e| e.payload.timestamp.timestamp_micros()).collect();
        let texts: Vec<&str> = entries.iter().map(|e| e.payload.chunk_text.as_str()).collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(source_ids)),
                Arc::new(StringArray::from(user_ids)),
                Arc::new(StringArray::from(kinds)),
                Arc::new(Int64Array::from(timestamps)),
                Arc::new(StringArray::from(texts)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    /// 테이블이 있으면 열기
    async fn open_table(&self) -> Result<Option<Table>> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .context("Failed to list LanceDB tables")?;

        if !names.iter().any(|n| n == TABLE_NAME) {
            return Ok(None);
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open vector table")?;
        Ok(Some(table))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorStore {
    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        for entry in &entries {
            check_dimension(&entry.embedding, self.dimension)?;
        }

        let batch = self.entries_to_batch(&entries)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        match self.open_table().await? {
            Some(table) => {
                // 같은 chunk_id는 교체
                let predicate = format!("chunk_id IN ({})", quoted_list(entries.iter().map(|e| e.chunk_id)));
                table
                    .delete(&predicate)
                    .await
                    .context("Failed to remove replaced vectors")?;
                table
                    .add(batches)
                    .execute()
                    .await
                    .context("Failed to add vectors to table")?;
            }
            None => {
                self.db
                    .create_table(TABLE_NAME, batches)
                    .execute()
                    .await
                    .context("Failed to create vector table")?;
            }
        }

        Ok(entries.len())
    }

    async fn search(&self, query: &[f32], filter: &SearchFilter, limit: usize) -> Result<Vec<VectorHit>> {
        check_dimension(query, self.dimension)?;
        if limit == 0 {
            return Ok(vec![]);
        }

        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let stream = table
            .vector_search(query.to_vec())
            .context("Failed to create vector search")?
            .distance_type(lancedb::DistanceType::Cosine)
            .only_if(filter_predicate(filter))
            .limit(limit)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .context("Failed to read vector search results")?;

        let mut hits = Vec::new();
        for batch in batches {
            hits.extend(batch_to_hits(&batch)?);
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        hits.truncate(limit);

        Ok(hits)
    }

    async fn delete_chunks_by_source(&self, source_id: Uuid) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        // Uuid의 문자열 표현은 [0-9a-f-]만 포함
        let predicate = format!("source_id = '{}'", source_id);
        let before = table
            .count_rows(Some(predicate.clone()))
            .await
            .context("Failed to count vectors for source")?;

        if before == 0 {
            return Ok(0);
        }

        table
            .delete(&predicate)
            .await
            .context("Failed to delete vectors")?;

        tracing::debug!("Deleted {} vectors for source {}", before, source_id);
        Ok(before)
    }

    async fn count(&self) -> Result<usize> {
        match self.open_table().await? {
            Some(table) => table.count_rows(None).await.context("Failed to count rows"),
            None => Ok(0),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 검색 필터를 Lance SQL 프리필터로 변환
fn filter_predicate(filter: &SearchFilter) -> String {
    let mut clauses = vec![format!("user_id = '{}'", filter.user_id)];

    if let Some(range) = filter.time_range {
        let (start, end) = range.bounds_micros();
        if let Some(start) = start {
            clauses.push(format!("timestamp >= {}", start));
        }
        if let Some(end) = end {
            clauses.push(format!("timestamp <= {}", end));
        }
    }

    if !filter.source_kinds.is_empty() {
        let kinds = filter
            .source_kinds
            .iter()
            .map(|k| format!("'{}'", k.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("source_type IN ({})", kinds));
    }

    clauses.join(" AND ")
}

fn quoted_list(ids: impl Iterator<Item = Uuid>) -> String {
    ids.map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(", ")
}

fn embedding_dimension(schema: &Schema) -> Result<usize> {
    let field = schema
        .field_with_name("embedding")
        .context("Vector table has no embedding column")?;
    match field.data_type() {
        DataType::FixedSizeList(_, size) => Ok(*size as usize),
        other => anyhow::bail!("Unexpected embedding column type: {:?}", other),
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

fn batch_to_hits(batch: &RecordBatch) -> Result<Vec<VectorHit>> {
    let chunk_ids = string_column(batch, "chunk_id")?;
    let source_ids = string_column(batch, "source_id")?;
    let user_ids = string_column(batch, "user_id")?;
    let kinds = string_column(batch, "source_type")?;
    let texts = string_column(batch, "chunk_text")?;

    let timestamps = batch
        .column_by_name("timestamp")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing timestamp column"))?;

    // _distance 컬럼 (LanceDB가 자동 추가)
    let distances = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

    let mut hits = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let timestamp = DateTime::from_timestamp_micros(timestamps.value(i))
            .ok_or_else(|| anyhow::anyhow!("Invalid timestamp in vector table"))?;

        hits.push(VectorHit {
            chunk_id: Uuid::parse_str(chunk_ids.value(i)).context("Invalid chunk_id in vector table")?,
            score: 1.0 - distances.value(i),
            payload: VectorPayload {
                user_id: Uuid::parse_str(user_ids.value(i)).context("Invalid user_id in vector table")?,
                source_id: Uuid::parse_str(source_ids.value(i)).context("Invalid source_id in vector table")?,
                source_type: kinds.value(i).parse::<SourceKind>()?,
                timestamp,
                chunk_text: texts.value(i).to_string(),
            },
        });
    }

    Ok(hits)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::types::TimeRange;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn entry(user: Uuid, source: Uuid, kind: SourceKind, day: u32, embedding: [f32; DIM]) -> VectorEntry {
        let ts = Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap();
        VectorEntry {
            chunk_id: Uuid::new_v4(),
            embedding: embedding.to_vec(),
            payload: VectorPayload::new(user, source, kind, ts, "chunk text"),
        }
    }

    async fn open_store(dir: &TempDir) -> LanceVectorStore {
        LanceVectorStore::open(&dir.path().join("vectors.lance"), DIM).await.unwrap()
    }

    #[test]
    fn test_filter_predicate() {
        let user = Uuid::new_v4();
        let mut filter = SearchFilter::for_user(user);
        assert_eq!(filter_predicate(&filter), format!("user_id = '{}'", user));

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        filter.time_range = Some(TimeRange::since(start));
        filter.source_kinds = vec![SourceKind::Web, SourceKind::Text];
        let predicate = filter_predicate(&filter);
        assert!(predicate.contains(&format!("timestamp >= {}", start.timestamp_micros())));
        assert!(!predicate.contains("timestamp <="));
        assert!(predicate.ends_with("source_type IN ('web', 'text')"));
    }

    #[tokio::test]
    async fn test_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert_eq!(store.count().await.unwrap(), 0);
        let hits = store
            .search(&[1.0, 0.0, 0.0, 0.0], &SearchFilter::for_user(Uuid::new_v4()), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(store.delete_chunks_by_source(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_orders_by_cosine_and_filters_user() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let (user, other) = (Uuid::new_v4(), Uuid::new_v4());
        let source = Uuid::new_v4();

        let exact = entry(user, source, SourceKind::Text, 10, [1.0, 0.0, 0.0, 0.0]);
        let near = entry(user, source, SourceKind::Text, 10, [0.7, 0.7, 0.0, 0.0]);
        let far = entry(user, source, SourceKind::Text, 10, [0.0, 1.0, 0.0, 0.0]);
        let foreign = entry(other, Uuid::new_v4(), SourceKind::Text, 10, [1.0, 0.0, 0.0, 0.0]);
        let expected = vec![exact.chunk_id, near.chunk_id, far.chunk_id];

        assert_eq!(store.upsert_batch(vec![far, foreign, near, exact]).await.unwrap(), 4);
        assert_eq!(store.count().await.unwrap(), 4);

        let hits = store
            .search(&[1.0, 0.0, 0.0, 0.0], &SearchFilter::for_user(user), 10)
            .await
            .unwrap();

        assert_eq!(hits.iter().map(|h| h.chunk_id).collect::<Vec<_>>(), expected);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert!(hits.iter().all(|h| h.payload.user_id == user));
    }

    #[tokio::test]
    async fn test_search_time_and_kind_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let user = Uuid::new_v4();

        let early_web = entry(user, Uuid::new_v4(), SourceKind::Web, 2, [1.0, 0.0, 0.0, 0.0]);
        let late_doc = entry(user, Uuid::new_v4(), SourceKind::Document, 20, [1.0, 0.1, 0.0, 0.0]);
        let late_web = entry(user, Uuid::new_v4(), SourceKind::Web, 21, [1.0, 0.2, 0.0, 0.0]);
        let late_web_id = late_web.chunk_id;
        store.upsert_batch(vec![early_web, late_doc, late_web]).await.unwrap();

        let since = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let filter = SearchFilter {
            user_id: user,
            time_range: Some(TimeRange::between(since, since + Duration::days(30))),
            source_kinds: vec![SourceKind::Web],
        };

        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], &filter, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, late_web_id);
        assert_eq!(hits[0].payload.source_type, SourceKind::Web);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_by_source() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let user = Uuid::new_v4();
        let (source_a, source_b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = entry(user, source_a, SourceKind::Text, 5, [1.0, 0.0, 0.0, 0.0]);
        let mut replaced = first.clone();
        replaced.embedding = vec![0.0, 1.0, 0.0, 0.0];

        store
            .upsert_batch(vec![
                first,
                entry(user, source_a, SourceKind::Text, 5, [0.0, 0.0, 1.0, 0.0]),
                entry(user, source_b, SourceKind::Text, 5, [0.0, 0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();
        store.upsert(replaced.clone()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        let hits = store
            .search(&[0.0, 1.0, 0.0, 0.0], &SearchFilter::for_user(user), 1)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, replaced.chunk_id);

        assert_eq!(store.delete_chunks_by_source(source_a).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.delete_chunks_by_source(source_a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dimension_checks() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let mut bad = entry(Uuid::new_v4(), Uuid::new_v4(), SourceKind::Text, 1, [1.0, 0.0, 0.0, 0.0]);
        bad.embedding.push(0.5);
        assert!(store.upsert_batch(vec![bad]).await.is_err());

        store
            .upsert(entry(Uuid::new_v4(), Uuid::new_v4(), SourceKind::Text, 1, [1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        drop(store);

        // 다른 차원으로 다시 열기
        assert!(LanceVectorStore::open(&dir.path().join("vectors.lance"), 8).await.is_err());
    }
}
