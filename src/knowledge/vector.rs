//! Vector Index - 벡터 검색 트레이트 및 인메모리 구현
//!
//! 엔트리는 chunk_id로 식별되며, 검색 필터(사용자/시간/종류)에 쓰이는
//! 페이로드를 함께 저장합니다. 소스 단위 삭제는 실제로 동작해야 합니다.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{ScoredHit, SearchFilter, SourceKind};

/// 페이로드에 저장하는 청크 미리보기 최대 길이 (문자)
pub const PREVIEW_CHARS: usize = 500;

// ============================================================================
// Types
// ============================================================================

/// 벡터와 함께 저장되는 필터링용 페이로드
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPayload {
    pub user_id: Uuid,
    pub source_id: Uuid,
    pub source_type: SourceKind,
    /// 소스의 유효 시각 (source_timestamp 또는 ingested_at)
    pub timestamp: DateTime<Utc>,
    /// 청크 텍스트 미리보기 (최대 PREVIEW_CHARS자)
    pub chunk_text: String,
}

impl VectorPayload {
    pub fn new(
        user_id: Uuid,
        source_id: Uuid,
        source_type: SourceKind,
        timestamp: DateTime<Utc>,
        text: &str,
    ) -> Self {
        Self {
            user_id,
            source_id,
            source_type,
            timestamp,
            chunk_text: preview(text),
        }
    }
}

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk_id: Uuid,
    pub embedding: Vec<f32>,
    pub payload: VectorPayload,
}

/// 검색 결과 (유사도 내림차순)
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    /// 코사인 유사도
    pub score: f32,
    pub payload: VectorPayload,
}

impl VectorHit {
    pub fn scored(&self) -> ScoredHit {
        ScoredHit::new(self.chunk_id, self.score)
    }
}

// ============================================================================
// VectorIndex Trait
// ============================================================================

/// 벡터 인덱스 트레이트 (async)
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 단일 엔트리 upsert (같은 chunk_id는 교체)
    async fn upsert(&self, entry: VectorEntry) -> Result<()> {
        self.upsert_batch(vec![entry]).await.map(|_| ())
    }

    /// 배치 upsert
    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<usize>;

    /// 필터를 만족하는 엔트리 중 유사도 상위 `limit`개
    async fn search(&self, query: &[f32], filter: &SearchFilter, limit: usize) -> Result<Vec<VectorHit>>;

    /// 소스에 속한 모든 벡터 삭제, 삭제된 개수 반환
    async fn delete_chunks_by_source(&self, source_id: Uuid) -> Result<usize>;

    /// 저장된 벡터 개수
    async fn count(&self) -> Result<usize>;

    /// 설정된 임베딩 차원
    fn dimension(&self) -> usize;
}

// ============================================================================
// MemoryVectorIndex
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<Uuid, VectorEntry>,
    /// source_id → chunk_id 보조 인덱스
    by_source: HashMap<Uuid, HashSet<Uuid>>,
}

impl MemoryInner {
    fn remove(&mut self, chunk_id: &Uuid) -> Option<VectorEntry> {
        let entry = self.entries.remove(chunk_id)?;
        if let Some(ids) = self.by_source.get_mut(&entry.payload.source_id) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.by_source.remove(&entry.payload.source_id);
            }
        }
        Some(entry)
    }
}

/// 전수 탐색 인메모리 벡터 인덱스
///
/// 프로세스 수명 동안만 유지됩니다. 테스트와 `VECTOR_BACKEND=memory` 설정에 사용합니다.
pub struct MemoryVectorIndex {
    dimension: usize,
    inner: RwLock<MemoryInner>,
}

impl MemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(MemoryInner::default()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<usize> {
        for entry in &entries {
            check_dimension(&entry.embedding, self.dimension)?;
        }

        let mut inner = self.inner.write().await;
        let count = entries.len();

        for entry in entries {
            inner.remove(&entry.chunk_id);
            inner
                .by_source
                .entry(entry.payload.source_id)
                .or_default()
                .insert(entry.chunk_id);
            inner.entries.insert(entry.chunk_id, entry);
        }

        Ok(count)
    }

    async fn search(&self, query: &[f32], filter: &SearchFilter, limit: usize) -> Result<Vec<VectorHit>> {
        check_dimension(query, self.dimension)?;
        if limit == 0 {
            return Ok(vec![]);
        }

        let inner = self.inner.read().await;
        let mut hits: Vec<VectorHit> = inner
            .entries
            .values()
            .filter(|e| filter.accepts(e.payload.user_id, e.payload.source_type, e.payload.timestamp))
            .map(|e| VectorHit {
                chunk_id: e.chunk_id,
                score: cosine_similarity(query, &e.embedding),
                payload: e.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        hits.truncate(limit);

        Ok(hits)
    }

    async fn delete_chunks_by_source(&self, source_id: Uuid) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let ids = inner.by_source.remove(&source_id).unwrap_or_default();

        let mut deleted = 0;
        for id in &ids {
            if inner.entries.remove(id).is_some() {
                deleted += 1;
            }
        }

        tracing::debug!("Deleted {} vectors for source {}", deleted, source_id);
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().await.entries.len())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// 임베딩 차원 검증
pub fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        anyhow::bail!(
            "Embedding dimension mismatch: expected {}, got {}",
            expected,
            vector.len()
        );
    }
    Ok(())
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::types::TimeRange;
    use chrono::{Duration, TimeZone};

    fn entry(user: Uuid, source: Uuid, kind: SourceKind, ts: DateTime<Utc>, embedding: Vec<f32>) -> VectorEntry {
        VectorEntry {
            chunk_id: Uuid::new_v4(),
            embedding,
            payload: VectorPayload::new(user, source, kind, ts, "chunk"),
        }
    }

    #[test]
    fn test_cosine_similarity_same() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - -1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_empty() {
        let a: Vec<f32> = vec![];
        let b: Vec<f32> = vec![];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_preview_truncates_by_chars() {
        let long = "가".repeat(PREVIEW_CHARS + 20);
        let payload = VectorPayload::new(Uuid::nil(), Uuid::nil(), SourceKind::Text, Utc::now(), &long);
        assert_eq!(payload.chunk_text.chars().count(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn test_memory_search_orders_and_filters_by_user() {
        let index = MemoryVectorIndex::new(3);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let source = Uuid::new_v4();
        let now = Utc::now();

        let near = entry(alice, source, SourceKind::Text, now, vec![1.0, 0.0, 0.0]);
        let far = entry(alice, source, SourceKind::Text, now, vec![0.5, 0.5, 0.0]);
        let other = entry(bob, Uuid::new_v4(), SourceKind::Text, now, vec![1.0, 0.0, 0.0]);
        let (near_id, far_id) = (near.chunk_id, far.chunk_id);

        index.upsert_batch(vec![far, near, other]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let hits = index
            .search(&[1.0, 0.0, 0.0], &SearchFilter::for_user(alice), 10)
            .await
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.chunk_id).collect::<Vec<_>>(), vec![near_id, far_id]);
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| h.payload.user_id == alice));
    }

    #[tokio::test]
    async fn test_memory_search_time_and_kind_filters() {
        let index = MemoryVectorIndex::new(2);
        let user = Uuid::new_v4();
        let old = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let a = entry(user, Uuid::new_v4(), SourceKind::Web, old, vec![1.0, 0.0]);
        let b = entry(user, Uuid::new_v4(), SourceKind::Text, recent, vec![1.0, 0.0]);
        let b_id = b.chunk_id;
        index.upsert_batch(vec![a, b]).await.unwrap();

        let mut filter = SearchFilter::for_user(user);
        filter.time_range = Some(TimeRange::since(recent - Duration::days(1)));
        let hits = index.search(&[1.0, 0.0], &filter, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, b_id);

        let mut filter = SearchFilter::for_user(user);
        filter.source_kinds = vec![SourceKind::Web];
        let hits = index.search(&[1.0, 0.0], &filter, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.source_type, SourceKind::Web);
    }

    #[tokio::test]
    async fn test_memory_delete_by_source() {
        let index = MemoryVectorIndex::new(2);
        let user = Uuid::new_v4();
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();

        index
            .upsert_batch(vec![
                entry(user, s1, SourceKind::Text, now, vec![1.0, 0.0]),
                entry(user, s1, SourceKind::Text, now, vec![0.0, 1.0]),
                entry(user, s2, SourceKind::Text, now, vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete_chunks_by_source(s1).await.unwrap(), 2);
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.delete_chunks_by_source(s1).await.unwrap(), 0);

        let hits = index.search(&[1.0, 0.0], &SearchFilter::for_user(user), 10).await.unwrap();
        assert!(hits.iter().all(|h| h.payload.source_id == s2));
    }

    #[tokio::test]
    async fn test_memory_upsert_replaces_and_checks_dimension() {
        let index = MemoryVectorIndex::new(2);
        let user = Uuid::new_v4();
        let mut e = entry(user, Uuid::new_v4(), SourceKind::Text, Utc::now(), vec![1.0, 0.0]);

        index.upsert(e.clone()).await.unwrap();
        e.embedding = vec![0.0, 1.0];
        index.upsert(e.clone()).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        let hits = index.search(&[0.0, 1.0], &SearchFilter::for_user(user), 1).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-4);

        e.embedding = vec![1.0, 0.0, 0.0];
        assert!(index.upsert(e).await.is_err());
        assert!(index.search(&[1.0], &SearchFilter::for_user(user), 1).await.is_err());
    }
}
