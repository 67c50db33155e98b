//! 수집 파이프라인 - 소스 → 청크 → 임베딩 → 인덱스
//!
//! 모든 수집은 작업(job) 레코드를 남깁니다.
//! `queued → processing → completed | failed(error)` 순서로 전이하며,
//! 실패 원인은 로그와 함께 작업 레코드에 기록됩니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::chunker::{ChunkStrategy, Chunker};
use super::store::KnowledgeStore;
use super::types::{Chunk, IngestJob, JobStatus, Metadata, NewSource, Source, SourceKind, TextChunk};
use super::vector::{VectorEntry, VectorIndex, VectorPayload};
use crate::embedding::EmbeddingProvider;

// ============================================================================
// Request Types
// ============================================================================

/// 수집할 본문
#[derive(Debug, Clone)]
pub enum IngestContent {
    /// 단일 텍스트
    Text(String),
    /// 페이지 번호가 붙은 텍스트 (PDF)
    Pages(Vec<(usize, String)>),
}

impl IngestContent {
    fn is_blank(&self) -> bool {
        match self {
            IngestContent::Text(text) => text.trim().is_empty(),
            IngestContent::Pages(pages) => pages.iter().all(|(_, text)| text.trim().is_empty()),
        }
    }
}

/// 수집 요청
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user_id: Uuid,
    pub kind: SourceKind,
    pub name: String,
    pub url: Option<String>,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub content: IngestContent,
    /// 지정하지 않으면 paragraph
    pub strategy: Option<ChunkStrategy>,
}

impl IngestRequest {
    pub fn new(user_id: Uuid, kind: SourceKind, name: impl Into<String>, content: IngestContent) -> Self {
        Self {
            user_id,
            kind,
            name: name.into(),
            url: None,
            source_timestamp: None,
            metadata: Metadata::new(),
            content,
            strategy: None,
        }
    }

    /// 텍스트 노트 요청
    pub fn text(user_id: Uuid, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(user_id, SourceKind::Text, name, IngestContent::Text(text.into()))
    }

    pub fn with_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }
}

/// 백그라운드로 제출된 수집 작업
pub struct SubmittedJob {
    pub source: Source,
    /// 제출 시점 상태 (queued)
    pub job: IngestJob,
    handle: JoinHandle<Result<IngestJob>>,
}

impl SubmittedJob {
    /// 처리 완료까지 대기 후 최종 작업 레코드 반환
    pub async fn wait(self) -> Result<IngestJob> {
        self.handle.await.context("Ingest task panicked")?
    }
}

// ============================================================================
// Ingestor
// ============================================================================

/// 수집기
///
/// clone은 같은 저장소와 인덱스를 공유합니다.
#[derive(Clone)]
pub struct Ingestor {
    store: KnowledgeStore,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Arc<Chunker>,
}

impl Ingestor {
    /// 임베딩 차원과 벡터 인덱스 차원이 다르면 에러
    pub fn new(
        store: KnowledgeStore,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Arc<Chunker>,
    ) -> Result<Self> {
        if embedder.dimension() != vectors.dimension() {
            anyhow::bail!(
                "Embedding dimension ({}, {}) does not match vector index dimension ({})",
                embedder.dimension(),
                embedder.name(),
                vectors.dimension()
            );
        }

        Ok(Self {
            store,
            vectors,
            embedder,
            chunker,
        })
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    /// 수집을 끝까지 실행
    ///
    /// 처리 중 실패는 `Err`가 아니라 `Failed` 상태의 작업으로 반환됩니다.
    /// `Err`는 소스/작업 레코드 자체를 만들지 못한 경우입니다.
    pub async fn ingest(&self, request: IngestRequest) -> Result<(Source, IngestJob)> {
        let (source, job, content, strategy) = self.prepare(request)?;
        let job = self.process(&source, job.id, content, strategy).await?;
        Ok((source, job))
    }

    /// 소스/작업을 만들고 처리는 백그라운드 태스크로 넘김
    pub fn submit(&self, request: IngestRequest) -> Result<SubmittedJob> {
        let (source, job, content, strategy) = self.prepare(request)?;

        let ingestor = self.clone();
        let task_source = source.clone();
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            ingestor.process(&task_source, job_id, content, strategy).await
        });

        tracing::info!("Queued ingest job {} for source {}", job.id, source.id);
        Ok(SubmittedJob { source, job, handle })
    }

    /// 소스 삭제 (벡터 → 청크/작업 cascade)
    ///
    /// 사용자 소유 소스가 없으면 `false`.
    pub async fn delete_source(&self, source_id: Uuid, user_id: Uuid) -> Result<bool> {
        remove_source(&self.store, self.vectors.as_ref(), source_id, user_id).await
    }

    fn prepare(&self, request: IngestRequest) -> Result<(Source, IngestJob, IngestContent, ChunkStrategy)> {
        if request.content.is_blank() {
            anyhow::bail!("Nothing to ingest: content is empty");
        }

        let strategy = request.strategy.unwrap_or(ChunkStrategy::Paragraph);
        let source = self.store.create_source(NewSource {
            user_id: request.user_id,
            kind: request.kind,
            name: request.name,
            url: request.url,
            source_timestamp: request.source_timestamp,
            metadata: request.metadata,
        })?;
        let job = self.store.create_job(source.id, source.user_id)?;

        Ok((source, job, request.content, strategy))
    }

    /// 작업을 끝 상태(completed | failed)까지 진행
    ///
    /// 상태 기록 자체가 실패해도 failed 기록을 시도하고,
    /// 그것마저 실패할 때만 `Err`를 반환합니다.
    async fn process(
        &self,
        source: &Source,
        job_id: Uuid,
        content: IngestContent,
        strategy: ChunkStrategy,
    ) -> Result<IngestJob> {
        if let Err(e) = self.store.update_job(job_id, JobStatus::Processing, 0) {
            return self.fail_job(job_id, e.context("Failed to start ingest job"));
        }

        match self.index(source, content, strategy).await {
            Ok(count) => match self.store.update_job(job_id, JobStatus::Completed, count) {
                Ok(job) => {
                    tracing::info!("Ingested source {} ({} chunks)", source.id, count);
                    Ok(job)
                }
                Err(e) => self.fail_job(job_id, e.context("Failed to mark ingest job completed")),
            },
            Err(e) => {
                if let Err(cleanup) = self.vectors.delete_chunks_by_source(source.id).await {
                    tracing::warn!("Failed to clean up vectors for {}: {:#}", source.id, cleanup);
                }
                self.fail_job(job_id, e)
            }
        }
    }

    /// 실패를 로그와 작업 레코드에 남김
    fn fail_job(&self, job_id: Uuid, cause: anyhow::Error) -> Result<IngestJob> {
        let error = format!("{:#}", cause);
        tracing::error!("Ingest job {} failed: {}", job_id, error);

        self.store
            .update_job(job_id, JobStatus::Failed { error }, 0)
            .map_err(|e| {
                tracing::error!("Could not record failure on ingest job {}: {:#}", job_id, e);
                e.context(format!("Ingest job {} failed and its status could not be recorded", job_id))
            })
    }

    /// 청킹 → 임베딩 → 벡터 upsert → 청크 저장
    async fn index(&self, source: &Source, content: IngestContent, strategy: ChunkStrategy) -> Result<usize> {
        let chunker = Arc::clone(&self.chunker);
        let text_chunks = tokio::task::spawn_blocking(move || match content {
            IngestContent::Text(text) => chunker.chunk(&text, strategy),
            IngestContent::Pages(pages) => chunker.chunk_pages(&pages, strategy),
        })
        .await
        .context("Chunking task failed")?
        .context("Failed to chunk content")?;

        let chunks: Vec<Chunk> = text_chunks
            .into_iter()
            .map(|chunk| annotate(chunk, source).into_chunk(source.id))
            .collect();

        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&texts)
            .await
            .context("Failed to embed chunks")?;

        if embeddings.len() != chunks.len() {
            anyhow::bail!(
                "Embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            );
        }

        let timestamp = source.effective_timestamp();
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorEntry {
                chunk_id: chunk.id,
                embedding,
                payload: VectorPayload::new(source.user_id, source.id, source.kind, timestamp, &chunk.text),
            })
            .collect();

        self.vectors
            .upsert_batch(entries)
            .await
            .context("Failed to index vectors")?;

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.insert_chunks(&chunks))
            .await
            .context("Chunk insert task failed")?
    }
}

/// SQLite 행(소스 → 청크/작업 cascade)을 먼저 지우고 벡터를 지웁니다.
///
/// 벡터 삭제가 실패해도 소스는 이미 사라진 상태입니다. 남은 벡터는
/// 하이드레이션에서 걸러지므로 검색 결과에 나오지 않고, 에러로 보고됩니다.
pub(crate) async fn remove_source(
    store: &KnowledgeStore,
    vectors: &dyn VectorIndex,
    source_id: Uuid,
    user_id: Uuid,
) -> Result<bool> {
    if !store.delete_source(source_id, user_id)? {
        return Ok(false);
    }

    let removed = vectors.delete_chunks_by_source(source_id).await.map_err(|e| {
        tracing::error!(
            "Source {} deleted but its vectors were not: {:#}. Orphaned vectors remain until the next delete.",
            source_id,
            e
        );
        e.context("Failed to delete source vectors")
    })?;

    tracing::info!("Deleted source {} ({} vectors)", source_id, removed);
    Ok(true)
}

/// 소스 종류별 청크 메타데이터
fn annotate(mut chunk: TextChunk, source: &Source) -> TextChunk {
    let chunk_type = match source.kind {
        SourceKind::Text => "text",
        SourceKind::Document => "document",
        SourceKind::Web => "web_content",
    };

    chunk.metadata.insert("chunk_type".to_string(), chunk_type.into());
    chunk.metadata.insert("source_type".to_string(), source.kind.as_str().into());
    if let (SourceKind::Web, Some(url)) = (source.kind, &source.url) {
        chunk.metadata.insert("url".to_string(), url.clone().into());
    }

    chunk
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::chunker::ChunkConfig;
    use crate::knowledge::tokenizer::TokenCounter;
    use crate::knowledge::types::SearchFilter;
    use crate::knowledge::vector::{MemoryVectorIndex, VectorHit};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const DIM: usize = 8;

    /// 텍스트 길이 기반 결정적 임베더
    struct LengthEmbedder {
        fail: AtomicBool,
    }

    impl LengthEmbedder {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("embedding service unavailable");
            }
            let mut v = vec![0.1; DIM];
            v[text.len() % DIM] = 1.0;
            Ok(v)
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn name(&self) -> &str {
            "length"
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: KnowledgeStore,
        vectors: Arc<MemoryVectorIndex>,
        embedder: Arc<LengthEmbedder>,
        ingestor: Ingestor,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("knowledge.db")).unwrap();
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let embedder = Arc::new(LengthEmbedder::new());
        let chunker = Chunker::new(ChunkConfig::new(20, 5).unwrap(), TokenCounter::CharEstimate).unwrap();
        let ingestor = Ingestor::new(
            store.clone(),
            vectors.clone(),
            embedder.clone(),
            Arc::new(chunker),
        )
        .unwrap();

        Fixture {
            _dir: dir,
            store,
            vectors,
            embedder,
            ingestor,
        }
    }

    fn paragraphs(n: usize) -> String {
        (0..n)
            .map(|i| format!("Paragraph number {} talks about the quarterly roadmap in detail.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn test_ingest_completes_and_indexes() {
        let f = fixture();
        let user = Uuid::new_v4();

        let (source, job) = f
            .ingestor
            .ingest(IngestRequest::text(user, "Roadmap notes", paragraphs(3)))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.chunk_count, 3);

        let chunks = f.store.list_chunks(source.id).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks[0].metadata["chunk_type"], "text");
        assert_eq!(chunks[0].metadata["source_type"], "text");
        assert_eq!(chunks[0].metadata["strategy"], "paragraph");

        assert_eq!(f.vectors.count().await.unwrap(), 3);
        let hits = f
            .vectors
            .search(&vec![0.1; DIM], &SearchFilter::for_user(user), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.payload.source_id == source.id));

        let stored = f.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_web_chunks_carry_url() {
        let f = fixture();
        let request = IngestRequest::new(
            Uuid::new_v4(),
            SourceKind::Web,
            "Blog post",
            IngestContent::Text(paragraphs(1)),
        )
        .with_url("https://example.com/post");

        let (source, _) = f.ingestor.ingest(request).await.unwrap();
        let chunks = f.store.list_chunks(source.id).unwrap();
        assert_eq!(chunks[0].metadata["chunk_type"], "web_content");
        assert_eq!(chunks[0].metadata["url"], "https://example.com/post");
    }

    #[tokio::test]
    async fn test_pages_keep_page_numbers() {
        let f = fixture();
        let request = IngestRequest::new(
            Uuid::new_v4(),
            SourceKind::Document,
            "report.pdf",
            IngestContent::Pages(vec![(1, paragraphs(1)), (2, paragraphs(2))]),
        );

        let (source, job) = f.ingestor.ingest(request).await.unwrap();
        assert_eq!(job.chunk_count, 3);

        let chunks = f.store.list_chunks(source.id).unwrap();
        let pages: Vec<_> = chunks.iter().map(|c| c.metadata["page_number"].as_u64().unwrap()).collect();
        assert_eq!(pages, vec![1, 2, 2]);
        assert_eq!(chunks[2].chunk_index, 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_marks_job_failed() {
        let f = fixture();
        f.embedder.fail.store(true, Ordering::SeqCst);

        let (source, job) = f
            .ingestor
            .ingest(IngestRequest::text(Uuid::new_v4(), "note", paragraphs(2)))
            .await
            .unwrap();

        match &job.status {
            JobStatus::Failed { error } => assert!(error.contains("embedding service unavailable")),
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(f.store.list_chunks(source.id).unwrap().is_empty());
        assert_eq!(f.vectors.count().await.unwrap(), 0);
        assert_eq!(f.store.stats().unwrap().failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let f = fixture();
        let user = Uuid::new_v4();

        let submitted = f
            .ingestor
            .submit(IngestRequest::text(user, "note", paragraphs(2)))
            .unwrap();
        assert_eq!(submitted.job.status, JobStatus::Queued);

        let source_id = submitted.source.id;
        let job = submitted.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(f.store.list_chunks(source_id).unwrap().len(), 2);
        assert_eq!(f.store.list_jobs(user, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_content_rejected() {
        let f = fixture();
        let user = Uuid::new_v4();
        assert!(f.ingestor.ingest(IngestRequest::text(user, "empty", "   \n ")).await.is_err());
        assert!(f.store.list_sources(user, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_source_removes_vectors_and_chunks() {
        let f = fixture();
        let user = Uuid::new_v4();
        let (source, _) = f
            .ingestor
            .ingest(IngestRequest::text(user, "note", paragraphs(2)))
            .await
            .unwrap();

        // 다른 사용자는 삭제 불가
        assert!(!f.ingestor.delete_source(source.id, Uuid::new_v4()).await.unwrap());
        assert_eq!(f.vectors.count().await.unwrap(), 2);

        assert!(f.ingestor.delete_source(source.id, user).await.unwrap());
        assert_eq!(f.vectors.count().await.unwrap(), 0);
        assert!(f.store.list_chunks(source.id).unwrap().is_empty());
        assert!(f.store.get_source(source.id, user).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unwritable_processing_status_marks_job_failed() {
        let f = fixture();
        let conn = rusqlite::Connection::open(f._dir.path().join("knowledge.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_processing BEFORE UPDATE ON jobs
             WHEN NEW.status = 'processing'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

        let (source, job) = f
            .ingestor
            .ingest(IngestRequest::text(Uuid::new_v4(), "note", paragraphs(2)))
            .await
            .unwrap();

        match &job.status {
            JobStatus::Failed { error } => {
                assert!(error.contains("Failed to start ingest job"));
                assert!(error.contains("disk I/O error"));
            }
            other => panic!("unexpected status: {:?}", other),
        }

        let stored = f.store.get_job(job.id).unwrap().unwrap();
        assert!(matches!(stored.status, JobStatus::Failed { .. }));
        assert!(f.store.list_chunks(source.id).unwrap().is_empty());
        assert_eq!(f.vectors.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unrecordable_failure_is_error() {
        let f = fixture();
        let conn = rusqlite::Connection::open(f._dir.path().join("knowledge.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER read_only_jobs BEFORE UPDATE ON jobs
             BEGIN SELECT RAISE(ABORT, 'read-only'); END;",
        )
        .unwrap();

        let submitted = f
            .ingestor
            .submit(IngestRequest::text(Uuid::new_v4(), "note", paragraphs(1)))
            .unwrap();
        let err = submitted.wait().await.unwrap_err();
        assert!(format!("{:#}", err).contains("could not be recorded"));
    }

    /// 삭제만 실패하는 벡터 인덱스
    struct StuckVectors(MemoryVectorIndex);

    #[async_trait]
    impl VectorIndex for StuckVectors {
        async fn upsert_batch(&self, entries: Vec<VectorEntry>) -> Result<usize> {
            self.0.upsert_batch(entries).await
        }

        async fn search(&self, query: &[f32], filter: &SearchFilter, limit: usize) -> Result<Vec<VectorHit>> {
            self.0.search(query, filter, limit).await
        }

        async fn delete_chunks_by_source(&self, _source_id: Uuid) -> Result<usize> {
            anyhow::bail!("vector store offline")
        }

        async fn count(&self) -> Result<usize> {
            self.0.count().await
        }

        fn dimension(&self) -> usize {
            self.0.dimension()
        }
    }

    #[tokio::test]
    async fn test_vector_delete_failure_still_removes_source() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("knowledge.db")).unwrap();
        let vectors = Arc::new(StuckVectors(MemoryVectorIndex::new(DIM)));
        let chunker = Chunker::new(ChunkConfig::new(20, 5).unwrap(), TokenCounter::CharEstimate).unwrap();
        let ingestor = Ingestor::new(
            store.clone(),
            vectors.clone(),
            Arc::new(LengthEmbedder::new()),
            Arc::new(chunker),
        )
        .unwrap();

        let user = Uuid::new_v4();
        let (source, _) = ingestor
            .ingest(IngestRequest::text(user, "note", paragraphs(2)))
            .await
            .unwrap();

        let err = ingestor.delete_source(source.id, user).await.unwrap_err();
        assert!(format!("{:#}", err).contains("vector store offline"));

        // 소스와 청크는 지워져서 남은 벡터가 하이드레이션되지 않음
        assert!(store.get_source(source.id, user).unwrap().is_none());
        assert!(store.list_chunks(source.id).unwrap().is_empty());
        assert_eq!(vectors.count().await.unwrap(), 2);
        assert!(!ingestor.delete_source(source.id, user).await.unwrap());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("knowledge.db")).unwrap();
        let result = Ingestor::new(
            store,
            Arc::new(MemoryVectorIndex::new(DIM + 1)),
            Arc::new(LengthEmbedder::new()),
            Arc::new(Chunker::with_defaults().unwrap()),
        );
        assert!(result.is_err());
    }
}
