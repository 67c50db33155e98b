//! 하이브리드 검색 - 벡터 + 키워드 가중 융합
//!
//! 한 번의 검색은 다음 순서로 진행됩니다.
//!
//! 1. 사용자 ID 검증 (잘못된 ID는 빈 결과)
//! 2. 쿼리에서 시간 범위 파싱
//! 3. 벡터 경로(쿼리 임베딩 → 벡터 검색)와 키워드 경로를 동시에 실행
//! 4. 가중 융합 후 상위 `top_k`개 선택
//! 5. 청크 + 소스 하이드레이션 (사용자 소유분만), 융합 순서 유지
//!
//! 어느 한 백엔드라도 실패하면 검색 전체가 실패합니다.
//! 취소 신호나 마감 시간은 진행 중인 두 경로를 모두 중단시킵니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;

use super::fusion::fuse;
use super::store::{ChunkStore, KeywordIndex};
use super::temporal::TemporalQueryParser;
use super::types::{parse_user_id, Chunk, QueryFilters, RetrievedChunk, ScoredHit, SearchFilter, Source};
use super::vector::{VectorHit, VectorIndex};

/// 융합 전 백엔드별 후보 배수
pub const DEFAULT_OVERFETCH: usize = 2;

// ============================================================================
// Errors
// ============================================================================

/// 검색 실패
///
/// 업스트림 실패와 취소/마감을 구분합니다.
/// 잘못된 사용자 ID나 해석할 수 없는 날짜는 에러가 아닙니다.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("embedding provider failed: {0:#}")]
    Embedding(#[source] anyhow::Error),

    #[error("vector search failed: {0:#}")]
    VectorSearch(#[source] anyhow::Error),

    #[error("keyword search failed: {0:#}")]
    KeywordSearch(#[source] anyhow::Error),

    #[error("chunk hydration failed: {0:#}")]
    Hydration(#[source] anyhow::Error),

    #[error("retrieval cancelled")]
    Cancelled,

    #[error("retrieval exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl RetrievalError {
    /// 호출자 요청에 의한 중단인지 (더 긴 마감으로 재시도 가능)
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RetrievalError::Cancelled | RetrievalError::DeadlineExceeded(_))
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// 취소 요청 측
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// 취소 관찰 측 (검색에 전달)
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// 취소 핸들/신호 쌍 생성
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal { rx: self.tx.subscribe() }
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 취소될 때까지 대기 (핸들이 취소 없이 drop되면 영원히 대기)
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 검색 설정
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// 백엔드별 후보 수 = top_k × overfetch
    pub overfetch: usize,
    /// 검색 전체 마감 시간
    pub deadline: Option<Duration>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            overfetch: DEFAULT_OVERFETCH,
            deadline: None,
        }
    }
}

/// 하이브리드 검색기
///
/// 백엔드는 모두 트레이트 객체로 주입됩니다.
pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorIndex>,
    keywords: Arc<dyn KeywordIndex>,
    chunks: Arc<dyn ChunkStore>,
    temporal: TemporalQueryParser,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorIndex>,
        keywords: Arc<dyn KeywordIndex>,
        chunks: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            keywords,
            chunks,
            temporal: TemporalQueryParser::new(),
            config: RetrievalConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// 하이브리드 검색
    ///
    /// 결과는 융합 점수 내림차순이며, 점수는 `relevance_score`로 붙습니다.
    /// 잘못된 사용자 ID, `top_k == 0`, 빈 쿼리는 빈 결과입니다.
    pub async fn retrieve(
        &self,
        query: &str,
        user_id: &str,
        top_k: usize,
        filters: Option<&QueryFilters>,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        self.retrieve_with_cancel(query, user_id, top_k, filters, None).await
    }

    /// 취소 신호를 받는 하이브리드 검색
    pub async fn retrieve_with_cancel(
        &self,
        query: &str,
        user_id: &str,
        top_k: usize,
        filters: Option<&QueryFilters>,
        cancel: Option<CancelSignal>,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let work = async {
            let run = self.run(query, user_id, top_k, filters);
            match self.config.deadline {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("Retrieval exceeded deadline {:?}", limit);
                        Err(RetrievalError::DeadlineExceeded(limit))
                    }
                },
                None => run.await,
            }
        };

        let Some(mut signal) = cancel else {
            return work.await;
        };

        if signal.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                tracing::info!("Retrieval cancelled by caller");
                Err(RetrievalError::Cancelled)
            }
            result = work => result,
        }
    }

    /// 두 백엔드가 공유하는 필터 생성
    ///
    /// 명시적 `time_range`가 쿼리에서 파싱한 범위보다 우선합니다.
    pub fn build_filter(&self, query: &str, user_id: Uuid, filters: Option<&QueryFilters>) -> SearchFilter {
        let explicit = filters.and_then(|f| f.time_range);
        let time_range = explicit.or_else(|| self.temporal.parse(query));

        SearchFilter {
            user_id,
            time_range,
            source_kinds: filters.map(|f| f.source_kinds.clone()).unwrap_or_default(),
        }
    }

    async fn run(
        &self,
        query: &str,
        user_id: &str,
        top_k: usize,
        filters: Option<&QueryFilters>,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let Some(user) = parse_user_id(user_id) else {
            tracing::warn!("Malformed user id {:?}, returning empty result", user_id);
            return Ok(vec![]);
        };

        if top_k == 0 || query.trim().is_empty() {
            return Ok(vec![]);
        }

        let filter = self.build_filter(query, user, filters);
        let candidates = top_k.saturating_mul(self.config.overfetch.max(1));

        if let Some(range) = &filter.time_range {
            tracing::debug!("Temporal filter: {:?} ~ {:?}", range.start, range.end);
        }

        // 벡터 경로: 임베딩이 끝나야 검색 가능
        let vector_path = async {
            let embedding = self
                .embedder
                .embed_query(query)
                .await
                .map_err(RetrievalError::Embedding)?;
            let hits = self
                .vectors
                .search(&embedding, &filter, candidates)
                .await
                .map_err(RetrievalError::VectorSearch)?;
            Ok::<_, RetrievalError>(hits)
        };

        // 키워드 경로: 의존성 없이 바로 시작
        let keyword_path = async {
            self.keywords
                .search(query, &filter, candidates)
                .await
                .map_err(RetrievalError::KeywordSearch)
        };

        let (vector_hits, keyword_hits) = tokio::try_join!(vector_path, keyword_path).map_err(|e| {
            tracing::error!("Retrieval backend failure: {}", e);
            e
        })?;

        tracing::debug!(
            "Backend hits: vector={}, keyword={}",
            vector_hits.len(),
            keyword_hits.len()
        );

        let vector_scored: Vec<ScoredHit> = vector_hits.iter().map(VectorHit::scored).collect();
        let fused = fuse(&vector_scored, &keyword_hits, top_k);
        if fused.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<Uuid> = fused.iter().map(|r| r.chunk_id).collect();
        let hydrated = self
            .chunks
            .fetch(&ids, user)
            .await
            .map_err(RetrievalError::Hydration)?;

        // 백엔드 필터가 우회되더라도 다른 사용자의 청크는 버린다
        let mut by_id: HashMap<Uuid, (Chunk, Source)> = hydrated
            .into_iter()
            .filter(|(_, source)| source.user_id == user)
            .map(|(chunk, source)| (chunk.id, (chunk, source)))
            .collect();

        let results: Vec<RetrievedChunk> = fused
            .into_iter()
            .filter_map(|scored| {
                let (chunk, source) = by_id.remove(&scored.chunk_id)?;
                Some(RetrievedChunk {
                    chunk,
                    source: source.summary(),
                    relevance_score: scored.combined_score,
                })
            })
            .collect();

        if results.len() < ids.len() {
            tracing::debug!("Dropped {} unhydrated results", ids.len() - results.len());
        }

        Ok(results)
    }
}

// ============================================================================
// Tests
// ============================================================================
