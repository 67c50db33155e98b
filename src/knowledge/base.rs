//! KnowledgeBase - 설정에서 저장소/인덱스/청커를 조립
//!
//! CLI와 라이브러리 사용자가 같은 방식으로 백엔드를 여는 진입점입니다.
//! 임베딩 프로바이더는 API 키가 필요하므로 호출자가 따로 주입합니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;

use super::chunker::Chunker;
use super::hybrid::{HybridRetriever, RetrievalConfig};
use super::ingest::{remove_source, Ingestor};
use super::lance::LanceVectorStore;
use super::store::{KnowledgeStore, StoreStats};
use super::tokenizer::TokenCounter;
use super::vector::{MemoryVectorIndex, VectorIndex};
use crate::config::{Settings, VectorBackend};
use crate::embedding::EmbeddingProvider;

/// 지식베이스 상태 요약
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStatus {
    #[serde(flatten)]
    pub store: StoreStats,
    pub vector_count: usize,
    pub vector_backend: String,
    pub embedding_dimension: usize,
    pub token_counter: String,
}

/// 조립된 지식베이스
pub struct KnowledgeBase {
    settings: Settings,
    store: KnowledgeStore,
    vectors: Arc<dyn VectorIndex>,
    chunker: Arc<Chunker>,
}

impl KnowledgeBase {
    /// 설정대로 SQLite 저장소와 벡터 인덱스를 엽니다.
    pub async fn open(settings: &Settings) -> Result<Self> {
        let store = KnowledgeStore::open(&settings.db_path()).context("Failed to open knowledge store")?;

        let vectors: Arc<dyn VectorIndex> = match settings.vector_backend {
            VectorBackend::Lance => Arc::new(
                LanceVectorStore::open(&settings.lance_path(), settings.embedding_dimension)
                    .await
                    .context("Failed to open LanceDB vector store")?,
            ),
            VectorBackend::Memory => {
                tracing::warn!("In-memory vector index: vectors are lost when the process exits");
                Arc::new(MemoryVectorIndex::new(settings.embedding_dimension))
            }
        };

        Self::from_parts(settings.clone(), store, vectors)
    }

    /// 이미 연 백엔드로 조립 (테스트, 임베디드 사용)
    pub fn from_parts(settings: Settings, store: KnowledgeStore, vectors: Arc<dyn VectorIndex>) -> Result<Self> {
        let counter = TokenCounter::from_optional_path(settings.tokenizer_path.as_deref());
        let chunker = Chunker::new(settings.chunk, counter)?;

        Ok(Self {
            settings,
            store,
            vectors,
            chunker: Arc::new(chunker),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn vectors(&self) -> Arc<dyn VectorIndex> {
        Arc::clone(&self.vectors)
    }

    pub fn chunker(&self) -> Arc<Chunker> {
        Arc::clone(&self.chunker)
    }

    /// 수집기 생성
    pub fn ingestor(&self, embedder: Arc<dyn EmbeddingProvider>) -> Result<Ingestor> {
        Ingestor::new(
            self.store.clone(),
            self.vectors(),
            embedder,
            self.chunker(),
        )
    }

    /// 검색기 생성 (마감 시간은 설정의 query_timeout)
    pub fn retriever(&self, embedder: Arc<dyn EmbeddingProvider>) -> HybridRetriever {
        let store = Arc::new(self.store.clone());
        HybridRetriever::new(embedder, self.vectors(), store.clone(), store).with_config(RetrievalConfig {
            deadline: self.settings.query_timeout,
            ..RetrievalConfig::default()
        })
    }

    /// 소스 삭제 (벡터 + 청크 + 작업), 임베딩 프로바이더 불필요
    pub async fn delete_source(&self, source_id: Uuid, user_id: Uuid) -> Result<bool> {
        remove_source(&self.store, self.vectors.as_ref(), source_id, user_id).await
    }

    /// 상태 요약
    pub async fn status(&self) -> Result<KnowledgeStatus> {
        let store = self.store.stats()?;
        let vector_count = self.vectors.count().await.context("Failed to count vectors")?;

        Ok(KnowledgeStatus {
            store,
            vector_count,
            vector_backend: match self.settings.vector_backend {
                VectorBackend::Lance => "lance".to_string(),
                VectorBackend::Memory => "memory".to_string(),
            },
            embedding_dimension: self.vectors.dimension(),
            token_counter: self.chunker.counter().label().to_string(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
