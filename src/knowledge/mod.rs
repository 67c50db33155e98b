//! Knowledge 모듈 - 개인 지식베이스 수집/검색
//!
//! - Chunker: sentence / paragraph / token-limit 분할
//! - SQLite: 소스, 청크, 수집 작업 저장 + FTS5 키워드 검색
//! - LanceDB: 필터 페이로드를 가진 벡터 검색
//! - Hybrid: 벡터/키워드 가중 융합 + 시간 범위 필터

mod base;
mod chunker;
mod fusion;
mod hybrid;
mod ingest;
mod lance;
mod store;
mod temporal;
mod tokenizer;
mod types;
mod vector;

// Re-exports
pub use base::{KnowledgeBase, KnowledgeStatus};
pub use chunker::{
    ChunkConfig, ChunkStrategy, Chunker, DEFAULT_MAX_CHUNK_TOKENS, DEFAULT_OVERLAP_TOKENS,
};
pub use fusion::{fuse, KEYWORD_WEIGHT, VECTOR_WEIGHT};
pub use hybrid::{
    cancel_pair, CancelHandle, CancelSignal, HybridRetriever, RetrievalConfig, RetrievalError,
    DEFAULT_OVERFETCH,
};
pub use ingest::{IngestContent, IngestRequest, Ingestor, SubmittedJob};
pub use lance::LanceVectorStore;
pub use store::{get_data_dir, ChunkStore, KeywordIndex, KnowledgeStore, StoreStats};
pub use temporal::TemporalQueryParser;
pub use tokenizer::{estimate_tokens, TokenCounter};
pub use types::{
    parse_user_id, resolve_user_id, Chunk, IngestJob, JobStatus, JobTransitionError, Metadata,
    NewSource, QueryFilters, RetrievedChunk, ScoredHit, ScoredResult, SearchFilter, Source,
    SourceKind, SourceSummary, TextChunk, TimeRange,
};
pub use vector::{
    check_dimension, cosine_similarity, MemoryVectorIndex, VectorEntry, VectorHit, VectorIndex,
    VectorPayload, PREVIEW_CHARS,
};
