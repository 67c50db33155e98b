//! palank-recall - 개인 지식베이스 하이브리드 검색
//!
//! 텍스트, 문서, 웹 페이지를 사용자별로 수집하고
//! LanceDB 벡터 검색 + SQLite FTS5 키워드 검색을 결합해 찾아줍니다.
//! 쿼리 속 영어 시간 표현("last friday", "last week", "last month", "this week",
//! "this month", "in 2023", "before/after March 15, 2024")은 검색 필터로 바뀝니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod extractor;
pub mod knowledge;
pub mod scraper;

// Re-exports
pub use config::Settings;
pub use embedding::{create_embedder, EmbeddingProvider, GeminiEmbedding};
pub use knowledge::{
    ChunkConfig, ChunkStrategy, Chunker, HybridRetriever, IngestContent, IngestJob, IngestRequest,
    Ingestor, JobStatus, KnowledgeBase, KnowledgeStore, LanceVectorStore, MemoryVectorIndex,
    QueryFilters, RetrievalError, RetrievedChunk, Source, SourceKind, TemporalQueryParser,
    TimeRange, VectorIndex,
};
pub use scraper::{ScrapedContent, WebScraper};
