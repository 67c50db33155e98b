//! 설정 - 환경변수 기반
//!
//! 모든 값은 `PALANK_RECALL_` 접두사 환경변수로 덮어쓸 수 있습니다.
//!
//! | 변수 | 기본값 |
//! |---|---|
//! | `PALANK_RECALL_DATA_DIR` | `~/.palank-recall` |
//! | `PALANK_RECALL_EMBEDDING_DIM` | 3072 |
//! | `PALANK_RECALL_MAX_CHUNK_TOKENS` | 1000 |
//! | `PALANK_RECALL_OVERLAP_TOKENS` | 100 |
//! | `PALANK_RECALL_TOKENIZER` | (없음, chars/4 추정) |
//! | `PALANK_RECALL_TOP_K` | 10 |
//! | `PALANK_RECALL_QUERY_TIMEOUT_SECS` | (없음) |
//! | `PALANK_RECALL_VECTOR_BACKEND` | `lance` |
//!
//! API 키는 `GEMINI_API_KEY` > `GOOGLE_AI_API_KEY` 순으로 찾습니다.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::embedding::DEFAULT_DIMENSION;
use crate::knowledge::{get_data_dir, ChunkConfig};

/// 환경변수 접두사
pub const ENV_PREFIX: &str = "PALANK_RECALL_";

/// 기본 검색 결과 수
pub const DEFAULT_TOP_K: usize = 10;

/// API 키 환경변수 (우선순위 순)
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

/// 벡터 인덱스 백엔드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    /// LanceDB (디스크)
    Lance,
    /// 인메모리 (프로세스 수명)
    Memory,
}

impl FromStr for VectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lance" | "lancedb" => Ok(VectorBackend::Lance),
            "memory" => Ok(VectorBackend::Memory),
            other => anyhow::bail!("Unknown vector backend: {} (expected lance or memory)", other),
        }
    }
}

/// 런타임 설정
#[derive(Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub embedding_dimension: usize,
    pub chunk: ChunkConfig,
    pub tokenizer_path: Option<PathBuf>,
    pub top_k: usize,
    pub query_timeout: Option<Duration>,
    pub vector_backend: VectorBackend,
    pub api_key: Option<String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("data_dir", &self.data_dir)
            .field("embedding_dimension", &self.embedding_dimension)
            .field("chunk", &self.chunk)
            .field("tokenizer_path", &self.tokenizer_path)
            .field("top_k", &self.top_k)
            .field("query_timeout", &self.query_timeout)
            .field("vector_backend", &self.vector_backend)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            embedding_dimension: DEFAULT_DIMENSION,
            chunk: ChunkConfig::default(),
            tokenizer_path: None,
            top_k: DEFAULT_TOP_K,
            query_timeout: None,
            vector_backend: VectorBackend::Lance,
            api_key: None,
        }
    }
}

impl Settings {
    /// 프로세스 환경변수에서 로드
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 조회 함수로 로드 (테스트에서 환경 주입용)
    ///
    /// 빈 문자열은 설정되지 않은 것으로 취급합니다.
    /// 형식이 잘못된 값은 기본값으로 대체하지 않고 에러를 반환합니다.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let data_dir = get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);
        let embedding_dimension = parse_var(&get, "EMBEDDING_DIM")?.unwrap_or(defaults.embedding_dimension);

        let chunk = ChunkConfig::new(
            parse_var(&get, "MAX_CHUNK_TOKENS")?.unwrap_or(defaults.chunk.max_chunk_tokens),
            parse_var(&get, "OVERLAP_TOKENS")?.unwrap_or(defaults.chunk.overlap_tokens),
        )
        .context("Invalid chunking settings")?;

        let top_k = parse_var(&get, "TOP_K")?.unwrap_or(defaults.top_k);
        if top_k == 0 {
            anyhow::bail!("{}TOP_K must be positive", ENV_PREFIX);
        }

        let query_timeout = parse_var::<u64, _>(&get, "QUERY_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let vector_backend = parse_var(&get, "VECTOR_BACKEND")?.unwrap_or(defaults.vector_backend);

        let api_key = API_KEY_VARS
            .iter()
            .copied()
            .find_map(|name| lookup(name).filter(|v| !v.is_empty()).map(|v| (name, v)))
            .map(|(name, key)| {
                tracing::debug!("Using API key from {}", name);
                key
            });

        Ok(Self {
            data_dir,
            embedding_dimension,
            chunk,
            tokenizer_path: get("TOKENIZER").map(PathBuf::from),
            top_k,
            query_timeout,
            vector_backend,
            api_key,
        })
    }

    /// SQLite DB 경로
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("knowledge.db")
    }

    /// LanceDB 디렉토리 경로
    pub fn lance_path(&self) -> PathBuf {
        self.data_dir.join("vectors.lance")
    }

    /// API 키 (없으면 안내 메시지와 함께 에러)
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
                 Get your API key at: https://aistudio.google.com/app/apikey"
            )
        })
    }
}

fn parse_var<T, G>(get: &G, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid {}{}={:?}: {}", ENV_PREFIX, name, raw, e))
        })
        .transpose()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.embedding_dimension, 3072);
        assert_eq!(settings.chunk.max_chunk_tokens, 1000);
        assert_eq!(settings.chunk.overlap_tokens, 100);
        assert_eq!(settings.top_k, DEFAULT_TOP_K);
        assert_eq!(settings.vector_backend, VectorBackend::Lance);
        assert!(settings.query_timeout.is_none());
        assert!(settings.api_key.is_none());
        assert!(settings.require_api_key().is_err());
        assert!(settings.data_dir.ends_with(".palank-recall"));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("PALANK_RECALL_DATA_DIR", "/tmp/recall"),
            ("PALANK_RECALL_EMBEDDING_DIM", "768"),
            ("PALANK_RECALL_MAX_CHUNK_TOKENS", "400"),
            ("PALANK_RECALL_OVERLAP_TOKENS", "40"),
            ("PALANK_RECALL_TOKENIZER", "/models/tokenizer.json"),
            ("PALANK_RECALL_TOP_K", "5"),
            ("PALANK_RECALL_QUERY_TIMEOUT_SECS", "12"),
            ("PALANK_RECALL_VECTOR_BACKEND", "Memory"),
        ]))
        .unwrap();

        assert_eq!(settings.db_path(), PathBuf::from("/tmp/recall/knowledge.db"));
        assert_eq!(settings.lance_path(), PathBuf::from("/tmp/recall/vectors.lance"));
        assert_eq!(settings.embedding_dimension, 768);
        assert_eq!(settings.chunk, ChunkConfig::new(400, 40).unwrap());
        assert_eq!(settings.tokenizer_path, Some(PathBuf::from("/models/tokenizer.json")));
        assert_eq!(settings.top_k, 5);
        assert_eq!(settings.query_timeout, Some(Duration::from_secs(12)));
        assert_eq!(settings.vector_backend, VectorBackend::Memory);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(Settings::from_lookup(lookup(&[("PALANK_RECALL_TOP_K", "ten")])).is_err());
        assert!(Settings::from_lookup(lookup(&[("PALANK_RECALL_TOP_K", "0")])).is_err());
        assert!(Settings::from_lookup(lookup(&[("PALANK_RECALL_VECTOR_BACKEND", "faiss")])).is_err());
        // overlap >= max
        assert!(Settings::from_lookup(lookup(&[
            ("PALANK_RECALL_MAX_CHUNK_TOKENS", "100"),
            ("PALANK_RECALL_OVERLAP_TOKENS", "100"),
        ]))
        .is_err());
    }

    #[test]
    fn test_api_key_priority() {
        let settings = Settings::from_lookup(lookup(&[
            ("GOOGLE_AI_API_KEY", "google-key"),
            ("GEMINI_API_KEY", "gemini-key"),
        ]))
        .unwrap();
        assert_eq!(settings.require_api_key().unwrap(), "gemini-key");

        let settings = Settings::from_lookup(lookup(&[
            ("GEMINI_API_KEY", ""),
            ("GOOGLE_AI_API_KEY", "google-key"),
        ]))
        .unwrap();
        assert_eq!(settings.api_key.as_deref(), Some("google-key"));

        let debug = format!("{:?}", settings);
        assert!(!debug.contains("google-key"));
    }

    #[test]
    fn test_empty_values_ignored() {
        let settings = Settings::from_lookup(lookup(&[("PALANK_RECALL_TOP_K", "  ")])).unwrap();
        assert_eq!(settings.top_k, DEFAULT_TOP_K);
    }
}
