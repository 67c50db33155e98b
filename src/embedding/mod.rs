//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 문서 청크와 검색 쿼리를 같은 벡터 공간으로 변환합니다.
//! Gemini는 task type으로 문서/쿼리 임베딩을 구분하므로
//! 트레이트도 `embed`(문서)와 `embed_query`(쿼리)를 나눠 둡니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let settings = Settings::from_env()?;
//! let embedder = create_embedder(&settings)?;
//! let embedding = embedder.embed_query("what did I read last week?").await?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Settings;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 문서 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 검색 쿼리 임베딩 (기본 구현: `embed`와 동일)
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text).await
    }

    /// 배치 임베딩 (기본 구현: 순차 호출)
    ///
    /// 결과는 입력과 같은 순서, 같은 길이여야 합니다.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini 임베딩 API 엔드포인트 (gemini-embedding-001, MRL 지원)
const GEMINI_EMBED_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent";

const GEMINI_MODEL: &str = "models/gemini-embedding-001";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 3072;

/// 지원 차원 (MRL truncation)
pub const SUPPORTED_DIMENSIONS: [usize; 3] = [768, 1536, 3072];

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: usize = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이
const MIN_DELAY_MS: u64 = 1000;
/// 429 / 전송 실패 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 2000;

/// Gemini task type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskType {
    RetrievalDocument,
    RetrievalQuery,
}

impl TaskType {
    fn as_str(&self) -> &'static str {
        match self {
            TaskType::RetrievalDocument => "RETRIEVAL_DOCUMENT",
            TaskType::RetrievalQuery => "RETRIEVAL_QUERY",
        }
    }
}

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    dimension: usize,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

/// 최소 간격 + 슬라이딩 윈도우 Rate Limiter
#[derive(Debug)]
struct RateLimiter {
    /// 윈도우 안의 요청 시각 (오래된 순)
    sent: VecDeque<Instant>,
    max_requests: usize,
    window: Duration,
    min_delay: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration, min_delay: Duration) -> Self {
        Self {
            sent: VecDeque::with_capacity(max_requests),
            max_requests,
            window,
            min_delay,
        }
    }

    /// `now`에 요청하려면 얼마나 기다려야 하는지
    fn delay_at(&mut self, now: Instant) -> Duration {
        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }

        let spacing = self
            .sent
            .back()
            .map(|&last| self.min_delay.saturating_sub(now.duration_since(last)))
            .unwrap_or_default();

        let window_full = match self.sent.front() {
            Some(&oldest) if self.sent.len() >= self.max_requests => {
                self.window.saturating_sub(now.duration_since(oldest))
            }
            _ => Duration::ZERO,
        };

        spacing.max(window_full)
    }

    /// 요청 가능할 때까지 대기 후 기록
    async fn acquire(&mut self) {
        let wait = self.delay_at(Instant::now());
        if !wait.is_zero() {
            tracing::debug!("Rate limiter: waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        if self.sent.len() >= self.max_requests {
            self.sent.pop_front();
        }
        self.sent.push_back(now);
    }
}

/// 한 번의 API 호출 실패
enum AttemptError {
    /// 429, 전송 실패: 백오프 후 재시도
    Retryable(anyhow::Error),
    /// 그 외 API 에러, 응답 파싱 실패: 즉시 실패
    Fatal(anyhow::Error),
}

impl GeminiEmbedding {
    /// 기본 차원으로 생성
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_dimension(api_key, DEFAULT_DIMENSION)
    }

    /// 차원을 지정하여 생성 (768, 1536, 3072 중 선택)
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if !SUPPORTED_DIMENSIONS.contains(&dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                dimension
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(
            RATE_LIMIT_RPM,
            RATE_LIMIT_WINDOW,
            Duration::from_millis(MIN_DELAY_MS),
        )));

        Ok(Self {
            api_key,
            client,
            dimension,
            rate_limiter,
        })
    }

    fn request_for(&self, text: &str, task: TaskType) -> EmbedRequest {
        EmbedRequest {
            model: GEMINI_MODEL.to_string(),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type: task.as_str().to_string(),
            output_dimensionality: Some(self.dimension),
        }
    }

    async fn embed_with_task(&self, text: &str, task: TaskType) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = self.request_for(text, task);
        let mut attempt = 0;

        loop {
            self.rate_limiter.lock().await.acquire().await;

            match self.send_once(&request).await {
                Ok(values) => return Ok(values),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable(e)) if attempt >= MAX_RETRIES => {
                    return Err(e.context(format!("Embedding failed after {} retries", MAX_RETRIES)));
                }
                Err(AttemptError::Retryable(e)) => {
                    let backoff = backoff_for(attempt);
                    attempt += 1;
                    tracing::warn!("{:#}; retry {}/{} in {:?}", e, attempt, MAX_RETRIES, backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// embedContent 1회 호출
    async fn send_once(&self, request: &EmbedRequest) -> Result<Vec<f32>, AttemptError> {
        // API 키는 URL이 아닌 헤더로 전송
        let response = self
            .client
            .post(GEMINI_EMBED_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(anyhow::Error::new(e).context("Embedding request failed")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AttemptError::Retryable(anyhow::Error::new(e).context("Failed to read response body")))?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Retryable(anyhow::anyhow!("Gemini rate limit (429)")));
        }

        if !status.is_success() {
            let detail = match serde_json::from_str::<GeminiError>(&body) {
                Ok(err) => format!("{} {}", err.error.status, err.error.message),
                Err(_) => body,
            };
            return Err(AttemptError::Fatal(anyhow::anyhow!("Gemini API error ({}): {}", status, detail)));
        }

        let parsed: EmbedResponse = serde_json::from_str(&body)
            .context("Failed to parse embedding response")
            .map_err(AttemptError::Fatal)?;
        let values = parsed.embedding.values;

        if values.len() != self.dimension {
            return Err(AttemptError::Fatal(anyhow::anyhow!(
                "Gemini returned {} dimensions, expected {}",
                values.len(),
                self.dimension
            )));
        }

        Ok(values)
    }
}

fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: String,
    #[serde(rename = "outputDimensionality", skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_task(text, TaskType::RetrievalDocument).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_task(text, TaskType::RetrievalQuery).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Gemini embedContent는 단건 API: 순차 처리, rate limiter가 간격 조절
        let mut results = Vec::with_capacity(texts.len());

        for (i, text) in texts.iter().enumerate() {
            tracing::debug!("Embedding batch {}/{}", i + 1, texts.len());
            results.push(
                self.embed(text)
                    .await
                    .with_context(|| format!("Failed to embed chunk {}/{}", i + 1, texts.len()))?,
            );
        }

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "gemini-embedding-001"
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에서 임베딩 프로바이더 생성
///
/// API 키가 없으면 발급 안내와 함께 에러를 반환합니다.
pub fn create_embedder(settings: &Settings) -> Result<GeminiEmbedding> {
    let api_key = settings.require_api_key()?.to_string();
    let embedder = GeminiEmbedding::with_dimension(api_key, settings.embedding_dimension)?;
    tracing::info!(
        "Using Gemini API embedding (dimension: {})",
        embedder.dimension
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_dimension() {
        let err = GeminiEmbedding::with_dimension("fake_key".to_string(), 999).unwrap_err();
        assert!(err.to_string().contains("Invalid dimension"));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in SUPPORTED_DIMENSIONS {
            let embedder = GeminiEmbedding::with_dimension("fake_key".to_string(), dim).unwrap();
            assert_eq!(EmbeddingProvider::dimension(&embedder), dim);
        }
    }

    #[test]
    fn test_request_task_types() {
        let embedder = GeminiEmbedding::with_dimension("fake_key".to_string(), 768).unwrap();

        let doc = serde_json::to_value(embedder.request_for("hello", TaskType::RetrievalDocument)).unwrap();
        assert_eq!(doc["taskType"], "RETRIEVAL_DOCUMENT");
        assert_eq!(doc["outputDimensionality"], 768);
        assert_eq!(doc["content"]["parts"][0]["text"], "hello");

        let query = serde_json::to_value(embedder.request_for("hello", TaskType::RetrievalQuery)).unwrap();
        assert_eq!(query["taskType"], "RETRIEVAL_QUERY");
    }

    #[tokio::test]
    async fn test_blank_text_is_zero_vector() {
        let embedder = GeminiEmbedding::with_dimension("fake_key".to_string(), 768).unwrap();
        let v = embedder.embed_query("   ").await.unwrap();
        assert_eq!(v.len(), 768);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_create_embedder_requires_key() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        assert!(create_embedder(&settings).is_err());

        let settings = Settings::from_lookup(|key| {
            (key == "GEMINI_API_KEY").then(|| "fake_key".to_string())
        })
        .unwrap();
        let embedder = create_embedder(&settings).unwrap();
        assert_eq!(EmbeddingProvider::dimension(&embedder), DEFAULT_DIMENSION);
    }

    #[test]
    fn test_rate_limiter_delays() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60), Duration::from_millis(500));
        let t0 = Instant::now();
        assert_eq!(limiter.delay_at(t0), Duration::ZERO);

        limiter.sent.push_back(t0);
        assert_eq!(limiter.delay_at(t0 + Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(limiter.delay_at(t0 + Duration::from_secs(1)), Duration::ZERO);

        // 윈도우가 가득 차면 가장 오래된 요청이 빠질 때까지
        limiter.sent.push_back(t0 + Duration::from_secs(1));
        assert_eq!(limiter.delay_at(t0 + Duration::from_secs(10)), Duration::from_secs(50));
        assert_eq!(limiter.delay_at(t0 + Duration::from_secs(60)), Duration::ZERO);
        assert_eq!(limiter.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_min_delay() {
        let mut limiter = RateLimiter::new(100, Duration::from_secs(60), Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(limiter.sent.len(), 2);
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_for(0), Duration::from_millis(INITIAL_BACKOFF_MS));
        assert_eq!(backoff_for(2), Duration::from_millis(INITIAL_BACKOFF_MS * 4));
    }
}
