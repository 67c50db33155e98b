//! 지식베이스 공용 타입
//!
//! Source / Chunk 영속 모델과 검색 시 쓰이는 일시적 타입
//! (TimeRange, SearchFilter, ScoredResult, RetrievedChunk)을 정의합니다.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 청크/소스 메타데이터 (키 유일, 정렬 유지)
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ============================================================================
// User ID
// ============================================================================

/// 사용자 ID 검증
///
/// UUID 형식이 아니면 `None`을 반환합니다. 검색 경로에서는 이 결과를
/// 에러가 아닌 "빈 결과"로 취급합니다.
pub fn parse_user_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

/// 수집 경로용 사용자 ID 해석
///
/// UUID면 그대로, 아니면 DNS 네임스페이스 UUIDv5로 결정적으로 매핑합니다.
/// 같은 이름은 항상 같은 사용자로 해석됩니다.
pub fn resolve_user_id(raw: &str) -> Uuid {
    parse_user_id(raw).unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_DNS, raw.trim().as_bytes()))
}

// ============================================================================
// Source
// ============================================================================

/// 소스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// 직접 입력한 텍스트 노트
    Text,
    /// 파일 문서 (PDF, Markdown, 텍스트, HTML)
    Document,
    /// 웹 페이지
    Web,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Text => "text",
            SourceKind::Document => "document",
            SourceKind::Web => "web",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(SourceKind::Text),
            "document" => Ok(SourceKind::Document),
            "web" => Ok(SourceKind::Web),
            other => anyhow::bail!("Unknown source kind: {}", other),
        }
    }
}

/// 저장된 소스
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: SourceKind,
    pub name: String,
    pub url: Option<String>,
    pub ingested_at: DateTime<Utc>,
    /// 원본 생성 시각 (웹 게시일, 파일 수정 시각 등)
    pub source_timestamp: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl Source {
    /// 시간 필터에 쓰이는 유효 시각
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.source_timestamp.unwrap_or(self.ingested_at)
    }

    pub fn summary(&self) -> SourceSummary {
        SourceSummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            url: self.url.clone(),
        }
    }
}

/// 새 소스 입력용 구조체
#[derive(Debug, Clone)]
pub struct NewSource {
    pub user_id: Uuid,
    pub kind: SourceKind,
    pub name: String,
    pub url: Option<String>,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

/// 검색 결과에 붙는 소스 요약
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub id: Uuid,
    pub name: String,
    pub kind: SourceKind,
    pub url: Option<String>,
}

// ============================================================================
// Chunk
// ============================================================================

/// 청커가 만든 저장 전 청크
///
/// 오프셋 의미는 전략마다 다릅니다:
/// sentence/paragraph는 원문 기준 문자(char) 오프셋,
/// token-limit은 토큰 시퀀스 인덱스입니다.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub metadata: Metadata,
}

impl TextChunk {
    /// 소스에 귀속시켜 저장용 Chunk로 변환
    pub fn into_chunk(self, source_id: Uuid) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            source_id,
            chunk_index: self.chunk_index,
            text: self.text,
            token_count: self.token_count,
            start_char_offset: self.start_offset,
            end_char_offset: self.end_offset,
            metadata: self.metadata,
        }
    }
}

/// 저장된 청크 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub source_id: Uuid,
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    pub start_char_offset: usize,
    pub end_char_offset: usize,
    pub metadata: Metadata,
}

// ============================================================================
// Query-time Types
// ============================================================================

/// 포함 구간 시간 범위 (양 끝 선택)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: DateTime<Utc>) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    /// 시각이 범위 안에 있는지 (양 끝 포함)
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }

    /// 저장소 비교용 마이크로초 경계
    pub fn bounds_micros(&self) -> (Option<i64>, Option<i64>) {
        (
            self.start.map(|s| s.timestamp_micros()),
            self.end.map(|e| e.timestamp_micros()),
        )
    }
}

/// 호출자가 지정하는 추가 필터
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    /// 지정되면 쿼리에서 파싱한 시간 범위 대신 사용
    pub time_range: Option<TimeRange>,
    /// 비어있으면 모든 소스 종류
    pub source_kinds: Vec<SourceKind>,
}

/// 두 검색 백엔드가 공유하는 필터 (테넌트 + 시간 + 종류)
#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilter {
    pub user_id: Uuid,
    pub time_range: Option<TimeRange>,
    pub source_kinds: Vec<SourceKind>,
}

impl SearchFilter {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            time_range: None,
            source_kinds: Vec::new(),
        }
    }

    /// 페이로드가 필터를 만족하는지
    pub fn accepts(&self, user_id: Uuid, kind: SourceKind, timestamp: DateTime<Utc>) -> bool {
        user_id == self.user_id
            && (self.source_kinds.is_empty() || self.source_kinds.contains(&kind))
            && self.time_range.map_or(true, |r| r.contains(timestamp))
    }

    /// SQL `instr` 비교용 ",text,web," 형태 목록
    pub(crate) fn kinds_csv(&self) -> Option<String> {
        if self.source_kinds.is_empty() {
            return None;
        }
        let joined = self
            .source_kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Some(format!(",{},", joined))
    }
}

/// 백엔드 한 곳의 검색 히트
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredHit {
    pub chunk_id: Uuid,
    pub score: f32,
}

impl ScoredHit {
    pub fn new(chunk_id: Uuid, score: f32) -> Self {
        Self { chunk_id, score }
    }
}

/// 융합된 검색 결과 (한쪽 백엔드에서만 왔을 수 있음)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    pub chunk_id: Uuid,
    pub vector_score: Option<f32>,
    pub keyword_score: Option<f32>,
    pub combined_score: f32,
}

/// 최종 검색 결과 (청크 + 소스 요약 + 관련도)
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub source: SourceSummary,
    pub relevance_score: f32,
}

// ============================================================================
// Ingest Job
// ============================================================================

/// 수집 작업 상태 (queued → processing → completed | failed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed { error: String },
}

/// 허용되지 않는 상태 전이
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition: {from} -> {to}")]
pub struct JobTransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    /// 상태 전이 검증
    ///
    /// queued → processing, processing → completed | failed,
    /// queued → failed (처리 시작 전 실패)만 허용됩니다.
    pub fn transition(&self, next: JobStatus) -> Result<JobStatus, JobTransitionError> {
        let allowed = matches!(
            (self, &next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Failed { .. })
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed { .. })
        );

        if allowed {
            Ok(next)
        } else {
            Err(JobTransitionError {
                from: self.label(),
                to: next.label(),
            })
        }
    }

    pub(crate) fn from_parts(label: &str, error: Option<String>) -> anyhow::Result<Self> {
        match label {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed {
                error: error.unwrap_or_default(),
            }),
            other => anyhow::bail!("Unknown job status: {}", other),
        }
    }
}

/// 수집 작업 레코드
#[derive(Debug, Clone, Serialize)]
pub struct IngestJob {
    pub id: Uuid,
    pub source_id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================
