//! Knowledge Store - rusqlite 기반 소스/청크 저장소 + 키워드 인덱스
//!
//! 소스, 청크, 수집 작업을 SQLite에 저장하고
//! FTS5(BM25)로 청크 키워드 검색을 제공합니다.
//! FTS5를 쓸 수 없는 빌드에서는 LIKE 매칭으로 폴백합니다.
//! 저장 위치: ~/.palank-recall/knowledge.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use super::types::{
    Chunk, IngestJob, JobStatus, Metadata, NewSource, ScoredHit, SearchFilter, Source, SourceKind,
};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.palank-recall/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".palank-recall")
}

// ============================================================================
// Index Traits
// ============================================================================

/// 키워드 인덱스 트레이트 (async)
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// 쿼리 용어 매칭 검색, 점수 내림차순
    async fn search(&self, query: &str, filter: &SearchFilter, limit: usize) -> Result<Vec<ScoredHit>>;
}

/// 청크 하이드레이션 트레이트 (async)
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// `user_id` 소유 소스의 청크만 반환 (순서 보장 없음)
    async fn fetch(&self, chunk_ids: &[Uuid], user_id: Uuid) -> Result<Vec<(Chunk, Source)>>;
}

// ============================================================================
// Types
// ============================================================================

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub source_count: usize,
    pub chunk_count: usize,
    pub pending_jobs: usize,
    pub failed_jobs: usize,
    pub total_text_bytes: usize,
    pub fts_enabled: bool,
    pub db_path: PathBuf,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 동기 저장소
///
/// 커넥션은 `Arc<Mutex<_>>`로 공유되므로 clone은 같은 DB를 가리킵니다.
/// async 트레이트 구현은 `spawn_blocking`으로 이 동기 API를 호출합니다.
#[derive(Clone)]
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    fts_enabled: bool,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        // 부모 디렉토리 생성
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let fts_enabled = initialize(&conn)?;
        tracing::debug!("Knowledge store initialized at {:?} (fts5: {})", path, fts_enabled);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
            fts_enabled,
        })
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    /// 소스 생성
    pub fn create_source(&self, new: NewSource) -> Result<Source> {
        let source = Source {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            kind: new.kind,
            name: new.name,
            url: new.url,
            ingested_at: now_micros(),
            source_timestamp: new.source_timestamp,
            metadata: new.metadata,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sources (id, user_id, source_type, name, url, ingested_at, source_timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                source.id.to_string(),
                source.user_id.to_string(),
                source.kind.as_str(),
                source.name,
                source.url,
                source.ingested_at.timestamp_micros(),
                source.source_timestamp.map(|t| t.timestamp_micros()),
                serde_json::to_string(&source.metadata)?,
            ],
        )
        .context("Failed to insert source")?;

        tracing::info!("Added source: {} ({}, id={})", source.name, source.kind, source.id);
        Ok(source)
    }

    /// 사용자 소유 소스 조회
    pub fn get_source(&self, id: Uuid, user_id: Uuid) -> Result<Option<Source>> {
        let conn = self.lock()?;
        let source = conn
            .query_row(
                &format!("SELECT {} FROM sources s WHERE s.id = ?1 AND s.user_id = ?2", SOURCE_COLUMNS),
                params![id.to_string(), user_id.to_string()],
                |row| source_from_row(row, 0),
            )
            .optional()
            .context("Failed to load source")?;

        Ok(source)
    }

    /// 사용자 소스 목록 (최근 수집 순)
    pub fn list_sources(&self, user_id: Uuid, limit: usize) -> Result<Vec<Source>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sources s WHERE s.user_id = ?1 ORDER BY s.ingested_at DESC LIMIT ?2",
            SOURCE_COLUMNS
        ))?;

        let sources = stmt
            .query_map(params![user_id.to_string(), limit as i64], |row| source_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list sources")?;

        Ok(sources)
    }

    /// 소스 삭제 (청크, 작업 레코드 cascade)
    pub fn delete_source(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "DELETE FROM sources WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id.to_string()],
            )
            .context("Failed to delete source")?;

        Ok(rows > 0)
    }

    // ------------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------------

    /// 청크 일괄 저장 (하나의 트랜잭션)
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, source_id, chunk_index, text, token_count, start_offset, end_offset, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for chunk in chunks {
                stmt.execute(params![
                    chunk.id.to_string(),
                    chunk.source_id.to_string(),
                    chunk.chunk_index as i64,
                    chunk.text,
                    chunk.token_count as i64,
                    chunk.start_char_offset as i64,
                    chunk.end_char_offset as i64,
                    serde_json::to_string(&chunk.metadata)?,
                ])
                .with_context(|| format!("Failed to insert chunk {}", chunk.chunk_index))?;
            }
        }

        tx.commit().context("Failed to commit chunks")?;
        Ok(chunks.len())
    }

    /// 소스의 청크 목록 (chunk_index 순)
    pub fn list_chunks(&self, source_id: Uuid) -> Result<Vec<Chunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chunks c WHERE c.source_id = ?1 ORDER BY c.chunk_index",
            CHUNK_COLUMNS
        ))?;

        let chunks = stmt
            .query_map(params![source_id.to_string()], |row| chunk_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list chunks")?;

        Ok(chunks)
    }

    /// 청크 + 소스 하이드레이션 (사용자 소유분만)
    pub fn fetch_chunks(&self, chunk_ids: &[Uuid], user_id: Uuid) -> Result<Vec<(Chunk, Source)>> {
        if chunk_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let sql = format!(
            "SELECT {}, {} FROM chunks c
             JOIN sources s ON s.id = c.source_id
             WHERE s.user_id = ? AND c.id IN ({})",
            CHUNK_COLUMNS, SOURCE_COLUMNS, placeholders
        );

        let mut values = vec![Value::Text(user_id.to_string())];
        values.extend(chunk_ids.iter().map(|id| Value::Text(id.to_string())));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((chunk_from_row(row, 0)?, source_from_row(row, CHUNK_COLUMN_COUNT)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to fetch chunks")?;

        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Keyword Search
    // ------------------------------------------------------------------------

    /// 키워드 검색 (FTS5 BM25, 불가 시 LIKE 폴백)
    pub fn search_keywords(&self, query: &str, filter: &SearchFilter, limit: usize) -> Result<Vec<ScoredHit>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        if self.fts_enabled {
            self.search_fts(query, filter, limit)
        } else {
            self.search_like(query, filter, limit)
        }
    }

    /// FTS5 키워드 검색
    ///
    /// 용어를 OR로 묶어 매칭하고, 점수는 `-bm25`(클수록 관련)입니다.
    /// source: https://www.sqlite.org/fts5.html#the_bm25_function
    fn search_fts(&self, query: &str, filter: &SearchFilter, limit: usize) -> Result<Vec<ScoredHit>> {
        let fts_query = build_fts5_query(query);
        if fts_query.is_empty() {
            return Ok(vec![]);
        }

        let mut values = filter_values(filter);
        values.push(Value::Text(fts_query));
        values.push(Value::Integer(limit as i64));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT c.id, -bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks c ON c.seq = chunks_fts.rowid
            JOIN sources s ON s.id = c.source_id
            WHERE chunks_fts MATCH ?5
              AND {}
            ORDER BY bm25(chunks_fts), c.seq
            LIMIT ?6
            "#,
            FILTER_SQL
        ))?;

        let hits = stmt
            .query_map(params_from_iter(values), |row| {
                let id = parse_uuid(row, 0)?;
                let score: f64 = row.get(1)?;
                Ok(ScoredHit::new(id, score as f32))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("FTS5 search failed")?;

        Ok(hits)
    }

    /// LIKE 키워드 검색 (FTS5 사용 불가 시 폴백)
    ///
    /// 점수는 매칭된 용어 비율(0.0 ~ 1.0)입니다.
    /// SQLite의 `LIKE`와 `LOWER()`는 ASCII 대소문자만 접습니다.
    /// 그래서 SQL 조건은 후보를 고르는 데만 쓰고, 매칭 판정은 Rust `to_lowercase()`로
    /// 양쪽을 접어서 합니다. 용어에 비ASCII 문자가 있으면 SQL 조건 없이
    /// 필터 범위의 청크 전체를 후보로 봅니다.
    pub(crate) fn search_like(&self, query: &str, filter: &SearchFilter, limit: usize) -> Result<Vec<ScoredHit>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(vec![]);
        }

        let prefilter = terms.iter().all(|t| t.is_ascii());
        let like_clause = if prefilter {
            format!(" AND ({})", vec!["c.text LIKE ? ESCAPE '\\'"; terms.len()].join(" OR "))
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT c.id, c.text FROM chunks c
             JOIN sources s ON s.id = c.source_id
             WHERE {}{}
             ORDER BY c.seq",
            FILTER_SQL, like_clause
        );

        let mut values = filter_values(filter);
        if prefilter {
            values.extend(terms.iter().map(|t| Value::Text(format!("%{}%", escape_like(t)))));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((parse_uuid(row, 0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("LIKE search failed")?;

        let mut hits: Vec<ScoredHit> = rows
            .into_iter()
            .filter_map(|(id, text)| {
                let folded = text.to_lowercase();
                let matched = terms.iter().filter(|t| folded.contains(t.as_str())).count();
                (matched > 0).then(|| ScoredHit::new(id, matched as f32 / terms.len() as f32))
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);

        Ok(hits)
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// 수집 작업 생성 (queued)
    pub fn create_job(&self, source_id: Uuid, user_id: Uuid) -> Result<IngestJob> {
        let now = now_micros();
        let job = IngestJob {
            id: Uuid::new_v4(),
            source_id,
            user_id,
            status: JobStatus::Queued,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, source_id, user_id, status, error, chunk_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?5)",
            params![
                job.id.to_string(),
                source_id.to_string(),
                user_id.to_string(),
                job.status.label(),
                now.timestamp_micros(),
            ],
        )
        .context("Failed to insert job")?;

        Ok(job)
    }

    /// 작업 상태 전이 (허용되지 않는 전이는 에러)
    pub fn update_job(&self, job_id: Uuid, next: JobStatus, chunk_count: usize) -> Result<IngestJob> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM jobs j WHERE j.id = ?1", JOB_COLUMNS),
                params![job_id.to_string()],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("Job not found: {}", job_id))?;

        let status = current.status.transition(next)?;
        let updated_at = now_micros();
        let error = match &status {
            JobStatus::Failed { error } => Some(error.clone()),
            _ => None,
        };

        tx.execute(
            "UPDATE jobs SET status = ?1, error = ?2, chunk_count = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                status.label(),
                error,
                chunk_count as i64,
                updated_at.timestamp_micros(),
                job_id.to_string(),
            ],
        )?;
        tx.commit()?;

        Ok(IngestJob {
            status,
            chunk_count,
            updated_at,
            ..current
        })
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs j WHERE j.id = ?1", JOB_COLUMNS),
                params![job_id.to_string()],
                job_from_row,
            )
            .optional()?;

        Ok(job)
    }

    /// 사용자 작업 목록 (최근 순)
    pub fn list_jobs(&self, user_id: Uuid, limit: usize) -> Result<Vec<IngestJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs j WHERE j.user_id = ?1 ORDER BY j.created_at DESC LIMIT ?2",
            JOB_COLUMNS
        ))?;

        let jobs = stmt
            .query_map(params![user_id.to_string(), limit as i64], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list jobs")?;

        Ok(jobs)
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            source_count: count("SELECT COUNT(*) FROM sources")?,
            chunk_count: count("SELECT COUNT(*) FROM chunks")?,
            pending_jobs: count("SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'processing')")?,
            failed_jobs: count("SELECT COUNT(*) FROM jobs WHERE status = 'failed'")?,
            total_text_bytes: count("SELECT COALESCE(SUM(LENGTH(CAST(text AS BLOB))), 0) FROM chunks")?,
            fts_enabled: self.fts_enabled,
            db_path: self.db_path.clone(),
        })
    }
}

#[async_trait]
impl KeywordIndex for KnowledgeStore {
    async fn search(&self, query: &str, filter: &SearchFilter, limit: usize) -> Result<Vec<ScoredHit>> {
        let store = self.clone();
        let query = query.to_string();
        let filter = filter.clone();

        tokio::task::spawn_blocking(move || store.search_keywords(&query, &filter, limit))
            .await
            .context("Keyword search task failed")?
    }
}

#[async_trait]
impl ChunkStore for KnowledgeStore {
    async fn fetch(&self, chunk_ids: &[Uuid], user_id: Uuid) -> Result<Vec<(Chunk, Source)>> {
        let store = self.clone();
        let ids = chunk_ids.to_vec();

        tokio::task::spawn_blocking(move || store.fetch_chunks(&ids, user_id))
            .await
            .context("Chunk fetch task failed")?
    }
}

// ============================================================================
// Schema
// ============================================================================

/// 스키마 초기화, FTS5 사용 가능 여부 반환
fn initialize(conn: &Connection) -> Result<bool> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("Failed to enable foreign keys")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            name TEXT NOT NULL,
            url TEXT,
            ingested_at INTEGER NOT NULL,
            source_timestamp INTEGER,
            metadata TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_sources_user ON sources(user_id);

        CREATE TABLE IF NOT EXISTS chunks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source_id, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_id);

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id);
        "#,
    )
    .context("Failed to create tables")?;

    // FTS5 가상 테이블 (키워드 검색용)
    // source: https://www.sqlite.org/fts5.html
    let fts_result = conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            content=chunks,
            content_rowid=seq
        )",
        [],
    );

    if let Err(e) = fts_result {
        tracing::warn!("FTS5 not available, keyword search uses LIKE matching: {}", e);
        return Ok(false);
    }

    // FTS5 동기화 트리거 (청크는 생성 후 불변이므로 insert/delete만)
    conn.execute_batch(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, text) VALUES (new.seq, new.text);
        END;

        CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES('delete', old.seq, old.text);
        END;
        "#,
    )
    .context("Failed to create FTS5 triggers")?;

    Ok(true)
}

// ============================================================================
// Row Mapping
// ============================================================================

const SOURCE_COLUMNS: &str =
    "s.id, s.user_id, s.source_type, s.name, s.url, s.ingested_at, s.source_timestamp, s.metadata";

const CHUNK_COLUMNS: &str =
    "c.id, c.source_id, c.chunk_index, c.text, c.token_count, c.start_offset, c.end_offset, c.metadata";
const CHUNK_COLUMN_COUNT: usize = 8;

const JOB_COLUMNS: &str =
    "j.id, j.source_id, j.user_id, j.status, j.error, j.chunk_count, j.created_at, j.updated_at";

/// 사용자/시간/종류 필터 (?1 ~ ?4, 값은 `filter_values`)
///
/// 시간 비교는 유효 시각 `COALESCE(source_timestamp, ingested_at)` 기준입니다.
const FILTER_SQL: &str = "s.user_id = ?1
    AND (?2 IS NULL OR COALESCE(s.source_timestamp, s.ingested_at) >= ?2)
    AND (?3 IS NULL OR COALESCE(s.source_timestamp, s.ingested_at) <= ?3)
    AND (?4 IS NULL OR instr(?4, ',' || s.source_type || ',') > 0)";

fn filter_values(filter: &SearchFilter) -> Vec<Value> {
    let (start, end) = filter
        .time_range
        .map(|r| r.bounds_micros())
        .unwrap_or((None, None));

    vec![
        Value::Text(filter.user_id.to_string()),
        start.map(Value::Integer).unwrap_or(Value::Null),
        end.map(Value::Integer).unwrap_or(Value::Null),
        filter.kinds_csv().map(Value::Text).unwrap_or(Value::Null),
    ]
}

fn source_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Source> {
    let kind: String = row.get(offset + 2)?;
    Ok(Source {
        id: parse_uuid(row, offset)?,
        user_id: parse_uuid(row, offset + 1)?,
        kind: kind
            .parse::<SourceKind>()
            .map_err(|e| conversion_error(offset + 2, e.into()))?,
        name: row.get(offset + 3)?,
        url: row.get(offset + 4)?,
        ingested_at: parse_micros(row, offset + 5)?,
        source_timestamp: match row.get::<_, Option<i64>>(offset + 6)? {
            Some(_) => Some(parse_micros(row, offset + 6)?),
            None => None,
        },
        metadata: parse_metadata(row, offset + 7)?,
    })
}

fn chunk_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: parse_uuid(row, offset)?,
        source_id: parse_uuid(row, offset + 1)?,
        chunk_index: row.get::<_, i64>(offset + 2)? as usize,
        text: row.get(offset + 3)?,
        token_count: row.get::<_, i64>(offset + 4)? as usize,
        start_char_offset: row.get::<_, i64>(offset + 5)? as usize,
        end_char_offset: row.get::<_, i64>(offset + 6)? as usize,
        metadata: parse_metadata(row, offset + 7)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<IngestJob> {
    let label: String = row.get(3)?;
    let status = JobStatus::from_parts(&label, row.get(4)?).map_err(|e| conversion_error(3, e.into()))?;

    Ok(IngestJob {
        id: parse_uuid(row, 0)?,
        source_id: parse_uuid(row, 1)?,
        user_id: parse_uuid(row, 2)?,
        status,
        chunk_count: row.get::<_, i64>(5)? as usize,
        created_at: parse_micros(row, 6)?,
        updated_at: parse_micros(row, 7)?,
    })
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, Box::new(e)))
}

fn parse_micros(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {}", micros).into()))
}

fn parse_metadata(row: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Box::new(e)))
}

fn conversion_error(idx: usize, err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 마이크로초 정밀도의 현재 시각 (DB 왕복 후에도 같은 값)
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// 쿼리에서 검색 용어 추출 (소문자, 중복 제거, 순서 유지)
fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();

    for word in query.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        let word = word.to_lowercase();
        if !word.is_empty() && !terms.contains(&word) {
            terms.push(word);
        }
    }

    terms
}

/// FTS5 쿼리 생성
///
/// 각 용어를 따옴표로 감싸 문법 문자를 무력화하고 OR로 묶습니다.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn build_fts5_query(query: &str) -> String {
    query_terms(query)
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// LIKE 패턴 이스케이프 (ESCAPE '\')
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
