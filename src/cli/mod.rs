//! CLI 모듈
//!
//! palank-recall 명령어 정의 및 구현

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::collector::{CollectedFile, CollectionStats, CollectorConfig, FileCollector};
use crate::config::Settings;
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::extractor::extract_file;
use crate::knowledge::{
    resolve_user_id, ChunkStrategy, IngestContent, IngestJob, IngestRequest, Ingestor, JobStatus,
    KnowledgeBase, KnowledgeStore, QueryFilters, RetrievedChunk, SourceKind, TimeRange,
};
use crate::scraper::WebScraper;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "palank-recall")]
#[command(version, about = "개인 지식베이스 하이브리드 검색", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 텍스트, 파일, 폴더, 또는 URL을 지식베이스에 추가
    Ingest {
        /// 사용자 (UUID 또는 이름)
        #[arg(long)]
        user: String,

        /// 직접 입력할 텍스트
        #[arg(short, long, group = "input")]
        text: Option<String>,

        /// 수집할 파일 경로
        #[arg(long, group = "input")]
        file: Option<PathBuf>,

        /// 수집할 폴더 경로 (재귀)
        #[arg(short, long, group = "input")]
        dir: Option<PathBuf>,

        /// 수집할 URL
        #[arg(short, long, group = "input")]
        url: Option<String>,

        /// 소스 제목
        #[arg(long)]
        title: Option<String>,

        /// 청킹 전략 (sentence | paragraph | token)
        #[arg(short, long)]
        strategy: Option<String>,

        /// PDF 파일 건너뛰기 (--dir)
        #[arg(long)]
        skip_pdfs: bool,
    },

    /// 지식베이스 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 사용자 (UUID 또는 이름)
        #[arg(long)]
        user: String,

        /// 결과 개수 (기본: PALANK_RECALL_TOP_K)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 소스 종류 필터 (text | document | web, 반복 가능)
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// 이 날짜 이후 (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// 이 날짜 이전 (YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,

        /// JSON 출력
        #[arg(long)]
        json: bool,
    },

    /// 저장된 소스 목록
    Sources {
        #[arg(long)]
        user: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 소스 삭제 (청크, 벡터, 작업 기록 포함)
    Delete {
        #[arg(long)]
        user: String,

        /// 삭제할 소스 ID
        #[arg(long)]
        source: Uuid,
    },

    /// 수집 작업 목록
    Jobs {
        #[arg(long)]
        user: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env().context("설정 로드 실패")?;

    match cli.command {
        Commands::Ingest {
            user,
            text,
            file,
            dir,
            url,
            title,
            strategy,
            skip_pdfs,
        } => {
            let strategy = strategy.map(|s| s.parse::<ChunkStrategy>()).transpose()?;
            let target = IngestTarget::from_args(text, file, dir, url)?;
            cmd_ingest(&settings, &user, target, title, strategy, skip_pdfs).await
        }
        Commands::Query {
            query,
            user,
            top_k,
            kinds,
            since,
            until,
            json,
        } => {
            let filters = build_filters(&kinds, since.as_deref(), until.as_deref())?;
            let top_k = top_k.unwrap_or(settings.top_k);
            cmd_query(&settings, &query, &user, top_k, filters, json).await
        }
        Commands::Sources { user, limit } => cmd_sources(&settings, &user, limit),
        Commands::Delete { user, source } => cmd_delete(&settings, &user, source).await,
        Commands::Jobs { user, limit } => cmd_jobs(&settings, &user, limit),
        Commands::Status => cmd_status(&settings).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 수집 대상 (정확히 하나)
enum IngestTarget {
    Text(String),
    File(PathBuf),
    Dir(PathBuf),
    Url(String),
}

impl IngestTarget {
    fn from_args(
        text: Option<String>,
        file: Option<PathBuf>,
        dir: Option<PathBuf>,
        url: Option<String>,
    ) -> Result<Self> {
        match (text, file, dir, url) {
            (Some(text), None, None, None) => Ok(Self::Text(text)),
            (None, Some(file), None, None) => Ok(Self::File(file)),
            (None, None, Some(dir), None) => Ok(Self::Dir(dir)),
            (None, None, None, Some(url)) => Ok(Self::Url(url)),
            _ => bail!("--text, --file, --dir, --url 중 하나만 지정해야 합니다"),
        }
    }
}

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    settings: &Settings,
    user: &str,
    target: IngestTarget,
    title: Option<String>,
    strategy: Option<ChunkStrategy>,
    skip_pdfs: bool,
) -> Result<()> {
    let user_id = resolve_user_id(user);
    let kb = KnowledgeBase::open(settings).await?;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(create_embedder(settings)?);
    let ingestor = kb.ingestor(embedder)?;

    let request = match target {
        IngestTarget::Dir(dir) => {
            return ingest_directory(&ingestor, user_id, &dir, strategy, skip_pdfs).await;
        }
        IngestTarget::Text(text) => {
            IngestRequest::text(user_id, title.unwrap_or_else(|| "Text Note".to_string()), text)
        }
        IngestTarget::File(path) => {
            let collected = FileCollector::with_defaults()
                .collect_file(&path)?
                .ok_or_else(|| anyhow::anyhow!("지원하지 않는 파일이거나 크기 제한을 넘었습니다: {:?}", path))?;
            file_request(user_id, &collected, title).await?
        }
        IngestTarget::Url(url) => {
            println!("[*] URL 스크래핑 중: {}", url);
            let scraped = WebScraper::new()?.scrape(&url).await.context("URL 스크래핑 실패")?;

            let name = title
                .or_else(|| scraped.page.title.clone())
                .unwrap_or_else(|| url.clone());
            let mut request = IngestRequest::new(
                user_id,
                SourceKind::Web,
                name,
                IngestContent::Text(scraped.page.content.clone()),
            )
            .with_url(&url)
            .with_metadata(scraped.metadata());
            if let Some(published) = scraped.page.published_at {
                request = request.with_timestamp(published);
            }
            request
        }
    };

    let request = match strategy {
        Some(strategy) => request.with_strategy(strategy),
        None => request,
    };

    println!("[*] 청킹 및 임베딩 생성 중...");
    let (source, job) = ingestor.ingest(request).await.context("문서 추가 실패")?;
    report_job(&source.name, source.id, &job);

    if matches!(job.status, JobStatus::Failed { .. }) {
        bail!("수집에 실패했습니다");
    }
    Ok(())
}

/// 폴더 수집
async fn ingest_directory(
    ingestor: &Ingestor,
    user_id: Uuid,
    dir: &std::path::Path,
    strategy: Option<ChunkStrategy>,
    skip_pdfs: bool,
) -> Result<()> {
    let collector = FileCollector::new(CollectorConfig {
        skip_pdfs,
        ..Default::default()
    });
    let files = collector.collect_directory(dir)?;

    if files.is_empty() {
        println!("[!] 수집할 파일이 없습니다.");
        return Ok(());
    }

    let stats = CollectionStats::from_files(&files);
    println!("[*] 수집 대상: {} 파일", stats.total_files);
    println!(
        "    텍스트: {}, 마크다운: {}, HTML: {}, PDF: {}",
        stats.text_files, stats.markdown_files, stats.html_files, stats.pdf_files
    );
    println!("    총 크기: {}", format_bytes(stats.total_size as usize));
    println!();

    let mut success_count = 0;
    let mut error_count = 0;

    for (i, file) in files.iter().enumerate() {
        print!("[{}/{}] [{}] {}... ", i + 1, files.len(), file.format, file.file_name());

        let request = match file_request(user_id, file, None).await {
            Ok(request) => request,
            Err(e) => {
                println!("건너뜀: {}", e);
                error_count += 1;
                continue;
            }
        };
        let request = match strategy {
            Some(strategy) => request.with_strategy(strategy),
            None => request,
        };

        match ingestor.ingest(request).await {
            Ok((_, job)) if job.status == JobStatus::Completed => {
                println!("완료 ({} 청크)", job.chunk_count);
                success_count += 1;
            }
            Ok((_, job)) => {
                println!("실패 (작업 {})", job.id);
                error_count += 1;
            }
            Err(e) => {
                tracing::error!("Failed to ingest {:?}: {:#}", file.path, e);
                println!("실패");
                error_count += 1;
            }
        }
    }

    println!();
    println!("[OK] 완료: 성공 {}, 실패 {}", success_count, error_count);
    Ok(())
}

/// 파일 → 문서 수집 요청
async fn file_request(user_id: Uuid, file: &CollectedFile, title: Option<String>) -> Result<IngestRequest> {
    let doc = extract_file(&file.path).await?;

    let name = title
        .or_else(|| doc.title.clone())
        .unwrap_or_else(|| file.file_name().to_string());
    let timestamp = doc.published_at.or(file.modified_at);
    let mut metadata = doc.metadata.clone();
    metadata.insert("path".to_string(), file.path.display().to_string().into());

    let mut request = IngestRequest::new(user_id, SourceKind::Document, name, doc.into_content())
        .with_metadata(metadata);
    if let Some(ts) = timestamp {
        request = request.with_timestamp(ts);
    }
    Ok(request)
}

fn report_job(name: &str, source_id: Uuid, job: &IngestJob) {
    match &job.status {
        JobStatus::Completed => {
            println!("[OK] 소스가 추가되었습니다: {}", name);
            println!("     소스 ID: {}", source_id);
            println!("     청크: {}", job.chunk_count);
        }
        JobStatus::Failed { error } => {
            println!("[!] 수집 실패: {}", name);
            println!("    작업 ID: {}", job.id);
            println!("    원인: {}", error);
        }
        other => println!("[*] 작업 {}: {}", job.id, other.label()),
    }
}

/// 검색 명령어 (query)
async fn cmd_query(
    settings: &Settings,
    query: &str,
    user: &str,
    top_k: usize,
    filters: QueryFilters,
    json: bool,
) -> Result<()> {
    let kb = KnowledgeBase::open(settings).await?;
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(create_embedder(settings)?);
    let retriever = kb.retriever(embedder);
    let user_id = resolve_user_id(user).to_string();

    if !json {
        println!("[*] 검색 중: \"{}\"", query);
    }

    let results = match retriever.retrieve(query, &user_id, top_k, Some(&filters)).await {
        Ok(results) => results,
        Err(e) if e.is_cancellation() => {
            tracing::warn!("Retrieval cancelled: {}", e);
            bail!("검색 시간이 초과되었습니다. PALANK_RECALL_QUERY_TIMEOUT_SECS를 늘려 다시 시도해 주세요.");
        }
        Err(e) => {
            tracing::error!("Retrieval failed: {}", e);
            bail!("검색 중 오류가 발생했습니다. 잠시 후 다시 시도해 주세요.");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("\n[!] 관련 정보를 찾지 못했습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }

    Ok(())
}

fn print_result(rank: usize, result: &RetrievedChunk) {
    println!(
        "{}. [{}] [점수: {:.4}] {}",
        rank, result.source.kind, result.relevance_score, result.source.name
    );
    if let Some(ref url) = result.source.url {
        println!("   URL: {}", url);
    }
    if let Some(page) = result.chunk.metadata.get("page_number") {
        println!("   페이지: {}", page);
    }
    println!("   내용: {}", truncate_text(&result.chunk.text, 200));
    println!();
}

/// 소스 목록 명령어 (sources)
fn cmd_sources(settings: &Settings, user: &str, limit: usize) -> Result<()> {
    let store = KnowledgeStore::open(&settings.db_path()).context("KnowledgeStore 열기 실패")?;
    let sources = store
        .list_sources(resolve_user_id(user), limit)
        .context("소스 목록 조회 실패")?;

    if sources.is_empty() {
        println!("[!] 저장된 소스가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 소스 ({} 건):\n", sources.len());
    for source in sources {
        println!("  {} [{}] {}", source.id, source.kind, truncate_text(&source.name, 50));
        if let Some(ref url) = source.url {
            println!("        URL: {}", url);
        }
        println!(
            "        수집: {} | 기준 시각: {}",
            source.ingested_at.format("%Y-%m-%d %H:%M"),
            source.effective_timestamp().format("%Y-%m-%d %H:%M")
        );
        println!();
    }

    Ok(())
}

/// 삭제 명령어 (delete)
async fn cmd_delete(settings: &Settings, user: &str, source_id: Uuid) -> Result<()> {
    let kb = KnowledgeBase::open(settings).await?;

    if kb.delete_source(source_id, resolve_user_id(user)).await? {
        println!("[OK] 소스 {} 삭제됨 (청크, 벡터 포함)", source_id);
    } else {
        println!("[!] 삭제할 소스를 찾을 수 없습니다: {}", source_id);
    }

    Ok(())
}

/// 작업 목록 명령어 (jobs)
fn cmd_jobs(settings: &Settings, user: &str, limit: usize) -> Result<()> {
    let store = KnowledgeStore::open(&settings.db_path()).context("KnowledgeStore 열기 실패")?;
    let jobs = store.list_jobs(resolve_user_id(user), limit)?;

    if jobs.is_empty() {
        println!("[!] 수집 작업이 없습니다.");
        return Ok(());
    }

    for job in jobs {
        println!(
            "  {} [{:<10}] {} 청크 | 소스 {} | {}",
            job.id,
            job.status.label(),
            job.chunk_count,
            job.source_id,
            job.updated_at.format("%Y-%m-%d %H:%M")
        );
        if let JobStatus::Failed { ref error } = job.status {
            println!("        원인: {}", truncate_text(error, 120));
        }
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(settings: &Settings) -> Result<()> {
    println!("palank-recall v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 데이터 디렉토리: {}", settings.data_dir.display());

    if settings.api_key.is_some() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match KnowledgeBase::open(settings).await {
        Ok(kb) => match kb.status().await {
            Ok(status) => {
                println!("[OK] 소스: {} 건, 청크: {} 건", status.store.source_count, status.store.chunk_count);
                println!("     총 텍스트: {}", format_bytes(status.store.total_text_bytes));
                println!(
                    "     벡터 인덱스: {} ({} 벡터, {} 차원)",
                    status.vector_backend, status.vector_count, status.embedding_dimension
                );
                println!(
                    "     키워드 검색: {}",
                    if status.store.fts_enabled { "FTS5" } else { "LIKE" }
                );
                println!("     토큰 카운터: {}", status.token_counter);
                if status.store.pending_jobs > 0 || status.store.failed_jobs > 0 {
                    println!(
                        "[!] 진행 중 작업: {}, 실패 작업: {}",
                        status.store.pending_jobs, status.store.failed_jobs
                    );
                }
            }
            Err(e) => println!("[!] 통계 조회 실패: {}", e),
        },
        Err(e) => println!("[!] 지식베이스 열기 실패: {:#}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// --kind / --since / --until → QueryFilters
fn build_filters(kinds: &[String], since: Option<&str>, until: Option<&str>) -> Result<QueryFilters> {
    let source_kinds = kinds
        .iter()
        .map(|k| k.parse::<SourceKind>())
        .collect::<Result<Vec<_>>>()?;

    let start = since.map(|s| parse_day(s, false)).transpose()?;
    let end = until.map(|s| parse_day(s, true)).transpose()?;
    let time_range = match (start, end) {
        (None, None) => None,
        (start, end) => Some(TimeRange { start, end }),
    };

    Ok(QueryFilters {
        time_range,
        source_kinds,
    })
}

/// YYYY-MM-DD → 그날 시작 또는 끝 (UTC)
fn parse_day(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("날짜 형식이 잘못되었습니다 (YYYY-MM-DD): {}", raw))?;
    let time = if end_of_day {
        date.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| anyhow::anyhow!("Invalid date: {}", raw))
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
