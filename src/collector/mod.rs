//! 파일 수집 모듈
//!
//! 로컬 파일 및 폴더에서 수집 대상 문서를 고릅니다.
//! .gitignore 패턴을 존중하고, 지원하는 형식만 수집합니다.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;

use crate::extractor::DocumentFormat;

// ============================================================================
// Collected File
// ============================================================================

/// 수집된 파일 정보
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// 파일 절대 경로
    pub path: PathBuf,
    pub format: DocumentFormat,
    /// 파일 크기 (바이트)
    pub size: u64,
    /// 수정 시각 (소스 시각으로 사용)
    pub modified_at: Option<DateTime<Utc>>,
}

impl CollectedFile {
    /// 파일에서 CollectedFile 생성 (지원하지 않는 형식이면 None)
    pub fn from_path(path: PathBuf) -> Result<Option<Self>> {
        let Ok(format) = DocumentFormat::from_path(&path) else {
            return Ok(None);
        };

        let metadata = std::fs::metadata(&path).with_context(|| format!("Cannot stat {:?}", path))?;

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path,
            format,
            size: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        }))
    }

    /// 표시용 파일 이름
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
    }
}

// ============================================================================
// File Collector
// ============================================================================

/// 기본 파일 크기 상한 (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 << 20;

/// 파일 수집기 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// .gitignore / .ignore 파일 적용
    pub respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    pub include_hidden: bool,
    /// 파일 크기 상한 (바이트), 0은 무제한
    pub max_file_size: u64,
    /// 허용 확장자, 비어있으면 지원 형식 전부
    pub extensions: Vec<String>,
    /// PDF 파일 건너뛰기
    pub skip_pdfs: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            extensions: vec![],
            skip_pdfs: false,
        }
    }
}

/// 파일 수집기
pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// 단일 파일 수집
    ///
    /// 지원하지 않는 형식이거나 필터에 걸리면 `None`입니다.
    pub fn collect_file(&self, path: &Path) -> Result<Option<CollectedFile>> {
        let path = existing(path, EntryKind::File)?;
        Ok(CollectedFile::from_path(path)?.filter(|file| self.accepts(file)))
    }

    /// 폴더 재귀 수집 (경로 순 정렬)
    ///
    /// 읽을 수 없는 항목은 경고만 남기고 건너뜁니다.
    pub fn collect_directory(&self, path: &Path) -> Result<Vec<CollectedFile>> {
        let root = existing(path, EntryKind::Dir)?;
        let use_ignore_files = self.config.respect_gitignore;

        let mut files: Vec<CollectedFile> = WalkBuilder::new(&root)
            .hidden(!self.config.include_hidden)
            .ignore(use_ignore_files)
            .git_ignore(use_ignore_files)
            .git_global(use_ignore_files)
            .git_exclude(use_ignore_files)
            .require_git(false)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_some_and(|ft| ft.is_file()) => Some(entry.into_path()),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter_map(|path| match CollectedFile::from_path(path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("Skipping file: {:#}", e);
                    None
                }
            })
            .filter(|file| self.accepts(file))
            .collect();

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!("{} ingestible files under {:?}", files.len(), root);
        Ok(files)
    }

    /// 크기, PDF 제외, 확장자 필터
    fn accepts(&self, file: &CollectedFile) -> bool {
        let config = &self.config;

        if config.max_file_size > 0 && file.size > config.max_file_size {
            tracing::debug!("Too large ({} bytes): {:?}", file.size, file.path);
            return false;
        }
        if config.skip_pdfs && file.format == DocumentFormat::Pdf {
            return false;
        }
        if config.extensions.is_empty() {
            return true;
        }

        file.path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| config.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
}

/// 절대 경로로 바꾸고 존재/종류 확인
fn existing(path: &Path, kind: EntryKind) -> Result<PathBuf> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to resolve current directory")?
            .join(path)
    };

    match (kind, path.is_file(), path.is_dir()) {
        (EntryKind::File, true, _) | (EntryKind::Dir, _, true) => Ok(path),
        (_, false, false) => anyhow::bail!("{:?} does not exist", path),
        (EntryKind::File, _, _) => anyhow::bail!("{:?} is a directory, expected a file", path),
        (EntryKind::Dir, _, _) => anyhow::bail!("{:?} is a file, expected a directory", path),
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// 수집 통계
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub total_files: usize,
    pub text_files: usize,
    pub markdown_files: usize,
    pub html_files: usize,
    pub pdf_files: usize,
    pub total_size: u64,
}

impl CollectionStats {
    pub fn from_files(files: &[CollectedFile]) -> Self {
        let mut stats = Self::default();

        for file in files {
            stats.total_files += 1;
            stats.total_size += file.size;

            match file.format {
                DocumentFormat::PlainText => stats.text_files += 1,
                DocumentFormat::Markdown => stats.markdown_files += 1,
                DocumentFormat::Html => stats.html_files += 1,
                DocumentFormat::Pdf => stats.pdf_files += 1,
            }
        }

        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
