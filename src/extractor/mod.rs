//! 콘텐츠 추출 모듈
//!
//! 파일 확장자로 형식을 고르고 텍스트를 뽑습니다.
//! - PDF: pdf-extract, 페이지 단위
//! - Markdown / 일반 텍스트: UTF-8 (실패 시 Latin-1) 디코딩
//! - HTML: 스크래퍼와 같은 블록 단위 본문 추출
//!
//! 지원하지 않는 확장자는 `ExtractError::UnsupportedFormat`입니다.

pub mod pdf;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::knowledge::{IngestContent, Metadata};
use crate::scraper::parse_html;

// ============================================================================
// Document Format
// ============================================================================

/// 지원하는 문서 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Pdf,
    Markdown,
    PlainText,
    Html,
}

impl DocumentFormat {
    /// 확장자로 형식 결정 (대소문자 무시)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "md" | "markdown" | "mdx" => Some(DocumentFormat::Markdown),
            "html" | "htm" | "xhtml" => Some(DocumentFormat::Html),
            "txt" | "text" | "log" | "rst" | "csv" | "json" | "toml" | "yaml" | "yml" | "xml"
            | "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "c" | "cpp" | "h"
            | "hpp" | "sh" | "sql" => Some(DocumentFormat::PlainText),
            _ => None,
        }
    }

    /// 파일 경로에서 형식 결정
    pub fn from_path(path: &Path) -> Result<Self, ExtractError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| ExtractError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: ext.to_string(),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::PlainText => "text",
            DocumentFormat::Html => "html",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// 추출 실패
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported format '{extension}': {path}")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract PDF text from {path}: {message}")]
    Pdf { path: PathBuf, message: String },

    #[error("no extractable text in {path}")]
    Empty { path: PathBuf },
}

// ============================================================================
// Extracted Document
// ============================================================================

/// 추출된 문서
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub format: DocumentFormat,
    pub title: Option<String>,
    /// (페이지 번호, 텍스트). PDF 외에는 페이지 1개
    pub pages: Vec<(usize, String)>,
    /// HTML 게시일 등 문서가 스스로 밝힌 시각
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl ExtractedDocument {
    /// 수집 본문으로 변환 (PDF만 페이지 유지)
    pub fn into_content(self) -> IngestContent {
        match self.format {
            DocumentFormat::Pdf => IngestContent::Pages(self.pages),
            _ => IngestContent::Text(
                self.pages
                    .into_iter()
                    .map(|(_, text)| text)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        }
    }

    pub fn char_count(&self) -> usize {
        self.pages.iter().map(|(_, t)| t.chars().count()).sum()
    }
}

/// 파일에서 문서 추출
///
/// 읽기와 PDF 파싱은 blocking 스레드에서 실행합니다.
pub async fn extract_file(path: &Path) -> Result<ExtractedDocument, ExtractError> {
    let format = DocumentFormat::from_path(path)?;
    let owned = path.to_path_buf();

    let result = tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&owned).map_err(|source| ExtractError::Io {
            path: owned.clone(),
            source,
        })?;
        extract_bytes(&owned, &bytes, format)
    })
    .await;

    match result {
        Ok(extracted) => extracted,
        Err(join) => Err(ExtractError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, join),
        }),
    }
}

/// 메모리의 바이트에서 문서 추출 (`path`는 에러/제목용)
pub fn extract_bytes(path: &Path, bytes: &[u8], format: DocumentFormat) -> Result<ExtractedDocument, ExtractError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string);

    let mut metadata = Metadata::new();
    metadata.insert("format".to_string(), format.as_str().into());
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        metadata.insert("filename".to_string(), name.into());
    }

    let (title, pages, published_at) = match format {
        DocumentFormat::Pdf => {
            let pages = pdf::extract_pages(bytes).map_err(|e| ExtractError::Pdf {
                path: path.to_path_buf(),
                message: format!("{:#}", e),
            })?;
            metadata.insert("total_pages".to_string(), pages.len().into());
            (stem, pages, None)
        }
        DocumentFormat::Markdown => {
            let text = decode_text(bytes);
            let title = markdown_title(&text).or(stem);
            (title, vec![(1, text)], None)
        }
        DocumentFormat::PlainText => (stem, vec![(1, decode_text(bytes))], None),
        DocumentFormat::Html => {
            let page = parse_html(&decode_text(bytes));
            (page.title.or(stem), vec![(1, page.content)], page.published_at)
        }
    };

    let pages: Vec<(usize, String)> = pages
        .into_iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .collect();

    if pages.is_empty() {
        if format == DocumentFormat::Pdf {
            tracing::warn!("No text extracted from PDF {:?}. It might be a scanned document.", path);
        }
        return Err(ExtractError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(ExtractedDocument {
        format,
        title,
        pages,
        published_at,
        metadata,
    })
}

/// UTF-8 디코딩, 실패하면 Latin-1로 해석 (BOM 제거)
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            tracing::debug!("Input is not valid UTF-8, decoding as Latin-1");
            bytes.iter().map(|&b| b as char).collect()
        }
    }
}

/// 첫 번째 `# ` 헤딩
fn markdown_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
