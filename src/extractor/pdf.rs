//! PDF 텍스트 추출 모듈
//!
//! pdf-extract 크레이트로 텍스트를 뽑은 뒤 페이지 단위로 나눕니다.

use anyhow::{Context, Result};
use regex::Regex;

/// PDF 바이트에서 페이지별 텍스트 추출
///
/// (페이지 번호, 텍스트) 목록을 반환합니다. 페이지 번호는 1부터 시작합니다.
/// 텍스트가 없으면 빈 목록입니다.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<(usize, String)>> {
    let text = pdf_extract::extract_text_from_mem(bytes).context("pdf-extract failed")?;

    if text.trim().is_empty() {
        return Ok(vec![]);
    }

    Ok(split_pdf_pages(&text)
        .into_iter()
        .enumerate()
        .map(|(i, text)| (i + 1, text))
        .collect())
}

/// PDF 텍스트를 페이지별로 분리
///
/// 폼피드(`\x0c`)를 먼저 쓰고, 없으면 "--- Page 3 ---" 같은 구분 줄을 씁니다.
/// 둘 다 없으면 전체가 한 페이지입니다.
fn split_pdf_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        return pages;
    }

    if let Ok(page_pattern) = Regex::new(r"(?m)^\s*[-=]+\s*(?:Page\s*)?(\d+)\s*[-=]+\s*$") {
        let pages: Vec<String> = page_pattern
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pages.len() > 1 {
            return pages;
        }
    }

    vec![text.trim().to_string()]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pdf_pages_with_formfeed() {
        let text = "Page 1 content\x0cPage 2 content\x0c\x0cPage 3 content";
        let pages = split_pdf_pages(text);
        assert_eq!(pages, vec!["Page 1 content", "Page 2 content", "Page 3 content"]);
    }

    #[test]
    fn test_split_pdf_pages_with_markers() {
        let text = "Cover\n--- Page 2 ---\nBody text\n=== 3 ===\nAppendix";
        let pages = split_pdf_pages(text);
        assert_eq!(pages, vec!["Cover", "Body text", "Appendix"]);
    }

    #[test]
    fn test_split_pdf_pages_no_separator() {
        let pages = split_pdf_pages("  Just some text without page breaks ");
        assert_eq!(pages, vec!["Just some text without page breaks"]);
    }

    #[test]
    fn test_extract_pages_rejects_garbage() {
        assert!(extract_pages(b"definitely not a pdf").is_err());
    }
}
