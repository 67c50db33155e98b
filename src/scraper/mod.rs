//! 웹 스크래퍼 모듈 - URL 콘텐츠 추출
//!
//! 페이지를 가져와 제목, 블록 단위 문단, 게시일, 도메인을 뽑습니다.
//! 문단은 빈 줄로 이어 붙여 paragraph 청킹이 블록 경계를 따르게 합니다.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::knowledge::Metadata;

/// 본문에서 제외하는 태그
const SKIP_TAGS: [&str; 9] = [
    "script", "style", "noscript", "nav", "footer", "header", "aside", "form", "template",
];

/// 문단 경계가 되는 블록 태그
const BLOCK_TAGS: [&str; 22] = [
    "p", "div", "section", "article", "main", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul", "ol",
    "pre", "blockquote", "table", "tr", "td", "th", "figcaption", "dd",
];

/// 본문 후보 선택자 (우선순위 순)
const CONTENT_SELECTORS: [&str; 6] = ["article", "main", "[role=main]", ".content", "#content", "body"];

/// 후보로 인정하는 최소 본문 길이
const MIN_CONTENT_CHARS: usize = 100;

// ============================================================================
// Parsed Page
// ============================================================================

/// HTML에서 뽑은 내용 (네트워크 무관)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub title: Option<String>,
    /// 블록 단위 문단을 "\n\n"으로 연결
    pub content: String,
    pub description: Option<String>,
    pub author: Option<String>,
    /// `article:published_time` 등에서 읽은 게시 시각
    pub published_at: Option<DateTime<Utc>>,
}

/// HTML 문자열 파싱
pub fn parse_html(html: &str) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        content: extract_content(&document),
        description: meta_content(&document, &[r#"meta[property="og:description"]"#, r#"meta[name="description"]"#]),
        author: meta_content(&document, &[r#"meta[name="author"]"#]),
        published_at: extract_published_at(&document),
    }
}

/// 스크랩된 콘텐츠
#[derive(Debug, Clone)]
pub struct ScrapedContent {
    /// 원본 URL
    pub url: String,
    pub domain: Option<String>,
    pub page: ParsedPage,
}

impl ScrapedContent {
    /// 소스 메타데이터 (title, description, author, domain, publish_date)
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.into());
            }
        };

        put("title", self.page.title.clone());
        put("description", self.page.description.clone());
        put("author", self.page.author.clone());
        put("domain", self.domain.clone());
        put("publish_date", self.page.published_at.map(|t| t.to_rfc3339()));

        metadata
    }
}

// ============================================================================
// Web Scraper
// ============================================================================

/// 웹 스크래퍼
pub struct WebScraper {
    client: reqwest::Client,
}

impl WebScraper {
    /// 새 스크래퍼 생성
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("palank-recall/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// URL에서 콘텐츠 추출
    pub async fn scrape(&self, url: &str) -> Result<ScrapedContent> {
        let domain = url_domain(url)?;
        tracing::info!("Scraping: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("HTTP request failed: {}", url))?
            .error_for_status()
            .with_context(|| format!("HTTP error status: {}", url))?;

        let html = response.text().await.context("Failed to read response body")?;
        let page = parse_html(&html);

        if page.content.is_empty() {
            tracing::warn!("No text content extracted from {}", url);
        }

        Ok(ScrapedContent {
            url: url.to_string(),
            domain,
            page,
        })
    }
}

impl Default for WebScraper {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            tracing::error!("Failed to build HTTP client, using defaults: {}", e);
            Self {
                client: reqwest::Client::new(),
            }
        })
    }
}

/// http(s) URL 검증 후 호스트 반환
fn url_domain(raw: &str) -> Result<Option<String>> {
    let parsed = url::Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.host_str().map(str::to_string)),
        other => anyhow::bail!("Unsupported URL scheme: {}", other),
    }
}

// ============================================================================
// Extraction Helpers
// ============================================================================

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    document.select(&selector).next()
}

/// 제목 추출 (<title> → <h1>)
fn extract_title(document: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|tag| {
        let element = select_first(document, tag)?;
        let title = collapse_whitespace(&element.text().collect::<String>());
        (!title.is_empty()).then_some(title)
    })
}

fn meta_content(document: &Html, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|s| {
        let value = select_first(document, s)?.value().attr("content")?.trim().to_string();
        (!value.is_empty()).then_some(value)
    })
}

/// 게시 시각 (meta article:published_time → published_time → <time datetime>)
fn extract_published_at(document: &Html) -> Option<DateTime<Utc>> {
    let raw = meta_content(
        document,
        &[
            r#"meta[property="article:published_time"]"#,
            r#"meta[property="published_time"]"#,
        ],
    )
    .or_else(|| {
        select_first(document, "time[datetime]")
            .and_then(|t| t.value().attr("datetime"))
            .map(str::to_string)
    })?;

    parse_timestamp(&raw)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// 본문 추출
///
/// 선택자 우선순위대로 충분히 긴 본문을 가진 첫 요소를 씁니다.
fn extract_content(document: &Html) -> String {
    let mut fallback = None;

    for selector in CONTENT_SELECTORS {
        if let Some(element) = select_first(document, selector) {
            let text = block_text(element);
            if text.chars().count() > MIN_CONTENT_CHARS {
                return text;
            }
            if fallback.is_none() && !text.is_empty() {
                fallback = Some(text);
            }
        }
    }

    fallback.unwrap_or_default()
}

/// 블록 요소 경계로 나눈 문단들을 "\n\n"으로 연결
fn block_text(root: ElementRef<'_>) -> String {
    let mut paragraphs = Vec::new();
    let mut buffer = String::new();
    walk(root, &mut buffer, &mut paragraphs);
    flush(&mut buffer, &mut paragraphs);
    paragraphs.join("\n\n")
}

fn walk(element: ElementRef<'_>, buffer: &mut String, paragraphs: &mut Vec<String>) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            buffer.push_str(text);
            continue;
        }

        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child.value().name();

        if SKIP_TAGS.contains(&name) {
            continue;
        }
        if name == "br" {
            buffer.push(' ');
            continue;
        }

        let block = BLOCK_TAGS.contains(&name);
        if block {
            flush(buffer, paragraphs);
        }
        walk(child, buffer, paragraphs);
        if block {
            flush(buffer, paragraphs);
        }
    }
}

fn flush(buffer: &mut String, paragraphs: &mut Vec<String>) {
    let paragraph = collapse_whitespace(buffer);
    if !paragraph.is_empty() {
        paragraphs.push(paragraph);
    }
    buffer.clear();
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scraper_creation() {
        assert!(WebScraper::new().is_ok());
    }

    #[test]
    fn test_extract_title() {
        let page = parse_html(
            r#"
            <html>
                <head><title>Test Page Title</title></head>
                <body><h1>Main Heading</h1></body>
            </html>
        "#,
        );
        assert_eq!(page.title, Some("Test Page Title".to_string()));
    }

    #[test]
    fn test_extract_title_h1_fallback() {
        let page = parse_html(
            r#"
            <html>
                <head><title></title></head>
                <body><h1>H1 Heading</h1></body>
            </html>
        "#,
        );
        assert_eq!(page.title, Some("H1 Heading".to_string()));
    }

    #[test]
    fn test_article_paragraphs_are_blocks() {
        let page = parse_html(
            r#"
            <html>
                <body>
                    <nav>Navigation menu</nav>
                    <article>
                        <h2>Release notes</h2>
                        <p>This is the main article content, and it
                           should be extracted as the primary content.</p>
                        <p>A second paragraph with <b>inline</b> markup.</p>
                        <script>var tracking = true;</script>
                    </article>
                    <footer>Footer content</footer>
                </body>
            </html>
        "#,
        );

        let paragraphs: Vec<&str> = page.content.split("\n\n").collect();
        assert_eq!(
            paragraphs,
            vec![
                "Release notes",
                "This is the main article content, and it should be extracted as the primary content.",
                "A second paragraph with inline markup.",
            ]
        );
        assert!(!page.content.contains("tracking"));
        assert!(!page.content.contains("Navigation"));
    }

    #[test]
    fn test_short_article_falls_through_to_main() {
        let page = parse_html(
            r#"
            <html><body>
                <article>Too short.</article>
                <main>
                    <p>Main content area with important information that should be extracted.</p>
                    <p>Adding more text to exceed the one hundred character threshold.</p>
                </main>
            </body></html>
        "#,
        );
        assert!(page.content.starts_with("Main content area"));
    }

    #[test]
    fn test_metadata_and_published_time() {
        let page = parse_html(
            r#"
            <html><head>
                <title>Post</title>
                <meta property="article:published_time" content="2024-02-10T08:30:00+09:00">
                <meta name="description" content="A short summary">
                <meta name="author" content="Kim">
            </head><body><p>Body</p></body></html>
        "#,
        );

        assert_eq!(
            page.published_at,
            Some(Utc.with_ymd_and_hms(2024, 2, 9, 23, 30, 0).unwrap())
        );
        assert_eq!(page.description.as_deref(), Some("A short summary"));
        assert_eq!(page.author.as_deref(), Some("Kim"));
        assert_eq!(page.content, "Body");

        let scraped = ScrapedContent {
            url: "https://blog.example.com/post".to_string(),
            domain: url_domain("https://blog.example.com/post").unwrap(),
            page,
        };
        let metadata = scraped.metadata();
        assert_eq!(metadata["domain"], "blog.example.com");
        assert_eq!(metadata["title"], "Post");
        assert!(metadata.contains_key("publish_date"));
    }

    #[test]
    fn test_time_element_date_only() {
        let page = parse_html(r#"<html><body><time datetime="2023-11-05">Nov 5</time></body></html>"#);
        assert_eq!(
            page.published_at,
            Some(Utc.with_ymd_and_hms(2023, 11, 5, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_url_validation() {
        assert!(url_domain("ftp://example.com/file").is_err());
        assert!(url_domain("not a url").is_err());
        assert_eq!(url_domain("http://example.com:8080/a").unwrap().as_deref(), Some("example.com"));
    }
}
