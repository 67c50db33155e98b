//! 토큰 카운터
//!
//! `tokenizer.json`(Hugging Face tokenizers 포맷)이 있으면 모델 토크나이저로,
//! 없으면 `문자 수 / 4` 추정치로 토큰 길이를 계산합니다.
//! 추정 모드는 조용히 쓰이지 않습니다: 생성 시 경고를 남기고,
//! 청크 메타데이터 `token_counter`에 `"chars/4"`로 기록됩니다.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokenizers::Tokenizer;

/// 추정 모드에서 토큰 하나에 해당하는 문자 수
pub const CHARS_PER_TOKEN: usize = 4;

/// 토큰 길이 계산기
pub enum TokenCounter {
    /// 모델 토크나이저
    Model(Box<Tokenizer>),
    /// 문자 수 / 4 추정
    CharEstimate,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl TokenCounter {
    /// tokenizer.json 파일에서 로드
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Failed to load tokenizer: {:?}", path))?;
        Ok(Self::Model(Box::new(tokenizer)))
    }

    /// 경로가 있으면 로드, 실패하거나 없으면 추정 모드로 폴백
    pub fn from_optional_path(path: Option<&Path>) -> Self {
        match path {
            Some(p) => match Self::from_file(p) {
                Ok(counter) => {
                    tracing::info!("Using model tokenizer from {:?}", p);
                    counter
                }
                Err(e) => {
                    tracing::warn!(
                        "Tokenizer unavailable ({:#}); falling back to chars/{} estimate",
                        e,
                        CHARS_PER_TOKEN
                    );
                    Self::CharEstimate
                }
            },
            None => {
                tracing::warn!(
                    "No tokenizer configured; token counts use chars/{} estimate",
                    CHARS_PER_TOKEN
                );
                Self::CharEstimate
            }
        }
    }

    /// 메타데이터에 기록되는 카운터 이름
    pub fn label(&self) -> &'static str {
        match self {
            TokenCounter::Model(_) => "model",
            TokenCounter::CharEstimate => "chars/4",
        }
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self, TokenCounter::CharEstimate)
    }

    /// 텍스트 토큰 수
    pub fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::Model(tokenizer) => match tokenizer.encode(text, false) {
                Ok(encoding) => encoding.get_ids().len(),
                Err(e) => {
                    tracing::debug!("Tokenizer encode failed, using estimate: {}", e);
                    estimate_tokens(text)
                }
            },
            TokenCounter::CharEstimate => estimate_tokens(text),
        }
    }

    /// 고정 크기 슬라이딩 윈도우로 텍스트를 자릅니다.
    ///
    /// 반환값은 `(시작 토큰 인덱스, 끝 토큰 인덱스, 텍스트)` 목록입니다.
    /// 윈도우는 `step`만큼 전진하며, 마지막 윈도우가 시퀀스 끝에 닿으면 멈춥니다.
    /// 추정 모드에서는 4문자 단위 의사 토큰을 사용합니다.
    pub fn windows(&self, text: &str, size: usize, step: usize) -> Result<Vec<(usize, usize, String)>> {
        if size == 0 || step == 0 {
            anyhow::bail!("Window size and step must be positive");
        }

        match self {
            TokenCounter::Model(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| anyhow!("Tokenizer encode failed: {}", e))?;
                let ids = encoding.get_ids();

                slide(ids.len(), size, step)
                    .into_iter()
                    .map(|(start, end)| {
                        let piece = tokenizer
                            .decode(&ids[start..end], true)
                            .map_err(|e| anyhow!("Tokenizer decode failed: {}", e))?;
                        Ok((start, end, piece))
                    })
                    .collect()
            }
            TokenCounter::CharEstimate => {
                let chars: Vec<char> = text.chars().collect();
                let total = estimate_tokens(text);

                Ok(slide(total, size, step)
                    .into_iter()
                    .map(|(start, end)| {
                        let from = start * CHARS_PER_TOKEN;
                        let to = (end * CHARS_PER_TOKEN).min(chars.len());
                        (start, end, chars[from..to].iter().collect())
                    })
                    .collect())
            }
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::CharEstimate
    }
}

/// 문자 수 / 4 추정 (올림)
///
/// 4문자 미만의 꼬리도 의사 토큰 하나로 셉니다. `windows`의 의사 토큰 수와 같습니다.
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// `0..len` 위의 윈도우 구간 목록
fn slide(len: usize, size: usize, step: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;

    while start < len {
        let end = (start + size).min(len);
        spans.push((start, end));

        if end >= len {
            break;
        }
        start += step;
    }

    spans
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::test_support::word_level;
    use super::*;
    use tempfile::TempDir;

    const PANGRAM: &str = "the quick brown fox jumps over the lazy dog";

    fn pangram_words() -> Vec<&'static str> {
        PANGRAM.split(' ').chain(["."]).collect()
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
        // 멀티바이트 문자도 문자 단위로 센다
        assert_eq!(estimate_tokens("안녕하세요세계"), 2);
    }

    #[test]
    fn test_slide() {
        assert_eq!(slide(10, 4, 3), vec![(0, 4), (3, 7), (6, 10)]);
        assert_eq!(slide(3, 4, 3), vec![(0, 3)]);
        assert!(slide(0, 4, 3).is_empty());
    }

    #[test]
    fn test_char_estimate_windows() {
        let counter = TokenCounter::CharEstimate;
        // 40자 = 10 의사 토큰, 윈도우 4 / 스텝 3
        let text = "abcdefghijklmnopqrstuvwxyz0123456789ABCD";
        let windows = counter.windows(text, 4, 3).unwrap();

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (0, 4, "abcdefghijklmnop".to_string()));
        assert_eq!(windows[1].0, 3);
        assert_eq!(windows[2].1, 10);
        assert!(windows[2].2.ends_with("ABCD"));
    }

    #[test]
    fn test_windows_rejects_zero_step() {
        assert!(TokenCounter::CharEstimate.windows("text", 4, 0).is_err());
    }

    #[test]
    fn test_missing_tokenizer_falls_back() {
        let counter = TokenCounter::from_optional_path(Some(Path::new("/nonexistent/tokenizer.json")));
        assert!(counter.is_estimate());
        assert_eq!(counter.label(), "chars/4");
    }

    #[test]
    fn test_estimate_matches_window_count() {
        let counter = TokenCounter::CharEstimate;
        for text in ["abc", "abcdefg", "안녕하세요세계", "x"] {
            let windows = counter.windows(text, 100, 50).unwrap();
            assert_eq!(windows.len(), 1);
            assert_eq!(windows[0].1, counter.count(text), "text {:?}", text);
        }
    }

    #[test]
    fn test_model_count() {
        let dir = TempDir::new().unwrap();
        let counter = word_level(dir.path(), &pangram_words(), true);

        assert!(!counter.is_estimate());
        assert_eq!(counter.label(), "model");
        assert_eq!(counter.count(PANGRAM), 9);
        // 구두점은 별도 토큰
        assert_eq!(counter.count("the lazy dog."), 4);
        // 모르는 단어는 [UNK] 한 개
        assert_eq!(counter.count("the zebra"), 2);
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn test_model_windows() {
        let dir = TempDir::new().unwrap();
        let counter = word_level(dir.path(), &pangram_words(), true);

        let windows = counter.windows(PANGRAM, 4, 3).unwrap();
        let spans: Vec<_> = windows.iter().map(|(s, e, _)| (*s, *e)).collect();
        assert_eq!(spans, vec![(0, 4), (3, 7), (6, 9)]);

        assert_eq!(windows[0].2, "the quick brown fox");
        // 앞 윈도우의 마지막 토큰이 다음 윈도우의 처음
        assert_eq!(windows[1].2, "fox jumps over the");
        assert_eq!(windows[2].2, "the lazy dog");
        for (_, _, piece) in &windows {
            assert!(counter.count(piece) <= 4);
        }
    }

    #[test]
    fn test_model_encode_failure_falls_back() {
        let dir = TempDir::new().unwrap();
        let counter = word_level(dir.path(), &pangram_words(), false);

        assert_eq!(counter.count("the fox"), 2);
        // 어휘 밖 단어: 인코딩 실패 → 추정치
        let unknown = "zzzzzzzzzzzz";
        assert_eq!(counter.count(unknown), estimate_tokens(unknown));
        assert_eq!(counter.count(unknown), 3);
        assert!(counter.windows(unknown, 4, 3).is_err());
    }
}
