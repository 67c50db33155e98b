//! Text Chunking Module
//!
//! 원문을 임베딩/검색 단위인 청크로 나눕니다.
//!
//! - Sentence: 문장 단위 누적 + 이전 청크 끝 문장들로 오버랩 시드
//! - Paragraph: 빈 줄 기준 문단 단위 누적 (오버랩 없음)
//! - TokenLimit: 토큰 시퀀스 위 고정 크기 슬라이딩 윈도우
//!
//! sentence/paragraph 청크의 텍스트는 원문의 연속 구간이므로,
//! 각 청크의 비오버랩 구간을 순서대로 이으면 trim된 원문이 그대로 복원됩니다.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use anyhow::Result;
use regex::Regex;

use super::tokenizer::TokenCounter;
use super::types::{Metadata, TextChunk};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 기본 최대 청크 토큰 수
pub const DEFAULT_MAX_CHUNK_TOKENS: usize = 1000;
/// 기본 오버랩 토큰 수
pub const DEFAULT_OVERLAP_TOKENS: usize = 100;

/// 청킹 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 청크 최대 토큰 수 (단일 초과 문장은 예외)
    pub max_chunk_tokens: usize,
    /// 청크 간 오버랩 토큰 수
    pub overlap_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: DEFAULT_MAX_CHUNK_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl ChunkConfig {
    pub fn new(max_chunk_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        let config = Self {
            max_chunk_tokens,
            overlap_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    /// 윈도우가 항상 전진하려면 overlap < max 이어야 함
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_tokens == 0 {
            anyhow::bail!("max_chunk_tokens must be positive");
        }
        if self.overlap_tokens >= self.max_chunk_tokens {
            anyhow::bail!(
                "overlap_tokens ({}) must be smaller than max_chunk_tokens ({})",
                self.overlap_tokens,
                self.max_chunk_tokens
            );
        }
        Ok(())
    }

    /// token-limit 전략의 윈도우 전진 폭
    pub fn step(&self) -> usize {
        self.max_chunk_tokens - self.overlap_tokens
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// 청킹 전략 (콘텐츠 종류별로 호출자가 선택)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Sentence,
    Paragraph,
    TokenLimit,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::TokenLimit => "token",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sentence" => Ok(ChunkStrategy::Sentence),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "token" | "token-limit" | "token_limit" => Ok(ChunkStrategy::TokenLimit),
            other => anyhow::bail!("Unknown chunk strategy: {}", other),
        }
    }
}

// ============================================================================
// Chunker
// ============================================================================

/// 누적 단위 (문장 또는 문단)
#[derive(Debug, Clone, Copy)]
struct Unit {
    start_byte: usize,
    end_byte: usize,
    start_char: usize,
    end_char: usize,
    tokens: usize,
}

/// 청커
#[derive(Debug)]
pub struct Chunker {
    config: ChunkConfig,
    counter: TokenCounter,
    sentence_re: Regex,
    paragraph_re: Regex,
}

impl Chunker {
    /// 설정과 토큰 카운터로 생성
    pub fn new(config: ChunkConfig, counter: TokenCounter) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            counter,
            // 종결 부호 뒤 공백에서 문장 분리
            sentence_re: Regex::new(r"[.!?]\s+")?,
            // 빈 줄(공백만 있는 줄 포함)에서 문단 분리
            paragraph_re: Regex::new(r"\n[^\S\n]*\n\s*")?,
        })
    }

    /// 기본 설정 + 문자 수 추정 카운터
    pub fn with_defaults() -> Result<Self> {
        Self::new(ChunkConfig::default(), TokenCounter::CharEstimate)
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// 텍스트를 청크로 분할
    ///
    /// 결과 청크는 `0..n-1`로 연속 번호가 매겨지고, 빈 텍스트 청크는 없습니다.
    pub fn chunk(&self, text: &str, strategy: ChunkStrategy) -> Result<Vec<TextChunk>> {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }

        let chunks = match strategy {
            ChunkStrategy::Sentence => {
                let units = self.split_units(text, &self.sentence_re, 1);
                self.assemble(text, &units, true, strategy)
            }
            ChunkStrategy::Paragraph => {
                let units = self.split_units(text, &self.paragraph_re, 0);
                self.assemble(text, &units, false, strategy)
            }
            ChunkStrategy::TokenLimit => self.chunk_by_token_limit(text)?,
        };

        tracing::debug!(
            "Chunked {} chars into {} chunks (strategy={}, counter={})",
            text.chars().count(),
            chunks.len(),
            strategy,
            self.counter.label()
        );

        Ok(chunks)
    }

    /// 페이지 단위 청킹
    ///
    /// 페이지마다 따로 청킹해 `page_number`를 메타데이터에 남기고,
    /// 문서 전체에 걸쳐 `chunk_index`를 다시 매깁니다.
    /// 오프셋은 각 페이지 텍스트 기준입니다.
    pub fn chunk_pages(&self, pages: &[(usize, String)], strategy: ChunkStrategy) -> Result<Vec<TextChunk>> {
        let mut all = Vec::new();

        for (page_number, page_text) in pages {
            for mut chunk in self.chunk(page_text, strategy)? {
                chunk
                    .metadata
                    .insert("page_number".to_string(), (*page_number).into());
                all.push(chunk);
            }
        }

        for (i, chunk) in all.iter_mut().enumerate() {
            chunk.chunk_index = i;
        }

        Ok(all)
    }

    /// 구분자 정규식으로 단위 분할 (각 단위는 앞뒤 공백 제거)
    ///
    /// `keep`은 구분자 매치 중 앞 단위에 남길 바이트 수입니다 (문장 종결 부호 1).
    fn split_units(&self, text: &str, separator: &Regex, keep: usize) -> Vec<Unit> {
        let mut spans = Vec::new();
        let mut cursor = 0;

        for m in separator.find_iter(text) {
            push_trimmed(text, cursor..m.start() + keep, &mut spans);
            cursor = m.end();
        }
        push_trimmed(text, cursor..text.len(), &mut spans);

        // 바이트 → 문자 오프셋 (단위가 증가 순이므로 한 번에 계산)
        let mut units = Vec::with_capacity(spans.len());
        let mut last_byte = 0;
        let mut last_char = 0;

        for span in spans {
            let start_char = last_char + text[last_byte..span.start].chars().count();
            let end_char = start_char + text[span.start..span.end].chars().count();
            last_byte = span.end;
            last_char = end_char;

            units.push(Unit {
                start_byte: span.start,
                end_byte: span.end,
                start_char,
                end_char,
                tokens: self.counter.count(&text[span.start..span.end]),
            });
        }

        units
    }

    /// 단위들을 윈도우로 누적해 청크 생성
    fn assemble(&self, text: &str, units: &[Unit], overlap: bool, strategy: ChunkStrategy) -> Vec<TextChunk> {
        self.windows(units, overlap)
            .into_iter()
            .enumerate()
            .map(|(index, window)| {
                let first = units[window.start];
                let last = units[window.end - 1];
                let token_count = units[window.clone()].iter().map(|u| u.tokens).sum();

                TextChunk {
                    chunk_index: index,
                    text: text[first.start_byte..last.end_byte].to_string(),
                    token_count,
                    start_offset: first.start_char,
                    end_offset: last.end_char,
                    metadata: self.base_metadata(strategy),
                }
            })
            .collect()
    }

    /// 윈도우(단위 인덱스 구간) 계산
    ///
    /// 다음 단위를 더하면 최대 토큰을 넘을 때 현재 윈도우를 닫습니다.
    /// 단독으로 최대를 넘는 단위는 쪼개지지 않고 혼자 청크가 됩니다.
    fn windows(&self, units: &[Unit], overlap: bool) -> Vec<Range<usize>> {
        let max = self.config.max_chunk_tokens;
        let mut windows = Vec::new();
        let mut start = 0;
        let mut tokens = 0;

        for (i, unit) in units.iter().enumerate() {
            if i > start && tokens + unit.tokens > max {
                windows.push(start..i);

                start = if overlap {
                    self.overlap_start(units, start..i, unit.tokens)
                } else {
                    i
                };
                tokens = units[start..i].iter().map(|u| u.tokens).sum::<usize>() + unit.tokens;
            } else {
                tokens += unit.tokens;
            }
        }

        if start < units.len() {
            windows.push(start..units.len());
        }

        windows
    }

    /// 닫힌 윈도우의 끝에서부터 오버랩 예산 안에 드는 문장들을 고릅니다.
    ///
    /// 시드된 오버랩 + 다음 단위가 최대를 넘으면 앞쪽 오버랩 문장부터 버립니다.
    fn overlap_start(&self, units: &[Unit], closed: Range<usize>, next_tokens: usize) -> usize {
        let mut start = closed.end;
        let mut acc = 0;

        for j in closed.clone().rev() {
            if acc + units[j].tokens > self.config.overlap_tokens {
                break;
            }
            acc += units[j].tokens;
            start = j;
        }

        while start < closed.end && acc + next_tokens > self.config.max_chunk_tokens {
            acc -= units[start].tokens;
            start += 1;
        }

        start
    }

    /// 토큰 시퀀스 슬라이딩 윈도우 (오프셋은 토큰 인덱스)
    fn chunk_by_token_limit(&self, text: &str) -> Result<Vec<TextChunk>> {
        let windows = self
            .counter
            .windows(text, self.config.max_chunk_tokens, self.config.step())?;

        let chunks = windows
            .into_iter()
            .filter(|(_, _, piece)| !piece.trim().is_empty())
            .enumerate()
            .map(|(index, (start, end, piece))| TextChunk {
                chunk_index: index,
                text: piece,
                token_count: end - start,
                start_offset: start,
                end_offset: end,
                metadata: self.base_metadata(ChunkStrategy::TokenLimit),
            })
            .collect();

        Ok(chunks)
    }

    fn base_metadata(&self, strategy: ChunkStrategy) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("strategy".to_string(), strategy.as_str().into());
        metadata.insert("token_counter".to_string(), self.counter.label().into());
        metadata
    }
}

/// 앞뒤 공백을 뺀 구간이 비어있지 않으면 추가
fn push_trimmed(text: &str, range: Range<usize>, spans: &mut Vec<Range<usize>>) {
    let slice = &text[range.clone()];
    let trimmed_start = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();

    if !trimmed.is_empty() {
        let start = range.start + trimmed_start;
        spans.push(start..start + trimmed.len());
    }
}

// ============================================================================
// Tests
// ============================================================================
