//! 시간 표현 파싱
//!
//! 쿼리 문장에서 "last week", "in 2023", "before March 15, 2024" 같은
//! 시간 의도를 찾아 포함 구간 [`TimeRange`]로 바꿉니다.
//! 인식기는 우선순위 순서로 적용되고 첫 매치가 이깁니다.
//! 매치되지 않거나 날짜 파싱에 실패하면 필터 없음(`None`)으로 끝납니다.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use regex::{Captures, Regex};

use super::types::TimeRange;

/// 인식기 종류 (우선순위 순)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recognizer {
    LastWeekday,
    LastWeek,
    LastMonth,
    ThisMonth,
    ThisWeek,
    InYear,
    Before,
    After,
}

/// 날짜 표현: "march 15, 2024" / "mar 15 2024" / "2024-03-15"
const DATE: &str = r"([a-z]+\.?\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}|\d{4}-\d{2}-\d{2})";

/// 우선순위 순 인식기 테이블 (한 번만 컴파일)
static RECOGNIZERS: LazyLock<Vec<(Recognizer, Regex)>> = LazyLock::new(|| {
    [
        (
            Recognizer::LastWeekday,
            r"\blast\s+(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b".to_string(),
        ),
        (Recognizer::LastWeek, r"\blast\s+week\b".to_string()),
        (Recognizer::LastMonth, r"\blast\s+month\b".to_string()),
        (Recognizer::ThisMonth, r"\bthis\s+month\b".to_string()),
        (Recognizer::ThisWeek, r"\bthis\s+week\b".to_string()),
        (Recognizer::InYear, r"\bin\s+(\d{4})\b".to_string()),
        (Recognizer::Before, format!(r"\bbefore\s+{}", DATE)),
        (Recognizer::After, format!(r"\bafter\s+{}", DATE)),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(&pattern).expect("Invalid temporal regex pattern")))
    .collect()
});

/// 쿼리 시간 범위 파서
#[derive(Debug, Default, Clone, Copy)]
pub struct TemporalQueryParser;

impl TemporalQueryParser {
    pub fn new() -> Self {
        Self
    }

    /// 현재 시각 기준 파싱
    pub fn parse(&self, query: &str) -> Option<TimeRange> {
        self.parse_at(query, Utc::now())
    }

    /// 주어진 "지금" 기준 파싱
    pub fn parse_at(&self, query: &str, now: DateTime<Utc>) -> Option<TimeRange> {
        let lowered = query.to_lowercase();

        for (kind, re) in RECOGNIZERS.iter() {
            let Some(caps) = re.captures(&lowered) else {
                continue;
            };

            match resolve(*kind, &caps, now) {
                Some(range) => {
                    tracing::debug!("Temporal filter {:?} from {:?}: {:?}", kind, caps.get(0).map(|m| m.as_str()), range);
                    return Some(range);
                }
                None => {
                    tracing::debug!("Temporal recognizer {:?} matched but could not resolve a date", kind);
                }
            }
        }

        None
    }
}

/// 인식기 매치를 시간 범위로 변환 (실패 시 None)
fn resolve(kind: Recognizer, caps: &Captures<'_>, now: DateTime<Utc>) -> Option<TimeRange> {
    match kind {
        Recognizer::LastWeekday => {
            let target = parse_weekday(caps.get(1)?.as_str())?;
            let day = last_weekday(now.date_naive(), target);
            Some(TimeRange::between(
                day.and_hms_opt(0, 0, 0)?.and_utc(),
                day.and_hms_micro_opt(23, 59, 59, 999_999)?.and_utc(),
            ))
        }
        Recognizer::LastWeek => Some(TimeRange::between(now - Duration::days(7), now)),
        Recognizer::LastMonth => Some(TimeRange::between(now - Duration::days(30), now)),
        Recognizer::ThisMonth => {
            let first = now.date_naive().with_day(1)?.and_hms_opt(0, 0, 0)?.and_utc();
            Some(TimeRange::between(first, now))
        }
        Recognizer::ThisWeek => {
            let days = i64::from(now.weekday().num_days_from_monday());
            Some(TimeRange::between(now - Duration::days(days), now))
        }
        Recognizer::InYear => {
            let year: i32 = caps.get(1)?.as_str().parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0)?;
            let end = NaiveDate::from_ymd_opt(year, 12, 31)?.and_hms_opt(23, 59, 59)?;
            Some(TimeRange::between(start.and_utc(), end.and_utc()))
        }
        Recognizer::Before => {
            let date = parse_date(caps.get(1)?.as_str())?;
            Some(TimeRange::until(date.and_utc()))
        }
        Recognizer::After => {
            let date = parse_date(caps.get(1)?.as_str())?;
            Some(TimeRange::since(date.and_utc()))
        }
    }
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    name.parse::<Weekday>().ok()
}

/// 오늘 이전(오늘이 그 요일이면 7일 전)의 가장 최근 해당 요일
fn last_weekday(today: NaiveDate, target: Weekday) -> NaiveDate {
    let today_idx = i64::from(today.weekday().num_days_from_monday());
    let target_idx = i64::from(target.num_days_from_monday());

    let mut delta = target_idx - today_idx;
    if delta >= 0 {
        delta -= 7;
    }

    today + Duration::days(delta)
}

/// 자연어 절대 날짜 파싱 (해당 날짜 00:00:00)
fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let cleaned = raw.replace(',', " ").replace('.', " ");
    let cleaned = strip_ordinal_suffix(&cleaned.split_whitespace().collect::<Vec<_>>().join(" "));

    const FORMATS: [&str; 3] = ["%Y-%m-%d", "%B %d %Y", "%b %d %Y"];

    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// "15th" → "15"
fn strip_ordinal_suffix(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let digits = word.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) && digits.len() < word.len() {
                digits
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Tests
// ============================================================================
