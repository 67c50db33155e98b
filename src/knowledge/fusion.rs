//! 점수 융합
//!
//! 벡터 검색 결과와 키워드 검색 결과를 하나의 순위로 합칩니다.
//! 각 목록의 점수를 목록 내 최댓값으로 정규화한 뒤 가중합합니다.
//!
//! `combined = VECTOR_WEIGHT * v/v_max + KEYWORD_WEIGHT * k/k_max`

use std::collections::HashMap;

use uuid::Uuid;

use super::types::{ScoredHit, ScoredResult};

/// 벡터(의미) 점수 가중치
pub const VECTOR_WEIGHT: f32 = 0.7;

/// 키워드(BM25) 점수 가중치
pub const KEYWORD_WEIGHT: f32 = 0.2;

#[derive(Default)]
struct Accum {
    vector: Option<f32>,
    keyword: Option<f32>,
}

/// 두 결과 목록을 융합해 상위 `top_k`개를 반환합니다.
///
/// - 빈 목록의 최댓값은 1.0으로 취급합니다.
/// - 최댓값이 0 이하인 목록의 정규화 점수는 0입니다.
/// - 같은 목록에서 중복된 chunk_id는 첫 항목만 반영합니다.
/// - 동점은 처음 등장한 순서(벡터 목록 → 키워드 목록)를 유지합니다.
pub fn fuse(vector_hits: &[ScoredHit], keyword_hits: &[ScoredHit], top_k: usize) -> Vec<ScoredResult> {
    if top_k == 0 {
        return Vec::new();
    }

    let vector_max = list_max(vector_hits);
    let keyword_max = list_max(keyword_hits);

    let mut order: Vec<Uuid> = Vec::new();
    let mut scores: HashMap<Uuid, Accum> = HashMap::new();

    for hit in vector_hits {
        let entry = scores.entry(hit.chunk_id).or_insert_with(|| {
            order.push(hit.chunk_id);
            Accum::default()
        });
        if entry.vector.is_none() {
            entry.vector = Some(normalize(hit.score, vector_max));
        }
    }

    for hit in keyword_hits {
        let entry = scores.entry(hit.chunk_id).or_insert_with(|| {
            order.push(hit.chunk_id);
            Accum::default()
        });
        if entry.keyword.is_none() {
            entry.keyword = Some(normalize(hit.score, keyword_max));
        }
    }

    let mut results: Vec<ScoredResult> = order
        .into_iter()
        .filter_map(|id| {
            let acc = scores.get(&id)?;
            Some(ScoredResult {
                chunk_id: id,
                vector_score: acc.vector,
                keyword_score: acc.keyword,
                combined_score: VECTOR_WEIGHT * acc.vector.unwrap_or(0.0)
                    + KEYWORD_WEIGHT * acc.keyword.unwrap_or(0.0),
            })
        })
        .collect();

    // stable sort: 동점은 등장 순서 유지
    results.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    results.truncate(top_k);

    results
}

fn list_max(hits: &[ScoredHit]) -> f32 {
    hits.iter()
        .map(|h| h.score)
        .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |m| m.max(s))))
        .unwrap_or(1.0)
}

fn normalize(score: f32, max: f32) -> f32 {
    if max <= 0.0 {
        0.0
    } else {
        score / max
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_weighted_fusion() {
        let id = ids(3);
        let (a, b, c) = (id[0], id[1], id[2]);

        let vector = vec![ScoredHit::new(a, 0.9), ScoredHit::new(b, 0.5)];
        let keyword = vec![ScoredHit::new(b, 1.0), ScoredHit::new(c, 0.4)];

        let fused = fuse(&vector, &keyword, 3);
        assert_eq!(fused.iter().map(|r| r.chunk_id).collect::<Vec<_>>(), vec![a, b, c]);

        assert!(approx(fused[0].combined_score, 0.70));
        assert!(fused[0].keyword_score.is_none());

        // 0.7 * (0.5/0.9) + 0.2 * (1.0/1.0)
        assert!(approx(fused[1].combined_score, 0.5889));
        assert!(approx(fused[1].vector_score.unwrap(), 0.5 / 0.9));
        assert!(approx(fused[1].keyword_score.unwrap(), 1.0));

        assert!(approx(fused[2].combined_score, 0.08));
        assert!(fused[2].vector_score.is_none());
    }

    #[test]
    fn test_keyword_scores_normalized_by_list_max() {
        let id = ids(2);
        let keyword = vec![ScoredHit::new(id[0], 12.0), ScoredHit::new(id[1], 4.0)];
        let fused = fuse(&[], &keyword, 10);
        assert!(approx(fused[0].combined_score, 0.2));
        assert!(approx(fused[1].combined_score, 0.2 * (4.0 / 12.0)));
    }

    #[test]
    fn test_empty_lists() {
        assert!(fuse(&[], &[], 5).is_empty());

        let id = ids(2);
        let keyword = vec![ScoredHit::new(id[0], 3.0), ScoredHit::new(id[1], 1.5)];
        let fused = fuse(&[], &keyword, 5);
        assert_eq!(fused.len(), 2);
        assert!(approx(fused[0].combined_score, 0.2));
        assert!(approx(fused[1].combined_score, 0.1));
        assert!(fused[0].vector_score.is_none());
    }

    #[test]
    fn test_non_positive_max_yields_zero() {
        let id = ids(2);
        let vector = vec![ScoredHit::new(id[0], -0.2), ScoredHit::new(id[1], -0.5)];
        let fused = fuse(&vector, &[], 5);
        assert!(fused.iter().all(|r| r.combined_score == 0.0));
    }

    #[test]
    fn test_truncates_and_orders() {
        let id = ids(5);
        let vector: Vec<_> = id.iter().enumerate().map(|(i, id)| ScoredHit::new(*id, 1.0 - i as f32 * 0.1)).collect();
        let fused = fuse(&vector, &[], 3);

        assert_eq!(fused.len(), 3);
        assert_eq!(fused.iter().map(|r| r.chunk_id).collect::<Vec<_>>(), id[..3].to_vec());
        assert!(fused.windows(2).all(|w| w[0].combined_score >= w[1].combined_score));
        assert!(fuse(&vector, &[], 0).is_empty());
    }

    #[test]
    fn test_ties_keep_first_appearance() {
        let id = ids(3);
        let vector = vec![ScoredHit::new(id[0], 0.5), ScoredHit::new(id[1], 0.5)];
        let fused = fuse(&vector, &[], 10);
        assert_eq!(fused[0].chunk_id, id[0]);
        assert_eq!(fused[1].chunk_id, id[1]);
    }

    #[test]
    fn test_duplicate_within_list_counts_once() {
        let id = ids(2);
        let vector = vec![
            ScoredHit::new(id[0], 1.0),
            ScoredHit::new(id[0], 0.1),
            ScoredHit::new(id[1], 0.5),
        ];
        let fused = fuse(&vector, &[], 10);
        assert_eq!(fused.len(), 2);
        assert!(approx(fused[0].combined_score, 0.7));
        assert!(approx(fused[1].combined_score, 0.35));
    }
}
