//! Cosine similarity scoring and brute-force ranking.
//!
//! Every stored record holds one vector per title segment. A query is
//! compared against a record by aggregating over its segments with the
//! configured [`AggregationPolicy`].

use serde::{Deserialize, Serialize};

use crate::semantic::storage::BookmarkRecord;

/// How a single query vector is scored against a multi-segment embedding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    /// Cosine similarity against the centroid of all segments.
    /// Favors titles that are relevant as a whole.
    Average,
    /// Best cosine similarity over the segments.
    /// Favors titles where any one part matches.
    #[default]
    Max,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimilarityError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// A stored record together with its score against a query.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: BookmarkRecord,
    pub score: f32,
}

/// Cosine similarity of two vectors of equal length.
///
/// Returns 0.0 when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Element-wise mean of the segment vectors.
pub fn centroid(segments: &[Vec<f32>]) -> Result<Option<Vec<f32>>, SimilarityError> {
    let Some(first) = segments.first() else {
        return Ok(None);
    };

    let dimensions = first.len();
    let mut sum = vec![0.0f32; dimensions];
    for segment in segments {
        if segment.len() != dimensions {
            return Err(SimilarityError::DimensionMismatch {
                expected: dimensions,
                got: segment.len(),
            });
        }
        for (acc, value) in sum.iter_mut().zip(segment) {
            *acc += value;
        }
    }

    let count = segments.len() as f32;
    Ok(Some(sum.into_iter().map(|v| v / count).collect()))
}

/// Score a query against an ordered sequence of segment vectors.
///
/// An empty segment list scores 0.0.
pub fn aggregate_similarity(
    query: &[f32],
    segments: &[Vec<f32>],
    policy: AggregationPolicy,
) -> Result<f32, SimilarityError> {
    match policy {
        AggregationPolicy::Average => match centroid(segments)? {
            Some(center) => cosine_similarity(query, &center),
            None => Ok(0.0),
        },
        AggregationPolicy::Max => {
            let mut best: Option<f32> = None;
            for segment in segments {
                let score = cosine_similarity(query, segment)?;
                best = Some(best.map_or(score, |b| b.max(score)));
            }
            Ok(best.unwrap_or(0.0))
        }
    }
}

/// Rank records by similarity to the query, highest first.
///
/// Ties keep the order of `records`. Fails on the first record whose
/// dimensionality differs from the query, which means the index was
/// built by another provider.
pub fn rank(
    query: &[f32],
    records: Vec<BookmarkRecord>,
    top_k: usize,
    policy: AggregationPolicy,
) -> Result<Vec<ScoredRecord>, SimilarityError> {
    let mut scored = Vec::with_capacity(records.len());
    for record in records {
        let score = aggregate_similarity(query, &record.embedding, policy)?;
        scored.push(ScoredRecord { record, score });
    }

    // sort_by is stable, equal scores keep insertion order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);

    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, embedding: Vec<Vec<f32>>) -> BookmarkRecord {
        BookmarkRecord {
            id: id.to_string(),
            title: format!("title {id}"),
            url: None,
            date_added: None,
            content_hash: 0,
            embedding,
        }
    }

    #[test]
    fn test_cosine_symmetric() {
        let pairs = [
            (vec![1.0, 2.0, 3.0], vec![-4.0, 0.5, 2.0]),
            (vec![0.3, 0.0, -1.0], vec![0.3, 0.1, 7.0]),
            (vec![5.0, 5.0, 5.0], vec![1.0, 1.0, 1.0]),
        ];
        for (a, b) in pairs {
            let ab = cosine_similarity(&a, &b).unwrap();
            let ba = cosine_similarity(&b, &a).unwrap();
            assert!((ab - ba).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cosine_self_is_one() {
        let v = vec![0.2, -3.5, 8.0, 1.0];
        let score = cosine_similarity(&v, &v).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_exactly_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&zero, &v).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&v, &zero).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let result = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]);
        assert_eq!(
            result,
            Err(SimilarityError::DimensionMismatch { expected: 2, got: 3 })
        );
    }

    #[test]
    fn test_aggregate_policies_differ() {
        let query = vec![1.0, 0.0];
        let segments = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        let max = aggregate_similarity(&query, &segments, AggregationPolicy::Max).unwrap();
        let avg = aggregate_similarity(&query, &segments, AggregationPolicy::Average).unwrap();

        assert!((max - 1.0).abs() < 1e-6);
        // centroid is (0.5, 0.5)
        assert!((avg - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(max > avg);
    }

    #[test]
    fn test_aggregate_single_segment_equals_cosine() {
        let query = vec![0.4, 0.2, 0.9];
        let segment = vec![0.1, 0.8, 0.3];
        let cosine = cosine_similarity(&query, &segment).unwrap();

        for policy in [AggregationPolicy::Max, AggregationPolicy::Average] {
            let score = aggregate_similarity(&query, &[segment.clone()], policy).unwrap();
            assert!((score - cosine).abs() < 1e-6);
        }
    }

    #[test]
    fn test_aggregate_empty_segments_scores_zero() {
        let query = vec![1.0, 0.0];
        for policy in [AggregationPolicy::Max, AggregationPolicy::Average] {
            assert_eq!(aggregate_similarity(&query, &[], policy).unwrap(), 0.0);
        }
    }

    #[test]
    fn test_rank_sorted_and_truncated() {
        let records = vec![
            record("a", vec![vec![0.0, 1.0]]),
            record("b", vec![vec![1.0, 0.0]]),
            record("c", vec![vec![1.0, 1.0]]),
            record("d", vec![vec![-1.0, 0.0]]),
        ];

        let ranked = rank(&[1.0, 0.0], records, 3, AggregationPolicy::Max).unwrap();

        assert_eq!(ranked.len(), 3);
        let ids: Vec<&str> = ranked.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_rank_ties_keep_insertion_order() {
        let records = vec![
            record("first", vec![vec![2.0, 0.0]]),
            record("second", vec![vec![1.0, 0.0]]),
            record("third", vec![vec![3.0, 0.0]]),
        ];

        let ranked = rank(&[1.0, 0.0], records, 10, AggregationPolicy::Max).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_rank_empty_collection() {
        let ranked = rank(&[1.0, 0.0], vec![], 10, AggregationPolicy::Max).unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_rank_fails_on_stale_dimensions() {
        let records = vec![record("a", vec![vec![1.0, 0.0, 0.0, 0.0]])];
        let result = rank(&[1.0, 0.0], records, 10, AggregationPolicy::Average);
        assert!(matches!(result, Err(SimilarityError::DimensionMismatch { .. })));
    }
}
