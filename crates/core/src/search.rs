//! Similarity ranking over stored chunk embeddings.
//!
//! The knowledge-base manager only depends on the [`VectorSearch`] contract
//! (`search(query, candidates, k) -> ranked positions`). [`ExactSearch`] is the
//! brute-force implementation used by default; an approximate index can be
//! swapped in behind the same trait.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    Cosine,
    InnerProduct,
}

impl std::str::FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "inner_product" | "dot" => Ok(Self::InnerProduct),
            other => Err(format!("unsupported similarity metric `{other}`")),
        }
    }
}

/// A ranked candidate: `position` indexes into the candidate slice handed to
/// [`VectorSearch::search`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchHit {
    pub position: usize,
    pub score: f32,
}

pub trait VectorSearch: Send + Sync {
    /// Returns at most `k` hits ordered by non-increasing score. Equal scores
    /// keep candidate order, so earlier candidates win ties.
    fn search(&self, query: &[f32], candidates: &[&[f32]], k: usize) -> Vec<SearchHit>;
}

#[derive(Clone, Copy, Debug)]
pub struct ExactSearch {
    metric: SimilarityMetric,
}

impl ExactSearch {
    pub fn new(metric: SimilarityMetric) -> Self {
        Self { metric }
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }
}

impl Default for ExactSearch {
    fn default() -> Self {
        Self::new(SimilarityMetric::Cosine)
    }
}

impl VectorSearch for ExactSearch {
    fn search(&self, query: &[f32], candidates: &[&[f32]], k: usize) -> Vec<SearchHit> {
        if k == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let mut hits = candidates
            .iter()
            .enumerate()
            .map(|(position, candidate)| SearchHit {
                position,
                score: score(self.metric, query, candidate),
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| {
            right
                .score
                .partial_cmp(&left.score)
                .unwrap_or(Ordering::Equal)
                .then(left.position.cmp(&right.position))
        });
        hits.truncate(k);
        hits
    }
}

pub fn score(metric: SimilarityMetric, left: &[f32], right: &[f32]) -> f32 {
    let value = match metric {
        SimilarityMetric::Cosine => cosine_similarity(left, right),
        SimilarityMetric::InnerProduct => inner_product(left, right),
    };
    value.filter(|score| score.is_finite()).unwrap_or(f32::NEG_INFINITY)
}

fn inner_product(left: &[f32], right: &[f32]) -> Option<f32> {
    if left.len() != right.len() || left.is_empty() {
        return None;
    }
    let dot = left
        .iter()
        .zip(right.iter())
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum::<f64>();
    Some(dot as f32)
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> Option<f32> {
    if left.len() != right.len() || left.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_left = 0.0f64;
    let mut norm_right = 0.0f64;
    for (&x, &y) in left.iter().zip(right.iter()) {
        let x64 = f64::from(x);
        let y64 = f64::from(y);
        dot += x64 * y64;
        norm_left += x64 * x64;
        norm_right += y64 * y64;
    }

    let denom = norm_left.sqrt() * norm_right.sqrt();
    if denom <= f64::EPSILON {
        Some(0.0)
    } else {
        Some((dot / denom) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::{score, ExactSearch, SimilarityMetric, VectorSearch};

    #[test]
    fn ranks_by_descending_cosine_similarity() {
        let search = ExactSearch::new(SimilarityMetric::Cosine);
        let candidates: Vec<&[f32]> = vec![&[0.0, 1.0], &[1.0, 0.0], &[0.7, 0.7]];

        let hits = search.search(&[1.0, 0.1], &candidates, 3);

        let positions = hits.iter().map(|hit| hit.position).collect::<Vec<_>>();
        assert_eq!(positions, vec![1, 2, 0]);
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn never_returns_more_than_k() {
        let search = ExactSearch::default();
        let candidates: Vec<&[f32]> = vec![&[1.0], &[1.0], &[1.0], &[1.0]];

        assert_eq!(search.search(&[1.0], &candidates, 2).len(), 2);
        assert!(search.search(&[1.0], &candidates, 0).is_empty());
    }

    #[test]
    fn ties_are_broken_by_insertion_order() {
        let search = ExactSearch::default();
        let candidates: Vec<&[f32]> = vec![&[0.0, 1.0], &[2.0, 0.0], &[1.0, 0.0], &[3.0, 0.0]];

        let hits = search.search(&[1.0, 0.0], &candidates, 3);

        let positions = hits.iter().map(|hit| hit.position).collect::<Vec<_>>();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn inner_product_rewards_magnitude() {
        let search = ExactSearch::new(SimilarityMetric::InnerProduct);
        let candidates: Vec<&[f32]> = vec![&[1.0, 0.0], &[3.0, 0.0]];

        let hits = search.search(&[1.0, 0.0], &candidates, 2);
        assert_eq!(hits[0].position, 1);
        assert_eq!(hits[0].score, 3.0);
    }

    #[test]
    fn mismatched_dimensions_rank_last() {
        assert_eq!(score(SimilarityMetric::Cosine, &[1.0, 0.0], &[1.0]), f32::NEG_INFINITY);
        assert_eq!(score(SimilarityMetric::Cosine, &[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn metric_parses_from_config_strings() {
        assert_eq!("cosine".parse::<SimilarityMetric>(), Ok(SimilarityMetric::Cosine));
        assert_eq!("inner_product".parse::<SimilarityMetric>(), Ok(SimilarityMetric::InnerProduct));
        assert!("euclid".parse::<SimilarityMetric>().is_err());
    }
}
