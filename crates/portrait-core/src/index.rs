//! Category-partitioned k-nearest-neighbour index over normalized features.

use crate::landmarks::{region_slices, Region, REGIONS};
use crate::types::{Emotion, LandmarkId, Match, NormalizedFeature, PaintingId, FEATURE_LEN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("feature vector has length {actual}, expected {FEATURE_LEN}")]
    DimensionMismatch { actual: usize },
}

/// Per-region weights of the comparison metric.
///
/// Eyes and lips carry most of a face's expression and outweigh the contour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionWeights {
    pub contour: f64,
    pub eyebrow_left: f64,
    pub eyebrow_right: f64,
    pub nose: f64,
    pub eye_left: f64,
    pub eye_right: f64,
    pub outer_lip: f64,
    pub inner_lip: f64,
}

impl Default for RegionWeights {
    fn default() -> Self {
        Self {
            contour: 1.0,
            eyebrow_left: 5.0,
            eyebrow_right: 5.0,
            nose: 0.7,
            eye_left: 9.3,
            eye_right: 9.3,
            outer_lip: 8.0,
            inner_lip: 10.0,
        }
    }
}

impl RegionWeights {
    /// Every region weighted 1.0.
    pub fn uniform() -> Self {
        Self {
            contour: 1.0,
            eyebrow_left: 1.0,
            eyebrow_right: 1.0,
            nose: 1.0,
            eye_left: 1.0,
            eye_right: 1.0,
            outer_lip: 1.0,
            inner_lip: 1.0,
        }
    }

    pub fn weight(&self, region: Region) -> f64 {
        match region {
            Region::Contour => self.contour,
            Region::EyebrowLeft => self.eyebrow_left,
            Region::EyebrowRight => self.eyebrow_right,
            Region::Nose => self.nose,
            Region::EyeLeft => self.eye_left,
            Region::EyeRight => self.eye_right,
            Region::OuterLip => self.outer_lip,
            Region::InnerLip => self.inner_lip,
        }
    }
}

/// Distance between two feature vectors.
pub trait Metric {
    fn distance(&self, a: &[f64], b: &[f64]) -> f64;
}

impl Metric for RegionWeights {
    /// Weighted sum of per-region Euclidean distances. Both vectors must be
    /// `FEATURE_LEN` long.
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        REGIONS
            .iter()
            .map(|span| {
                let (ax, ay) = region_slices(a, span);
                let (bx, by) = region_slices(b, span);
                let squared: f64 = ax
                    .iter()
                    .zip(bx)
                    .chain(ay.iter().zip(by))
                    .map(|(p, q)| (p - q).powi(2))
                    .sum();
                self.weight(span.region) * squared.sqrt()
            })
            .sum()
    }
}

struct Entry {
    landmark_id: LandmarkId,
    painting_id: PaintingId,
    vector: Vec<f64>,
}

/// Immutable index built from a snapshot of normalized features.
///
/// Features are partitioned by category; a query only sees entries of the
/// category it asks for. Features without a category form their own
/// partition, so an index built without categories is a single global one.
pub struct SimilarityIndex<M: Metric = RegionWeights> {
    metric: M,
    partitions: BTreeMap<Option<Emotion>, Vec<Entry>>,
}

impl<M: Metric> SimilarityIndex<M> {
    /// Build an index owning a copy of every feature's normalized vector.
    pub fn build(features: &[NormalizedFeature], metric: M) -> Result<Self, IndexError> {
        let mut partitions: BTreeMap<Option<Emotion>, Vec<Entry>> = BTreeMap::new();
        for feature in features {
            check_len(&feature.vector)?;
            partitions.entry(feature.category).or_default().push(Entry {
                landmark_id: feature.landmark_id,
                painting_id: feature.painting_id,
                vector: feature.vector.clone(),
            });
        }

        tracing::debug!(
            entries = features.len(),
            partitions = partitions.len(),
            "similarity index built"
        );

        Ok(Self { metric, partitions })
    }

    /// The `k` entries of `category` closest to `vector`, nearest first.
    ///
    /// Equal distances keep insertion order. An empty or unknown category
    /// yields an empty list.
    pub fn query(
        &self,
        vector: &[f64],
        category: Option<Emotion>,
        k: usize,
    ) -> Result<Vec<Match>, IndexError> {
        check_len(vector)?;
        let Some(entries) = self.partitions.get(&category) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<Match> = entries
            .iter()
            .map(|e| Match {
                landmark_id: e.landmark_id,
                painting_id: e.painting_id,
                distance: self.metric.distance(vector, &e.vector),
            })
            .collect();
        // Stable sort: ties stay in insertion order.
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(k);
        Ok(matches)
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries per category partition.
    pub fn partition_sizes(&self) -> Vec<(Option<Emotion>, usize)> {
        self.partitions.iter().map(|(c, e)| (*c, e.len())).collect()
    }
}

fn check_len(vector: &[f64]) -> Result<(), IndexError> {
    if vector.len() != FEATURE_LEN {
        return Err(IndexError::DimensionMismatch { actual: vector.len() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LANDMARK_COUNT;

    fn feature(landmark_id: LandmarkId, category: Option<Emotion>, vector: Vec<f64>) -> NormalizedFeature {
        NormalizedFeature {
            landmark_id,
            painting_id: landmark_id * 10,
            category,
            posed_vector: vector.clone(),
            vector,
        }
    }

    /// A vector at exactly `d` uniform-metric distance from the zero vector:
    /// only the first contour x coordinate is non-zero.
    fn at_distance(d: f64) -> Vec<f64> {
        let mut v = vec![0.0; FEATURE_LEN];
        v[0] = d;
        v
    }

    fn pseudo_random_vector(seed: u64) -> Vec<f64> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..FEATURE_LEN)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_metric_identity_and_symmetry() {
        let w = RegionWeights::default();
        for seed in 0..8 {
            let a = pseudo_random_vector(seed);
            let b = pseudo_random_vector(seed + 100);
            assert_eq!(w.distance(&a, &a), 0.0);
            assert_eq!(w.distance(&a, &b), w.distance(&b, &a));
            assert!(w.distance(&a, &b) > 0.0);
        }
    }

    #[test]
    fn test_metric_is_per_region_not_flat() {
        // Two unit offsets in the same region add in quadrature; in different
        // regions they add linearly.
        let w = RegionWeights::uniform();
        let zero = vec![0.0; FEATURE_LEN];

        let mut same = zero.clone();
        same[0] = 1.0;
        same[LANDMARK_COUNT] = 1.0;
        assert!((w.distance(&zero, &same) - 2f64.sqrt()).abs() < 1e-12);

        let mut split = zero.clone();
        split[0] = 1.0;
        split[60] = 1.0;
        assert!((w.distance(&zero, &split) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_metric_applies_region_weight() {
        let w = RegionWeights::default();
        let zero = vec![0.0; FEATURE_LEN];
        let mut lip = zero.clone();
        lip[LANDMARK_COUNT + 62] = 0.5;
        assert!((w.distance(&zero, &lip) - 0.5 * w.inner_lip).abs() < 1e-12);
    }

    #[test]
    fn test_query_scenario_three_items() {
        let corpus = vec![
            feature(1, None, at_distance(1.0)),
            feature(2, None, at_distance(5.0)),
            feature(3, None, at_distance(2.0)),
        ];
        let index = SimilarityIndex::build(&corpus, RegionWeights::uniform()).unwrap();
        let result = index.query(&at_distance(0.0), None, 2).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].landmark_id, 1);
        assert!((result[0].distance - 1.0).abs() < 1e-12);
        assert_eq!(result[1].landmark_id, 3);
        assert!((result[1].distance - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_query_non_decreasing_and_small_corpus() {
        let corpus: Vec<_> = (0..5).map(|i| feature(i, None, pseudo_random_vector(i as u64))).collect();
        let index = SimilarityIndex::build(&corpus, RegionWeights::default()).unwrap();
        let result = index.query(&pseudo_random_vector(42), None, 10).unwrap();

        assert_eq!(result.len(), 5);
        for pair in result.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_query_ties_keep_insertion_order() {
        let corpus = vec![
            feature(7, None, at_distance(3.0)),
            feature(4, None, at_distance(-3.0)),
            feature(9, None, at_distance(3.0)),
        ];
        let index = SimilarityIndex::build(&corpus, RegionWeights::uniform()).unwrap();
        let ids: Vec<_> = index
            .query(&at_distance(0.0), None, 3)
            .unwrap()
            .iter()
            .map(|m| m.landmark_id)
            .collect();
        assert_eq!(ids, vec![7, 4, 9]);
    }

    #[test]
    fn test_query_restricted_to_category() {
        let corpus = vec![
            feature(1, Some(Emotion::Happy), at_distance(4.0)),
            feature(2, Some(Emotion::Sad), at_distance(0.5)),
            feature(3, Some(Emotion::Happy), at_distance(1.0)),
        ];
        let index = SimilarityIndex::build(&corpus, RegionWeights::uniform()).unwrap();

        let happy = index.query(&at_distance(0.0), Some(Emotion::Happy), 5).unwrap();
        assert_eq!(happy.iter().map(|m| m.landmark_id).collect::<Vec<_>>(), vec![3, 1]);

        assert!(index.query(&at_distance(0.0), Some(Emotion::Fear), 5).unwrap().is_empty());
        assert!(index.query(&at_distance(0.0), None, 5).unwrap().is_empty());
        assert_eq!(
            index.partition_sizes(),
            vec![(Some(Emotion::Happy), 2), (Some(Emotion::Sad), 1)]
        );
    }

    #[test]
    fn test_empty_index_returns_no_matches() {
        let index = SimilarityIndex::build(&[], RegionWeights::default()).unwrap();
        assert!(index.is_empty());
        assert!(index.query(&at_distance(0.0), None, 3).unwrap().is_empty());
    }

    #[test]
    fn test_k_zero() {
        let corpus = vec![feature(1, None, at_distance(1.0))];
        let index = SimilarityIndex::build(&corpus, RegionWeights::uniform()).unwrap();
        assert!(index.query(&at_distance(0.0), None, 0).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let corpus = vec![feature(1, None, vec![0.0; 10])];
        assert!(matches!(
            SimilarityIndex::build(&corpus, RegionWeights::default()),
            Err(IndexError::DimensionMismatch { actual: 10 })
        ));

        let index = SimilarityIndex::build(&[], RegionWeights::default()).unwrap();
        assert_eq!(
            index.query(&[1.0, 2.0], None, 1).unwrap_err(),
            IndexError::DimensionMismatch { actual: 2 }
        );
    }

    #[test]
    fn test_weights_partial_override() {
        let w: RegionWeights = serde_json::from_str(r#"{"inner_lip": 12.5}"#).unwrap();
        assert_eq!(w.inner_lip, 12.5);
        assert_eq!(w.contour, RegionWeights::default().contour);
    }
}
