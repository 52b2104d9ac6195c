//! portrait-core: Facial-geometry fingerprints and painting retrieval.
//!
//! Turns 68-point landmark sets into region-normalized feature vectors,
//! corrects in-plane pose against a canonical face, and answers weighted
//! k-nearest-neighbour queries partitioned by emotion category.

pub mod alignment;
pub mod detector;
pub mod index;
pub mod landmarks;
pub mod types;

pub use alignment::pose;
pub use detector::{Classifier, DetectorError, FaceDetector, FaceImage, SidecarDetector};
pub use index::{IndexError, Metric, RegionWeights, SimilarityIndex};
pub use landmarks::{normalize, NormalizeError, Region};
pub use types::{
    BoundingBox, Emotion, LandmarkId, Match, NormalizedFeature, Painting, PaintingId, Point,
    RawLandmarks, FEATURE_LEN, LANDMARK_COUNT,
};
