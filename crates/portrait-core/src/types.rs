use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Number of points produced by the 68-point landmark model.
pub const LANDMARK_COUNT: usize = 68;

/// Length of a feature vector: all x coordinates followed by all y coordinates.
pub const FEATURE_LEN: usize = 2 * LANDMARK_COUNT;

/// Row id assigned by the store to a painting.
pub type PaintingId = i64;

/// Row id assigned by the store to one detected face of a painting.
pub type LandmarkId = i64;

/// A landmark coordinate in image space, `(x, y)`.
pub type Point = (f64, f64);

/// Face bounding box in image pixels, as reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    /// Clamp the box to an image of the given size and return `(x, y, width, height)`
    /// in whole pixels, or `None` if nothing of the box lies inside the image.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.left.max(0.0).floor();
        let y0 = self.top.max(0.0).floor();
        let x1 = self.right.min(image_width as f64).ceil();
        let y1 = self.bottom.min(image_height as f64).ceil();
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Detector output for one face: a bounding box plus 68 ordered points
/// (contour, eyebrows, nose, eyes, outer lip, inner lip).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLandmarks {
    pub painting_id: PaintingId,
    pub bounding_box: BoundingBox,
    pub points: Vec<Point>,
}

/// Emotion category used to partition the similarity index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprise,
    ];

    /// Stable numeric id, as stored in the `category_id` column.
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.name() == lower)
            .ok_or_else(|| format!("unknown emotion: {s}"))
    }
}

/// A painting whose image has been fetched and saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Painting {
    pub id: PaintingId,
    pub remote_id: String,
    pub source_url: String,
    pub image_ref: PathBuf,
}

/// Normalized fingerprint of one face, the unit of indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedFeature {
    pub landmark_id: LandmarkId,
    pub painting_id: PaintingId,
    pub category: Option<Emotion>,
    /// Region-normalized coordinates, `FEATURE_LEN` long.
    pub vector: Vec<f64>,
    /// Normalized coordinates after pose correction, `FEATURE_LEN` long.
    pub posed_vector: Vec<f64>,
}

/// One k-NN hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub landmark_id: LandmarkId,
    pub painting_id: PaintingId,
    pub distance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_id_roundtrip() {
        for e in Emotion::ALL {
            assert_eq!(Emotion::from_id(e.id()), Some(e));
        }
        assert_eq!(Emotion::from_id(7), None);
    }

    #[test]
    fn test_emotion_parse() {
        assert_eq!("Happy".parse::<Emotion>().unwrap(), Emotion::Happy);
        assert_eq!(" sad ".parse::<Emotion>().unwrap(), Emotion::Sad);
        assert!("bored".parse::<Emotion>().is_err());
    }

    #[test]
    fn test_emotion_serde_lowercase() {
        let json = serde_json::to_string(&Emotion::Surprise).unwrap();
        assert_eq!(json, "\"surprise\"");
    }

    #[test]
    fn test_bbox_clamp_inside() {
        let b = BoundingBox { left: 10.2, top: 20.0, right: 50.0, bottom: 80.7 };
        assert_eq!(b.clamp_to(100, 100), Some((10, 20, 40, 61)));
    }

    #[test]
    fn test_bbox_clamp_overhanging() {
        let b = BoundingBox { left: -15.0, top: -5.0, right: 130.0, bottom: 40.0 };
        assert_eq!(b.clamp_to(100, 100), Some((0, 0, 100, 40)));
    }

    #[test]
    fn test_bbox_clamp_outside() {
        let b = BoundingBox { left: 120.0, top: 0.0, right: 150.0, bottom: 40.0 };
        assert_eq!(b.clamp_to(100, 100), None);
    }
}
