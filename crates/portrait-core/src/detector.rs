//! Boundary to the external face detector, landmark model and emotion classifier.
//!
//! The models themselves live outside this crate. `SidecarDetector` consumes
//! their output from JSON files written next to each image.

use crate::types::{BoundingBox, Emotion, Point};
use image::DynamicImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix appended to an image's file name to locate its landmark sidecar.
pub const SIDECAR_SUFFIX: &str = ".landmarks.json";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("malformed detector output for {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("no landmarks for the requested bounding box")]
    UnknownFace,
}

impl DetectorError {
    /// The detector cannot run at all, as opposed to failing on one image.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectorError::Unavailable(_))
    }
}

/// An image handed to the detector, with the path it was loaded from.
pub struct FaceImage<'a> {
    pub path: &'a Path,
    pub image: &'a DynamicImage,
}

/// Face detection plus 68-point landmark extraction.
pub trait FaceDetector {
    fn detect(&mut self, input: &FaceImage<'_>) -> Result<Vec<BoundingBox>, DetectorError>;

    fn landmarks(
        &mut self,
        input: &FaceImage<'_>,
        bbox: &BoundingBox,
    ) -> Result<Vec<Point>, DetectorError>;
}

/// Predicts an emotion category from a pose-corrected feature vector.
pub trait Classifier {
    fn predict(&self, posed_vector: &[f64]) -> Option<Emotion>;
}

#[derive(Debug, Clone, Deserialize)]
struct SidecarFace {
    bbox: BoundingBox,
    points: Vec<Point>,
}

/// Reads detector output from `<dir>/<image file name>.landmarks.json`.
///
/// Each sidecar holds a JSON list of `{ "bbox": {...}, "points": [[x, y], ...] }`.
/// An image without a sidecar has no faces.
pub struct SidecarDetector {
    dir: PathBuf,
    current: Option<(PathBuf, Vec<SidecarFace>)>,
}

impl SidecarDetector {
    pub fn open(dir: &Path) -> Result<Self, DetectorError> {
        if !dir.is_dir() {
            return Err(DetectorError::Unavailable(format!(
                "landmark directory not found: {}",
                dir.display()
            )));
        }
        tracing::info!(dir = %dir.display(), "using landmark sidecars");
        Ok(Self { dir: dir.to_path_buf(), current: None })
    }

    fn sidecar_path(&self, image_path: &Path) -> Option<PathBuf> {
        let name = image_path.file_name()?.to_str()?;
        Some(self.dir.join(format!("{name}{SIDECAR_SUFFIX}")))
    }

    fn load(&mut self, image_path: &Path) -> Result<&[SidecarFace], DetectorError> {
        let cached = matches!(&self.current, Some((p, _)) if p == image_path);
        if !cached {
            let faces = self.read_sidecar(image_path)?;
            self.current = Some((image_path.to_path_buf(), faces));
        }
        Ok(self.current.as_ref().map(|(_, f)| f.as_slice()).unwrap_or(&[]))
    }

    fn read_sidecar(&self, image_path: &Path) -> Result<Vec<SidecarFace>, DetectorError> {
        let Some(path) = self.sidecar_path(image_path) else {
            return Ok(Vec::new());
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DetectorError::Unavailable(format!("{}: {e}", path.display())));
            }
        };
        serde_json::from_str(&raw).map_err(|e| DetectorError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

impl FaceDetector for SidecarDetector {
    fn detect(&mut self, input: &FaceImage<'_>) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.load(input.path)?.iter().map(|f| f.bbox).collect())
    }

    fn landmarks(
        &mut self,
        input: &FaceImage<'_>,
        bbox: &BoundingBox,
    ) -> Result<Vec<Point>, DetectorError> {
        self.load(input.path)?
            .iter()
            .find(|f| f.bbox == *bbox)
            .map(|f| f.points.clone())
            .ok_or(DetectorError::UnknownFace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(4, 4)
    }

    #[test]
    fn test_open_missing_dir_is_unavailable() {
        let err = SidecarDetector::open(Path::new("/nonexistent/portrait-sidecars")).err().unwrap();
        assert!(matches!(err, DetectorError::Unavailable(_)));
    }

    #[test]
    fn test_missing_sidecar_means_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let mut det = SidecarDetector::open(dir.path()).unwrap();
        let img = blank();
        let input = FaceImage { path: Path::new("/paintings/00001.jpg"), image: &img };
        assert!(det.detect(&input).unwrap().is_empty());
    }

    #[test]
    fn test_reads_faces_and_landmarks() {
        let dir = tempfile::tempdir().unwrap();
        let points: Vec<[f64; 2]> = (0..68).map(|i| [i as f64, 2.0 * i as f64]).collect();
        let json = serde_json::json!([
            { "bbox": { "left": 1.0, "top": 2.0, "right": 30.0, "bottom": 40.0 }, "points": points },
        ]);
        std::fs::write(dir.path().join("00001.jpg.landmarks.json"), json.to_string()).unwrap();

        let mut det = SidecarDetector::open(dir.path()).unwrap();
        let img = blank();
        let input = FaceImage { path: Path::new("/paintings/00001.jpg"), image: &img };

        let boxes = det.detect(&input).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].right, 30.0);

        let pts = det.landmarks(&input, &boxes[0]).unwrap();
        assert_eq!(pts.len(), 68);
        assert_eq!(pts[5], (5.0, 10.0));

        let other = BoundingBox { left: 0.0, top: 0.0, right: 1.0, bottom: 1.0 };
        assert!(matches!(det.landmarks(&input, &other), Err(DetectorError::UnknownFace)));
    }

    #[test]
    fn test_malformed_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.jpg.landmarks.json"), "{not json").unwrap();
        let mut det = SidecarDetector::open(dir.path()).unwrap();
        let img = blank();
        let input = FaceImage { path: Path::new("bad.jpg"), image: &img };
        assert!(matches!(det.detect(&input), Err(DetectorError::Malformed { .. })));
    }
}
