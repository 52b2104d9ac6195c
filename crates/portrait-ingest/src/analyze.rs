//! Face analysis of fetched paintings.
//!
//! For every painting not analyzed yet: decode, detect faces, extract
//! landmarks, normalize and pose-correct them, classify, store one landmark
//! row per face and save the face crop. Writes are committed once per run.

use crate::store::{FaceRecord, RunTransaction, Store, StoreError};
use image::{DynamicImage, ImageFormat, ImageReader};
use portrait_core::{
    normalize, pose, BoundingBox, Classifier, DetectorError, FaceDetector, FaceImage, Painting,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error("face directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalyzeReport {
    pub paintings: usize,
    pub faces: usize,
    /// Faces dropped because their landmarks could not be normalized.
    pub dropped: usize,
    pub without_faces: usize,
    pub unreadable: usize,
}

/// Analyze every pending painting in `store`, saving face crops under `face_dir`.
///
/// A detector that is unavailable aborts the run and nothing is committed.
pub fn run_analysis(
    store: &Store,
    detector: &mut dyn FaceDetector,
    classifier: Option<&dyn Classifier>,
    face_dir: &Path,
) -> Result<AnalyzeReport, AnalyzeError> {
    std::fs::create_dir_all(face_dir)?;
    let pending = store.paintings_pending_analysis()?;
    tracing::info!(paintings = pending.len(), "starting analysis");

    let tx = RunTransaction::begin(store)?;
    let mut report = AnalyzeReport::default();
    for painting in &pending {
        let faces = analyze_painting(store, detector, classifier, face_dir, painting, &mut report)?;
        if faces == 0 {
            report.without_faces += 1;
        }
        store.mark_analyzed(painting.id)?;
        report.paintings += 1;
    }
    tx.commit()?;

    tracing::info!(
        paintings = report.paintings,
        faces = report.faces,
        dropped = report.dropped,
        "analysis finished"
    );
    Ok(report)
}

/// Returns the number of faces stored for the painting.
fn analyze_painting(
    store: &Store,
    detector: &mut dyn FaceDetector,
    classifier: Option<&dyn Classifier>,
    face_dir: &Path,
    painting: &Painting,
    report: &mut AnalyzeReport,
) -> Result<usize, AnalyzeError> {
    let image = match decode(&painting.image_ref) {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!(painting_id = painting.id, path = %painting.image_ref.display(), error = %e, "cannot decode painting");
            report.unreadable += 1;
            return Ok(0);
        }
    };
    let input = FaceImage { path: &painting.image_ref, image: &image };

    let boxes = match detector.detect(&input) {
        Ok(boxes) => boxes,
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            tracing::warn!(painting_id = painting.id, error = %e, "face detection failed");
            report.unreadable += 1;
            return Ok(0);
        }
    };

    let mut stored = 0;
    for (index, bbox) in boxes.iter().enumerate() {
        let points = match detector.landmarks(&input, bbox) {
            Ok(points) => points,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(painting_id = painting.id, index, error = %e, "no landmarks for face");
                report.dropped += 1;
                continue;
            }
        };

        let vectors = normalize(&points).and_then(|vector| Ok((vector, pose(&points)?)));
        let (vector, posed_vector) = match vectors {
            Ok(v) => v,
            Err(e) => {
                if e.is_degenerate() {
                    tracing::info!(painting_id = painting.id, index, error = %e, "dropping face");
                } else {
                    tracing::warn!(painting_id = painting.id, index, error = %e, "malformed landmarks");
                }
                report.dropped += 1;
                continue;
            }
        };

        let category = classifier.and_then(|c| c.predict(&posed_vector));
        let face_ref = save_face(&image, bbox, face_dir, &painting.remote_id, index);
        let landmark_id = store.insert_face(&FaceRecord {
            painting_id: painting.id,
            bounding_box: *bbox,
            points,
            category,
            vector,
            posed_vector,
            face_ref,
        })?;
        tracing::debug!(painting_id = painting.id, landmark_id, category = ?category, "face stored");
        stored += 1;
    }
    report.faces += stored;
    Ok(stored)
}

/// Decode by content; fetched paintings are saved as `.jpg` whatever their format.
fn decode(path: &Path) -> Result<DynamicImage, image::ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

/// Crop the face out of the painting and save it as JPEG. Failures only lose the crop.
fn save_face(
    image: &DynamicImage,
    bbox: &BoundingBox,
    face_dir: &Path,
    remote_id: &str,
    index: usize,
) -> Option<PathBuf> {
    let Some((x, y, w, h)) = bbox.clamp_to(image.width(), image.height()) else {
        tracing::warn!(remote_id, index, "face box lies outside the image");
        return None;
    };
    let path = face_dir.join(format!("{remote_id}_{index}.jpg"));
    let crop = image.crop_imm(x, y, w, h).to_rgb8();
    match crop.save_with_format(&path, ImageFormat::Jpeg) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(remote_id, index, error = %e, "cannot save face crop");
            None
        }
    }
}
