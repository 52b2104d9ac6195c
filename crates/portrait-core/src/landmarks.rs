//! Per-region landmark normalization.
//!
//! Each anatomical region of the 68-point layout is translated and scaled
//! independently so that the region's leftmost anchor lands on x = -1, its
//! rightmost anchor on x = +1 and its mean y on 0. This removes the face's
//! position and size in the source image while keeping the region's shape.

use crate::types::{Point, FEATURE_LEN, LANDMARK_COUNT};
use std::fmt;
use thiserror::Error;

/// Normalized x coordinate of every region's leftmost anchor.
pub const SPAN_MIN: f64 = -1.0;
/// Normalized x coordinate of every region's rightmost anchor.
pub const SPAN_MAX: f64 = 1.0;

/// Horizontal extents below this are treated as collapsed geometry.
const DEGENERATE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Contour,
    EyebrowLeft,
    EyebrowRight,
    Nose,
    EyeLeft,
    EyeRight,
    OuterLip,
    InnerLip,
}

/// Index range and x anchors of one region. `end` is exclusive.
#[derive(Debug, Clone, Copy)]
pub struct RegionSpan {
    pub region: Region,
    pub start: usize,
    pub end: usize,
    pub leftmost: usize,
    pub rightmost: usize,
}

pub const REGIONS: [RegionSpan; 8] = [
    RegionSpan { region: Region::Contour, start: 0, end: 17, leftmost: 0, rightmost: 16 },
    RegionSpan { region: Region::EyebrowLeft, start: 17, end: 22, leftmost: 17, rightmost: 21 },
    RegionSpan { region: Region::EyebrowRight, start: 22, end: 27, leftmost: 22, rightmost: 26 },
    RegionSpan { region: Region::Nose, start: 27, end: 36, leftmost: 31, rightmost: 35 },
    RegionSpan { region: Region::EyeLeft, start: 36, end: 42, leftmost: 36, rightmost: 39 },
    RegionSpan { region: Region::EyeRight, start: 42, end: 48, leftmost: 42, rightmost: 45 },
    RegionSpan { region: Region::OuterLip, start: 48, end: 60, leftmost: 48, rightmost: 54 },
    RegionSpan { region: Region::InnerLip, start: 60, end: 68, leftmost: 60, rightmost: 64 },
];

impl Region {
    pub const ALL: [Region; 8] = [
        Region::Contour,
        Region::EyebrowLeft,
        Region::EyebrowRight,
        Region::Nose,
        Region::EyeLeft,
        Region::EyeRight,
        Region::OuterLip,
        Region::InnerLip,
    ];

    pub fn span(self) -> &'static RegionSpan {
        &REGIONS[self as usize]
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::Contour => "contour",
            Region::EyebrowLeft => "left eyebrow",
            Region::EyebrowRight => "right eyebrow",
            Region::Nose => "nose",
            Region::EyeLeft => "left eye",
            Region::EyeRight => "right eye",
            Region::OuterLip => "outer lip",
            Region::InnerLip => "inner lip",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("expected {LANDMARK_COUNT} landmark points, got {0}")]
    WrongPointCount(usize),
    #[error("landmark {0} has a non-finite coordinate")]
    NonFinite(usize),
    #[error("degenerate geometry: {0} anchors share the same x coordinate")]
    DegenerateGeometry(Region),
    #[error("degenerate geometry: pose anchors are collinear")]
    CollinearAnchors,
}

impl NormalizeError {
    /// Whether the error comes from the landmarks' shape rather than malformed input.
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::DegenerateGeometry(_) | Self::CollinearAnchors)
    }
}

/// Normalize 68 raw landmark points into a `FEATURE_LEN` vector laid out
/// as all x coordinates followed by all y coordinates.
pub fn normalize(points: &[Point]) -> Result<Vec<f64>, NormalizeError> {
    if points.len() != LANDMARK_COUNT {
        return Err(NormalizeError::WrongPointCount(points.len()));
    }
    if let Some(idx) = points.iter().position(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(NormalizeError::NonFinite(idx));
    }

    let mut out = Vec::with_capacity(FEATURE_LEN);
    out.extend(points.iter().map(|p| p.0));
    out.extend(points.iter().map(|p| p.1));

    let (xs, ys) = out.split_at_mut(LANDMARK_COUNT);
    for span in &REGIONS {
        normalize_region(
            &mut xs[span.start..span.end],
            &mut ys[span.start..span.end],
            span,
        )?;
    }

    Ok(out)
}

fn normalize_region(xs: &mut [f64], ys: &mut [f64], span: &RegionSpan) -> Result<(), NormalizeError> {
    let origin_x = xs[span.leftmost - span.start];
    let extent = xs[span.rightmost - span.start] - origin_x;
    if extent.abs() < DEGENERATE_EPSILON {
        return Err(NormalizeError::DegenerateGeometry(span.region));
    }

    let mean_y = ys.iter().sum::<f64>() / ys.len() as f64;
    let scale = (SPAN_MAX - SPAN_MIN) / extent;

    for x in xs.iter_mut() {
        *x = (*x - origin_x) * scale + SPAN_MIN;
    }
    // y shares the x scale so the region keeps its aspect ratio.
    for y in ys.iter_mut() {
        *y = (*y - mean_y) * scale;
    }
    Ok(())
}

/// The x and y coordinate slices of `region` within a feature vector.
pub fn region_slices<'a>(vector: &'a [f64], span: &RegionSpan) -> (&'a [f64], &'a [f64]) {
    let (xs, ys) = vector.split_at(LANDMARK_COUNT);
    (&xs[span.start..span.end], &ys[span.start..span.end])
}
