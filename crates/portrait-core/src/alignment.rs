//! In-plane pose correction against a canonical face template.
//!
//! Three anchors (outer corner of each eye, bottom centre of the lower lip)
//! define an exact affine map onto the same anchors of the OpenFace mean
//! face. The linear part of that map is applied to all 68 points, and the
//! result is region-normalized like any other face.

use crate::landmarks::{normalize, NormalizeError};
use crate::types::{Point, LANDMARK_COUNT};
use std::sync::OnceLock;

/// Landmark indices used as pose anchors: outer left eye, outer right eye, bottom lip.
pub const POSE_ANCHORS: [usize; 3] = [36, 45, 57];

/// Template anchors are scaled from the unit square to this size.
const TEMPLATE_SCALE: f64 = 100.0;

/// Pivots below this fraction of the largest matrix entry count as singular.
const SINGULAR_PIVOT: f64 = 1e-9;

/// OpenFace mean face for the 68-point layout (align_dlib.py).
const TEMPLATE_RAW: [Point; LANDMARK_COUNT] = [
    (0.0792396913815, 0.339223741112), (0.0829219487236, 0.456955367943),
    (0.0967927109165, 0.575648016728), (0.122141515615, 0.691921601066),
    (0.168687863544, 0.800341263616), (0.239789390707, 0.895732504778),
    (0.325662452515, 0.977068762493), (0.422318282013, 1.04329000149),
    (0.531777802068, 1.06080371126), (0.641296298053, 1.03981924107),
    (0.738105872266, 0.972268833998), (0.824444363295, 0.889624082279),
    (0.894792677532, 0.792494155836), (0.939395486253, 0.681546643421),
    (0.96111933829, 0.562238253072), (0.970579841181, 0.441758925744),
    (0.971193274221, 0.322118743967), (0.163846223133, 0.249151738053),
    (0.21780354657, 0.204255863861), (0.291299351124, 0.192367318323),
    (0.367460241458, 0.203582210627), (0.4392945113, 0.233135599851),
    (0.586445962425, 0.228141644834), (0.660152671635, 0.195923841854),
    (0.737466449096, 0.182360984545), (0.813236546239, 0.192828009114),
    (0.8707571886, 0.235293377042), (0.51534533827, 0.31863546193),
    (0.516221448289, 0.396200446263), (0.517118861835, 0.473797687758),
    (0.51816430343, 0.553157797772), (0.433701156035, 0.604054457668),
    (0.475501237769, 0.62076344024), (0.520712933176, 0.634268222208),
    (0.565874114041, 0.618796581487), (0.607054002672, 0.60157671656),
    (0.252418718401, 0.331052263829), (0.298663015648, 0.302646354002),
    (0.355749724218, 0.303020650651), (0.403718978315, 0.33867711083),
    (0.352507175597, 0.349987615384), (0.296791759886, 0.350478978225),
    (0.631326076346, 0.334136672344), (0.679073381078, 0.29645404267),
    (0.73597236153, 0.294721285802), (0.782865376271, 0.321305281656),
    (0.740312274764, 0.341849376713), (0.68499850091, 0.343734332172),
    (0.353167761422, 0.746189164237), (0.414587777921, 0.719053835073),
    (0.477677654595, 0.706835892494), (0.522732900812, 0.717092275768),
    (0.569832064287, 0.705414478982), (0.635195811927, 0.71565572516),
    (0.69951672331, 0.739419187253), (0.639447159575, 0.805236879972),
    (0.576410514055, 0.835436670169), (0.525398405766, 0.841706377792),
    (0.47641545769, 0.837505914975), (0.41379548902, 0.810045601727),
    (0.380084785646, 0.749979603086), (0.477955996282, 0.74513234612),
    (0.523389793327, 0.748924302636), (0.571057789237, 0.74332894691),
    (0.672409137852, 0.744177032192), (0.572539621444, 0.776609286626),
    (0.5240106503, 0.783370783245), (0.477561227414, 0.778476346951),
];

static TEMPLATE: OnceLock<[Point; LANDMARK_COUNT]> = OnceLock::new();

/// The mean face min-max normalized to the unit square, computed once.
pub fn canonical_template() -> &'static [Point; LANDMARK_COUNT] {
    TEMPLATE.get_or_init(|| {
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(x, y) in &TEMPLATE_RAW {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        TEMPLATE_RAW.map(|(x, y)| ((x - min_x) / (max_x - min_x), (y - min_y) / (max_y - min_y)))
    })
}

fn template_anchors() -> [Point; 3] {
    let template = canonical_template();
    POSE_ANCHORS.map(|i| (template[i].0 * TEMPLATE_SCALE, template[i].1 * TEMPLATE_SCALE))
}

/// Linear part of the affine map taking `src` anchors onto `dst` anchors.
///
/// Returns `[[a, b], [c, d]]` with `x' = a·x + b·y`, `y' = c·x + d·y`.
/// The translation is dropped: region normalization recentres every region.
fn estimate_linear_map(src: &[Point; 3], dst: &[Point; 3]) -> Option<[[f64; 2]; 2]> {
    // Each output row solves [sx, sy, 1] · [p, q, t]^T = d for the three anchors.
    let m = src.map(|(x, y)| [x, y, 1.0]);
    let row_x = solve_3x3(m, dst.map(|p| p.0))?;
    let row_y = solve_3x3(m, dst.map(|p| p.1))?;
    Some([[row_x[0], row_x[1]], [row_y[0], row_y[1]]])
}

/// Solve a 3×3 linear system via Gaussian elimination with partial pivoting.
/// Returns `None` when the system is singular.
#[allow(clippy::needless_range_loop)]
fn solve_3x3(a: [[f64; 3]; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let magnitude = a.iter().flatten().fold(1.0f64, |acc, v| acc.max(v.abs()));
    let mut m = [[0.0f64; 4]; 3];
    for i in 0..3 {
        m[i][..3].copy_from_slice(&a[i]);
        m[i][3] = b[i];
    }

    for col in 0..3 {
        let mut max_row = col;
        for row in (col + 1)..3 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < SINGULAR_PIVOT * magnitude {
            return None;
        }
        for row in (col + 1)..3 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 3];
    for i in (0..3).rev() {
        x[i] = m[i][3];
        for j in (i + 1)..3 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    Some(x)
}

/// Pose-correct raw landmarks onto the canonical template, then normalize.
pub fn pose(points: &[Point]) -> Result<Vec<f64>, NormalizeError> {
    if points.len() != LANDMARK_COUNT {
        return Err(NormalizeError::WrongPointCount(points.len()));
    }
    let src = POSE_ANCHORS.map(|i| points[i]);
    let [[a, b], [c, d]] =
        estimate_linear_map(&src, &template_anchors()).ok_or(NormalizeError::CollinearAnchors)?;

    let posed: Vec<Point> = points
        .iter()
        .map(|&(x, y)| (a * x + b * y, c * x + d * y))
        .collect();
    normalize(&posed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::tests::sample_face;
    use crate::types::FEATURE_LEN;

    fn rotate(points: &[Point], angle: f64, shift: (f64, f64)) -> Vec<Point> {
        let (s, c) = angle.sin_cos();
        points
            .iter()
            .map(|&(x, y)| (c * x - s * y + shift.0, s * x + c * y + shift.1))
            .collect()
    }

    #[test]
    fn test_template_is_unit_square() {
        let t = canonical_template();
        let min_x = t.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let max_x = t.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let min_y = t.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let max_y = t.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        assert!(min_x.abs() < 1e-12 && (max_x - 1.0).abs() < 1e-12);
        assert!(min_y.abs() < 1e-12 && (max_y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_map_identity() {
        let anchors = template_anchors();
        let m = estimate_linear_map(&anchors, &anchors).unwrap();
        assert!((m[0][0] - 1.0).abs() < 1e-9, "a = {}", m[0][0]);
        assert!(m[0][1].abs() < 1e-9, "b = {}", m[0][1]);
        assert!(m[1][0].abs() < 1e-9, "c = {}", m[1][0]);
        assert!((m[1][1] - 1.0).abs() < 1e-9, "d = {}", m[1][1]);
    }

    #[test]
    fn test_linear_map_recovers_scale() {
        let dst = template_anchors();
        let src = dst.map(|(x, y)| (x * 2.0 + 30.0, y * 2.0 - 10.0));
        let m = estimate_linear_map(&src, &dst).unwrap();
        assert!((m[0][0] - 0.5).abs() < 1e-9);
        assert!((m[1][1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_pose_removes_in_plane_rotation() {
        let face = sample_face();
        let upright = pose(&face).unwrap();
        let tilted = pose(&rotate(&face, 0.35, (240.0, -80.0))).unwrap();

        assert_eq!(upright.len(), FEATURE_LEN);
        for (i, (u, t)) in upright.iter().zip(&tilted).enumerate() {
            assert!((u - t).abs() < 1e-6, "coordinate {i}: {u} vs {t}");
        }
    }

    #[test]
    fn test_pose_collinear_anchors() {
        let mut face = sample_face();
        // put the lip anchor on the line through both eye corners
        face[57] = ((face[36].0 + face[45].0) / 2.0, (face[36].1 + face[45].1) / 2.0);
        assert_eq!(pose(&face).unwrap_err(), NormalizeError::CollinearAnchors);
    }

    #[test]
    fn test_pose_wrong_point_count() {
        assert_eq!(pose(&[]).unwrap_err(), NormalizeError::WrongPointCount(0));
    }
}
