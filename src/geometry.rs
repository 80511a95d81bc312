//! Box conversions, similarity/cost matrices and the camera-motion warp.
//!
//! All cost-matrix helpers here return *similarity* (IoU) or *raw distance* values;
//! callers turn a similarity into a cost with `1.0 - similarity` at the call site, same
//! as the association stages in `tracker.rs` do.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, SMatrix, SVector};

/// Axis-aligned box as `[x1, y1, x2, y2]`.
pub type Xyxy = [f64; 4];
/// Axis-aligned box as `[cx, cy, w, h]`.
pub type Xywh = [f64; 4];

pub fn xyxy_to_xywh(b: Xyxy) -> Xywh {
    let w = b[2] - b[0];
    let h = b[3] - b[1];
    [b[0] + w / 2.0, b[1] + h / 2.0, w, h]
}

pub fn xywh_to_xyxy(b: Xywh) -> Xyxy {
    let (x1, y1, x2, y2) = corners(b);
    [x1, y1, x2, y2]
}

/// Same as [`xywh_to_xyxy`] but clips the result to `(0, 0, img_w, img_h)`.
pub fn xywh_to_xyxy_clip(b: Xywh, img_h: f64, img_w: f64) -> Xyxy {
    let [x1, y1, x2, y2] = xywh_to_xyxy(b);
    [
        x1.clamp(0.0, img_w),
        y1.clamp(0.0, img_h),
        x2.clamp(0.0, img_w),
        y2.clamp(0.0, img_h),
    ]
}

fn corners(b: Xywh) -> (f64, f64, f64, f64) {
    let hw = b[2] / 2.0;
    let hh = b[3] / 2.0;
    (b[0] - hw, b[1] - hh, b[0] + hw, b[1] + hh)
}

pub fn area_xywh(b: Xywh) -> f64 {
    (b[2] * b[3]).max(0.0)
}

fn intersection_xywh(a: Xywh, b: Xywh) -> f64 {
    let (ax1, ay1, ax2, ay2) = corners(a);
    let (bx1, by1, bx2, by2) = corners(b);
    let iw = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let ih = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    iw * ih
}

/// Intersection-over-union of two boxes in `[0, 1]`. Zero when the union area is zero.
pub fn iou_xywh(a: Xywh, b: Xywh) -> f64 {
    let inter = intersection_xywh(a, b);
    let union = area_xywh(a) + area_xywh(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Pairwise IoU similarity, rows = `tracks`, columns = `dets`.
pub fn iou_matrix(tracks: &[Xywh], dets: &[Xywh]) -> DMatrix<f64> {
    DMatrix::from_fn(tracks.len(), dets.len(), |i, j| iou_xywh(tracks[i], dets[j]))
}

/// Pairwise (IoU, visibility-ratio) similarity. `vr[i, j]` is the fraction of
/// detection `j`'s area that is *not* covered by track `i` — how much of the
/// detection a given track would occlude if it were the real explanation for it.
pub fn iou_vr_matrix(tracks: &[Xywh], dets: &[Xywh]) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = tracks.len();
    let m = dets.len();
    let mut iou = DMatrix::zeros(n, m);
    let mut vr = DMatrix::zeros(n, m);
    for i in 0..n {
        for j in 0..m {
            let inter = intersection_xywh(tracks[i], dets[j]);
            let area_d = area_xywh(dets[j]);
            let union = area_xywh(tracks[i]) + area_d - inter;
            iou[(i, j)] = if union > 0.0 { inter / union } else { 0.0 };
            vr[(i, j)] = if area_d > 0.0 { (area_d - inter) / area_d } else { 0.0 };
        }
    }
    (iou, vr)
}

/// Aspect-ratio-augmented IoU: returns the raw IoU plus the per-pair `alpha` weight
/// used to penalize aspect-ratio mismatch (as in Complete-IoU style costs).
pub fn aiou_matrix(tracks: &[Xywh], dets: &[Xywh]) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = tracks.len();
    let m = dets.len();
    let mut ious = DMatrix::zeros(n, m);
    let mut alphas = DMatrix::zeros(n, m);
    for i in 0..n {
        let ar_t = (tracks[i][2] / tracks[i][3]).atan();
        for j in 0..m {
            let ar_d = (dets[j][2] / dets[j][3]).atan();
            let iou = iou_xywh(tracks[i], dets[j]);
            let diff = ar_t - ar_d;
            let v = 1.0 - (4.0 / (PI * PI)) * diff * diff;
            let alpha = v / (1.0 - iou + v);
            ious[(i, j)] = iou;
            alphas[(i, j)] = alpha;
        }
    }
    (ious, alphas)
}

/// Pairwise cosine distance between L2-normalized embeddings, clamped to `[0, 2]`
/// and floored at zero to absorb floating point noise near identical vectors.
pub fn cosine_distance_matrix(tracks: &[DVector<f64>], dets: &[DVector<f64>]) -> DMatrix<f64> {
    DMatrix::from_fn(tracks.len(), dets.len(), |i, j| {
        let dot = tracks[i].dot(&dets[j]);
        (1.0 - dot).max(0.0)
    })
}

/// Fuses a detection confidence into an IoU-distance cost matrix in place:
/// `cost[i, j] = 1 - (1 - cost[i, j]) * conf[j]`.
pub fn fuse_score(cost: &mut DMatrix<f64>, confs: &[f64]) {
    let (rows, cols) = cost.shape();
    debug_assert_eq!(cols, confs.len());
    for i in 0..rows {
        for j in 0..cols {
            let sim = 1.0 - cost[(i, j)];
            cost[(i, j)] = 1.0 - sim * confs[j];
        }
    }
}

/// For each column, the second-smallest value across all rows.
///
/// Used to judge whether some *other* track plausibly explains a detection (i.e. the
/// detection is occluded by a second object). With fewer than two rows there is no
/// other track to compare against, so every detection is treated as unambiguous
/// (`f64::INFINITY`, always above any visibility threshold).
pub fn second_smallest_per_column(m: &DMatrix<f64>) -> Vec<f64> {
    let (rows, cols) = m.shape();
    if rows < 2 {
        return vec![f64::INFINITY; cols];
    }
    (0..cols)
        .map(|j| {
            let mut col: Vec<f64> = (0..rows).map(|i| m[(i, j)]).collect();
            col.sort_by(|a, b| a.partial_cmp(b).unwrap());
            col[1]
        })
        .collect()
}

/// Warps each box's four corners through a 3x3 homography and returns the new
/// axis-aligned bounding box of the warped corners. Matches the affine-style warp used
/// by this design's camera-motion compensation: the homogeneous coordinate is not
/// divided back out, on the assumption the estimator returns a similarity/affine
/// transform embedded in a 3x3 matrix.
pub fn camera_update(boxes: &[Xywh], homography: &SMatrix<f64, 3, 3>) -> Vec<Xywh> {
    boxes
        .iter()
        .map(|&b| {
            let (x1, y1, x2, y2) = corners(b);
            let pts = [[x1, y1], [x2, y1], [x2, y2], [x1, y2]];
            let mut tx = [0.0; 4];
            let mut ty = [0.0; 4];
            for (k, &[px, py]) in pts.iter().enumerate() {
                let v = homography * SVector::<f64, 3>::new(px, py, 1.0);
                tx[k] = v[0];
                ty[k] = v[1];
            }
            let nx1 = tx.iter().cloned().fold(f64::INFINITY, f64::min);
            let ny1 = ty.iter().cloned().fold(f64::INFINITY, f64::min);
            let nx2 = tx.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let ny2 = ty.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let w = nx2 - nx1;
            let h = ny2 - ny1;
            [nx1 + w / 2.0, ny1 + h / 2.0, w, h]
        })
        .collect()
}
