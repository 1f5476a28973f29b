// SPDX-License-Identifier: MPL-2.0

//! Robust 3x3 homography estimation from point correspondences.
//!
//! A homography `H` maps homogeneous source pixel coordinates into
//! destination pixel coordinates. Fitting uses the normalized direct
//! linear transform; robustness comes from a RANSAC loop with a
//! deterministic linear congruential sampler, so two estimators fed the
//! same correspondences produce the same matrix.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

/// Apply the homography to a pixel position.
///
/// Returns `None` when the point maps to the plane at infinity.
pub fn apply(h: &Matrix3<f32>, p: Vector2<f32>) -> Option<Vector2<f32>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-8 {
        None
    } else {
        Some(Vector2::new(q.x / q.z, q.y / q.z))
    }
}

/// Least-squares homography from at least four correspondences.
///
/// Normalized DLT: both point sets are translated to their centroid and
/// scaled to a mean distance of sqrt(2) before solving, and the
/// conditioning transforms are undone on the result. Returns `None` for
/// degenerate configurations.
pub fn fit(src: &[Vector2<f32>], dst: &[Vector2<f32>]) -> Option<Matrix3<f32>> {
    if src.len() < 4 || src.len() != dst.len() {
        return None;
    }
    let t_src = normalization(src)?;
    let t_dst = normalization(dst)?;

    // Each correspondence contributes two rows of the DLT system A h = 0.
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let s = transform(&t_src, src[i]);
        let d = transform(&t_dst, dst[i]);
        let (x, y) = (s.x, s.y);
        let (xp, yp) = (d.x, d.y);
        let row = [-x, -y, -1.0, 0.0, 0.0, 0.0, x * xp, y * xp, xp];
        for (j, &v) in row.iter().enumerate() {
            a[(2 * i, j)] = v;
        }
        let row = [0.0, 0.0, 0.0, -x, -y, -1.0, x * yp, y * yp, yp];
        for (j, &v) in row.iter().enumerate() {
            a[(2 * i + 1, j)] = v;
        }
    }

    // The null vector of A is the eigenvector of A^T A with the smallest
    // eigenvalue.
    let ata = a.transpose() * &a;
    let eigen = ata.symmetric_eigen();
    let mut min_index = 0;
    for (i, value) in eigen.eigenvalues.iter().enumerate() {
        if *value < eigen.eigenvalues[min_index] {
            min_index = i;
        }
    }
    let h = eigen.eigenvectors.column(min_index);
    let h_norm = Matrix3::new(
        h[0], h[1], h[2], //
        h[3], h[4], h[5], //
        h[6], h[7], h[8],
    );

    let h_full = t_dst.try_inverse()? * h_norm * t_src;
    if h_full[(2, 2)].abs() < 1e-12 {
        return None;
    }
    let h_full = h_full / h_full[(2, 2)];
    Some(h_full.map(|v| v as f32))
}

/// RANSAC homography estimation.
///
/// Hypotheses are fit on four sampled correspondences; the model keeping
/// the most inliers under the reprojection `threshold` (in pixels) wins
/// and is refit on its full inlier set. Returns `None` below four
/// correspondences or when every hypothesis is degenerate.
pub fn ransac(
    src: &[Vector2<f32>],
    dst: &[Vector2<f32>],
    iterations: usize,
    threshold: f32,
) -> Option<Matrix3<f32>> {
    let n = src.len();
    if n < 4 || n != dst.len() {
        return None;
    }
    let threshold_sqr = threshold * threshold;
    let mut best: Option<(usize, Matrix3<f32>)> = None;
    let mut rng = Lcg::new(0x4d595df4d0f33173);

    let mut sample_src = [Vector2::zeros(); 4];
    let mut sample_dst = [Vector2::zeros(); 4];
    for _ in 0..iterations {
        let mut indices = [0usize; 4];
        for slot in 0..4 {
            loop {
                let candidate = rng.next_below(n);
                if !indices[..slot].contains(&candidate) {
                    indices[slot] = candidate;
                    break;
                }
            }
        }
        for (i, &index) in indices.iter().enumerate() {
            sample_src[i] = src[index];
            sample_dst[i] = dst[index];
        }
        if let Some(h) = fit(&sample_src, &sample_dst) {
            let inliers = count_inliers(&h, src, dst, threshold_sqr);
            if best.map(|(count, _)| inliers > count).unwrap_or(true) {
                best = Some((inliers, h));
            }
        }
    }

    let (_, best_h) = best?;
    let mut inlier_src = Vec::with_capacity(n);
    let mut inlier_dst = Vec::with_capacity(n);
    for i in 0..n {
        if reprojection_sqr(&best_h, src[i], dst[i])
            .map(|e| e <= threshold_sqr)
            .unwrap_or(false)
        {
            inlier_src.push(src[i]);
            inlier_dst.push(dst[i]);
        }
    }
    fit(&inlier_src, &inlier_dst).or(Some(best_h))
}

fn count_inliers(
    h: &Matrix3<f32>,
    src: &[Vector2<f32>],
    dst: &[Vector2<f32>],
    threshold_sqr: f32,
) -> usize {
    src.iter()
        .zip(dst.iter())
        .filter(|(&s, &d)| {
            reprojection_sqr(h, s, d)
                .map(|e| e <= threshold_sqr)
                .unwrap_or(false)
        })
        .count()
}

fn reprojection_sqr(h: &Matrix3<f32>, src: Vector2<f32>, dst: Vector2<f32>) -> Option<f32> {
    apply(h, src).map(|p| (p - dst).norm_squared())
}

/// Similarity transform taking the points to centroid zero and mean
/// distance sqrt(2), as an f64 matrix for conditioning.
fn normalization(points: &[Vector2<f32>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for p in points {
        cx += p.x as f64;
        cy += p.y as f64;
    }
    cx /= n;
    cy /= n;
    let mut mean_dist = 0.0;
    for p in points {
        let dx = p.x as f64 - cx;
        let dy = p.y as f64 - cy;
        mean_dist += (dx * dx + dy * dy).sqrt();
    }
    mean_dist /= n;
    if mean_dist < 1e-12 {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * cx,
        0.0,
        scale,
        -scale * cy,
        0.0,
        0.0,
        1.0,
    ))
}

fn transform(t: &Matrix3<f64>, p: Vector2<f32>) -> Vector2<f64> {
    let q = t * Vector3::new(p.x as f64, p.y as f64, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}

/// Deterministic linear congruential generator for RANSAC sampling.
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Lcg { state: seed }
    }

    fn next_below(&mut self, n: usize) -> usize {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.state >> 33) as usize) % n
    }
}
