// SPDX-License-Identifier: MPL-2.0

//! Sparse KLT tracker producing the frame-to-frame homography.
//!
//! The tracker retains one frame (as a mean pyramid with gradients) and a
//! sparse set of corner features detected on the half-resolution level.
//! `run_track` tracks those features into the new frame with pyramidal
//! Lucas-Kanade, fits a homography with RANSAC and hands the retained
//! state over to the new frame. It never fails: when too few
//! correspondences survive, the returned homography is the identity.

use nalgebra::{DMatrix, Matrix2, Matrix3, Vector2};

use crate::homography;
use crate::img::gradients;
use crate::img::interpolation;
use crate::img::multires;

/// Tuning knobs of the tracker.
#[derive(Debug, Clone)]
pub struct KltConfig {
    /// Upper bound on the detected feature count.
    pub max_features: usize,
    /// Corner quality relative to the strongest response, as in
    /// good-features-to-track.
    pub quality_level: f32,
    /// Minimal pixel distance between detected features, on the detection
    /// (half-resolution) scale.
    pub min_distance: usize,
    /// Lucas-Kanade window radius (the window spans `2r + 1` pixels).
    pub window_radius: usize,
    /// Pyramid levels used for tracking.
    pub pyramid_levels: usize,
    /// Iteration cap per pyramid level.
    pub max_iterations: usize,
    /// Convergence threshold on the per-iteration displacement.
    pub epsilon: f32,
    pub ransac_iterations: usize,
    /// RANSAC inlier reprojection threshold in pixels.
    pub ransac_threshold: f32,
}

impl Default for KltConfig {
    fn default() -> Self {
        KltConfig {
            max_features: 1000,
            quality_level: 0.01,
            min_distance: 10,
            window_radius: 7,
            pyramid_levels: 3,
            max_iterations: 20,
            epsilon: 0.03,
            ransac_iterations: 500,
            ransac_threshold: 3.0,
        }
    }
}

/// Frame state carried between calls.
struct Retained {
    pyramid: Vec<DMatrix<f32>>,
    gradients: Vec<DMatrix<(f32, f32)>>,
    points: Vec<Vector2<f32>>,
    /// Feature count at the last detection; tracking below half of it
    /// triggers a re-detection.
    detected_count: usize,
}

/// Sparse feature tracker with homography output.
pub struct KltTracker {
    config: KltConfig,
    retained: Option<Retained>,
}

impl KltTracker {
    pub fn new(config: KltConfig) -> Self {
        KltTracker {
            config,
            retained: None,
        }
    }

    /// Retain `frame` as the reference and detect the initial feature set.
    pub fn init(&mut self, frame: &DMatrix<u8>) {
        let (pyramid, grads) = self.analyze(frame);
        let points = self.detect(&pyramid);
        log::debug!("klt: detected {} features", points.len());
        self.retained = Some(Retained {
            pyramid,
            gradients: grads,
            detected_count: points.len(),
            points,
        });
    }

    /// Track into `frame` and return the homography mapping retained-frame
    /// pixel coordinates into `frame` pixel coordinates.
    ///
    /// The retained frame and features are replaced by `frame` and the
    /// tracked points (or a fresh detection when too many were lost).
    pub fn run_track(&mut self, frame: &DMatrix<u8>) -> Matrix3<f32> {
        let prev = match self.retained.take() {
            Some(prev) => prev,
            None => {
                self.init(frame);
                return Matrix3::identity();
            }
        };

        let (pyramid, grads) = self.analyze(frame);

        let mut src = Vec::with_capacity(prev.points.len());
        let mut dst = Vec::with_capacity(prev.points.len());
        for &p in prev.points.iter() {
            if let Some(q) = self.track_point(&prev, &pyramid, p) {
                src.push(p);
                dst.push(q);
            }
        }

        let h = if src.len() >= 4 {
            match homography::ransac(
                &src,
                &dst,
                self.config.ransac_iterations,
                self.config.ransac_threshold,
            ) {
                Some(h) => h,
                None => {
                    log::debug!("klt: homography fit degenerated, using identity");
                    Matrix3::identity()
                }
            }
        } else {
            log::debug!(
                "klt: only {} correspondences survived, using identity",
                src.len()
            );
            Matrix3::identity()
        };

        // Hand the retained state to the new frame.
        let (points, detected_count) = if dst.len() < prev.detected_count / 2 {
            let fresh = self.detect(&pyramid);
            log::debug!(
                "klt: refreshed features ({} tracked, {} detected)",
                dst.len(),
                fresh.len()
            );
            let count = fresh.len();
            (fresh, count)
        } else {
            (dst, prev.detected_count)
        };
        self.retained = Some(Retained {
            pyramid,
            gradients: grads,
            points,
            detected_count,
        });
        h
    }

    fn analyze(&self, frame: &DMatrix<u8>) -> (Vec<DMatrix<f32>>, Vec<DMatrix<(f32, f32)>>) {
        let pyramid = multires::mean_pyramid(self.config.pyramid_levels, multires::to_f32(frame));
        let grads = pyramid.iter().map(gradients::centered_f32).collect();
        (pyramid, grads)
    }

    /// Detect Shi-Tomasi corners on the half-resolution level and report
    /// them in full-resolution pixel coordinates.
    fn detect(&self, pyramid: &[DMatrix<f32>]) -> Vec<Vector2<f32>> {
        let (level, scale) = if pyramid.len() > 1 {
            (&pyramid[1], 2.0)
        } else {
            (&pyramid[0], 1.0)
        };
        detect_features(
            level,
            self.config.max_features,
            self.config.quality_level,
            self.config.min_distance,
        )
        .into_iter()
        .map(|p| p * scale)
        .collect()
    }

    /// Pyramidal Lucas-Kanade for one feature. Returns the tracked
    /// position in `curr`, or `None` for lost features.
    fn track_point(
        &self,
        prev: &Retained,
        curr_pyramid: &[DMatrix<f32>],
        point: Vector2<f32>,
    ) -> Option<Vector2<f32>> {
        let levels = prev.pyramid.len().min(curr_pyramid.len());
        let radius = self.config.window_radius as i64;
        let mut flow = Vector2::new(0.0f32, 0.0);

        for level in (0..levels).rev() {
            let scale = (1 << level) as f32;
            let p = point / scale;
            let prev_img = &prev.pyramid[level];
            let prev_grad = &prev.gradients[level];
            let curr_img = &curr_pyramid[level];

            // Spatial gradient matrix over the template window.
            let mut gxx = 0.0f32;
            let mut gxy = 0.0f32;
            let mut gyy = 0.0f32;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let (gx, gy) = interpolation::linear_pair(
                        p.x + dx as f32,
                        p.y + dy as f32,
                        prev_grad,
                    );
                    gxx += gx * gx;
                    gxy += gx * gy;
                    gyy += gy * gy;
                }
            }
            let g = Matrix2::new(gxx, gxy, gxy, gyy);
            if g.determinant().abs() < 1e-4 {
                // Textureless window, the system is unsolvable.
                return None;
            }
            let g_inv = g.try_inverse()?;

            for _ in 0..self.config.max_iterations {
                let mut bx = 0.0f32;
                let mut by = 0.0f32;
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let tx = p.x + dx as f32;
                        let ty = p.y + dy as f32;
                        let delta = interpolation::linear(tx, ty, prev_img)
                            - interpolation::linear(tx + flow.x, ty + flow.y, curr_img);
                        let (gx, gy) = interpolation::linear_pair(tx, ty, prev_grad);
                        bx += delta * gx;
                        by += delta * gy;
                    }
                }
                let step = g_inv * Vector2::new(bx, by);
                flow += step;
                if step.norm() < self.config.epsilon {
                    break;
                }
            }

            if level > 0 {
                flow *= 2.0;
            }
        }

        let tracked = point + flow;
        let (height, width) = curr_pyramid[0].shape();
        let in_bounds = tracked.x >= 0.0
            && tracked.y >= 0.0
            && tracked.x <= (width - 1) as f32
            && tracked.y <= (height - 1) as f32;
        if in_bounds {
            Some(tracked)
        } else {
            None
        }
    }
}

/// Shi-Tomasi corner detection: minimal eigenvalue of the 3x3 structure
/// tensor, non-maximum suppression, then greedy min-distance selection by
/// decreasing response.
fn detect_features(
    img: &DMatrix<f32>,
    max_features: usize,
    quality_level: f32,
    min_distance: usize,
) -> Vec<Vector2<f32>> {
    let (height, width) = img.shape();
    if height < 3 || width < 3 {
        return Vec::new();
    }
    let grad = gradients::centered_f32(img);

    // Min-eigenvalue response over a 3x3 neighborhood.
    let mut response = DMatrix::<f32>::zeros(height, width);
    let mut max_response = 0.0f32;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut sxx = 0.0f32;
            let mut sxy = 0.0f32;
            let mut syy = 0.0f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    let (gx, gy) = grad[(y + dy - 1, x + dx - 1)];
                    sxx += gx * gx;
                    sxy += gx * gy;
                    syy += gy * gy;
                }
            }
            let trace = sxx + syy;
            let det_term = ((sxx - syy) * (sxx - syy) + 4.0 * sxy * sxy).sqrt();
            let lambda_min = 0.5 * (trace - det_term);
            response[(y, x)] = lambda_min;
            max_response = max_response.max(lambda_min);
        }
    }
    if max_response <= 0.0 {
        return Vec::new();
    }
    let threshold = quality_level * max_response;

    // Local maxima above the quality threshold.
    let mut candidates = Vec::new();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let r = response[(y, x)];
            if r < threshold {
                continue;
            }
            let mut is_max = true;
            'neighborhood: for dy in 0..3 {
                for dx in 0..3 {
                    if (dy, dx) != (1, 1) && response[(y + dy - 1, x + dx - 1)] > r {
                        is_max = false;
                        break 'neighborhood;
                    }
                }
            }
            if is_max {
                candidates.push((r, x, y));
            }
        }
    }
    candidates.sort_unstable_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    // Greedy selection with a bucket grid enforcing the min distance.
    let bucket = min_distance.max(1);
    let buckets_x = width / bucket + 1;
    let buckets_y = height / bucket + 1;
    let mut occupied: Vec<Vec<(usize, usize)>> = vec![Vec::new(); buckets_x * buckets_y];
    let min_dist_sqr = (min_distance * min_distance) as i64;
    let mut selected = Vec::new();
    for &(_, x, y) in candidates.iter() {
        let bx = x / bucket;
        let by = y / bucket;
        let mut free = true;
        'buckets: for ny in by.saturating_sub(1)..=(by + 1).min(buckets_y - 1) {
            for nx in bx.saturating_sub(1)..=(bx + 1).min(buckets_x - 1) {
                for &(ox, oy) in occupied[ny * buckets_x + nx].iter() {
                    let dx = x as i64 - ox as i64;
                    let dy = y as i64 - oy as i64;
                    if dx * dx + dy * dy < min_dist_sqr {
                        free = false;
                        break 'buckets;
                    }
                }
            }
        }
        if free {
            occupied[by * buckets_x + bx].push((x, y));
            selected.push(Vector2::new(x as f32, y as f32));
            if selected.len() >= max_features {
                break;
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth blob pattern, corner-rich but friendly to interpolation.
    /// `dx` shifts the content to the right by that many pixels.
    fn blob_frame(width: usize, height: usize, dx: f32) -> DMatrix<u8> {
        DMatrix::from_fn(height, width, |y, x| {
            let xf = x as f32 - dx;
            let yf = y as f32;
            let v = 128.0
                + 50.0 * (0.27 * xf).sin() * (0.35 * yf).sin()
                + 30.0 * (0.12 * (xf + yf)).sin();
            v.round() as u8
        })
    }

    #[test]
    fn detects_features_on_textured_images() {
        let frame = blob_frame(64, 64, 0.0);
        let mut tracker = KltTracker::new(KltConfig {
            min_distance: 4,
            ..KltConfig::default()
        });
        tracker.init(&frame);
        let retained = tracker.retained.as_ref().unwrap();
        assert!(retained.points.len() >= 6, "{}", retained.points.len());
        // Points are reported on the full-resolution pixel raster.
        for p in retained.points.iter() {
            assert!(p.x >= 0.0 && p.x < 64.0);
            assert!(p.y >= 0.0 && p.y < 64.0);
        }
    }

    #[test]
    fn identical_frames_track_to_identity() {
        let frame = blob_frame(64, 64, 0.0);
        let mut tracker = KltTracker::new(KltConfig {
            min_distance: 4,
            ..KltConfig::default()
        });
        tracker.init(&frame);
        let h = tracker.run_track(&frame);
        assert!((h - Matrix3::identity()).abs().max() < 1e-2);
    }

    #[test]
    fn recovers_a_small_translation() {
        let mut tracker = KltTracker::new(KltConfig {
            min_distance: 4,
            ..KltConfig::default()
        });
        tracker.init(&blob_frame(96, 96, 0.0));
        // Content moves 2 px right, so a previous pixel x maps to x + 2.
        let h = tracker.run_track(&blob_frame(96, 96, 2.0));
        assert!((h[(0, 2)] - 2.0).abs() < 0.5, "tx = {}", h[(0, 2)]);
        assert!(h[(1, 2)].abs() < 0.5, "ty = {}", h[(1, 2)]);
    }

    #[test]
    fn untracked_first_call_returns_identity() {
        let mut tracker = KltTracker::new(KltConfig::default());
        let h = tracker.run_track(&blob_frame(32, 32, 0.0));
        assert_eq!(h, Matrix3::identity());
        // The frame is now retained.
        assert!(tracker.retained.is_some());
    }
}
