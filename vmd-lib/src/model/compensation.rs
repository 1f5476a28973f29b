// SPDX-License-Identifier: MPL-2.0

//! Motion compensation of the grid statistics.
//!
//! Before each statistical update, the previous frame's per-cell models
//! are re-expressed on the current grid: every current cell center is
//! projected back through the inverse homography, and the statistics of
//! the up to four previous cells it lands between are mixed with bilinear
//! weights. Exactly one warp-and-mix pass runs per frame.

use nalgebra::{Matrix3, Vector3};

use crate::estimator::Config;
use crate::grid::Grid;
use crate::model::ModelState;

pub struct CompensationModel {
    grid: Grid,
    num_models: usize,
    var_init: f32,
    var_trim: f32,
    lam: f32,
    theta_v: f32,
    age_trim: f32,
    dynamic: bool,
}

impl CompensationModel {
    pub fn new(grid: Grid, config: &Config) -> Self {
        CompensationModel {
            grid,
            num_models: config.num_models,
            var_init: config.var_init,
            var_trim: config.var_trim,
            lam: config.lam,
            theta_v: config.theta_v,
            age_trim: config.age_trim,
            dynamic: config.dynamic,
        }
    }

    /// Warp `prev` through `h` (the homography mapping previous-frame
    /// pixels into current-frame pixels) and write the mixed statistics
    /// into `out`.
    ///
    /// Cells whose back-projected center lies beyond every previous cell
    /// are reset to first-frame statistics and flagged `out_of_view`. A
    /// non-invertible homography degrades to the identity warp.
    pub fn compensate(&self, h: &Matrix3<f32>, prev: &ModelState, out: &mut ModelState) {
        let h_inv = match h.try_inverse() {
            Some(inv) => inv,
            None => {
                log::debug!("compensation: singular homography, warping with identity");
                Matrix3::identity()
            }
        };

        for gy in 0..self.grid.rows() {
            for gx in 0..self.grid.cols() {
                let cell = self.grid.cell_index(gx, gy);
                let (cx, cy) = self.grid.cell_center(gx, gy);
                let back = h_inv * Vector3::new(cx, cy, 1.0);
                let mix = if back.z.abs() > 1e-8 {
                    self.grid.bilinear_weights(back.x / back.z, back.y / back.z)
                } else {
                    None
                };

                match mix {
                    None => {
                        for k in 0..self.num_models {
                            out.set(cell, k, 0.0, self.var_init, 0.0);
                        }
                        out.out_of_view[cell] = true;
                    }
                    Some(mix) => {
                        out.out_of_view[cell] = false;
                        for k in 0..self.num_models {
                            let mut mean = 0.0f32;
                            for (&c, &w) in mix.cells.iter().zip(mix.weights.iter()) {
                                mean += w * prev.means[prev.index(c, k)];
                            }
                            // Mixture variance: within-cell variance plus
                            // the spread of the mixed means.
                            let mut var = 0.0f32;
                            let mut age = 0.0f32;
                            for (&c, &w) in mix.cells.iter().zip(mix.weights.iter()) {
                                let i = prev.index(c, k);
                                let d = prev.means[i] - mean;
                                var += w * (prev.vars[i] + d * d);
                                age += w * prev.ages[i];
                            }
                            // Border cells only saw part of their history.
                            age *= mix.coverage;
                            if var > self.theta_v {
                                age *= (-self.lam * (var - self.theta_v)).exp();
                            }
                            let var = var.max(self.var_trim);
                            let age = age.max(0.0).min(self.age_trim);
                            out.set(cell, k, mean, var, age);
                        }
                        if self.dynamic {
                            self.promote_oldest(out, cell);
                        }
                    }
                }
            }
        }
    }

    /// Move the highest-age model into the apparent slot.
    fn promote_oldest(&self, state: &mut ModelState, cell: usize) {
        let mut oldest = 0;
        for k in 1..self.num_models {
            if state.ages[state.index(cell, k)] > state.ages[state.index(cell, oldest)] {
                oldest = k;
            }
        }
        if oldest != 0 {
            state.swap_models(cell, 0, oldest);
        }
    }
}
