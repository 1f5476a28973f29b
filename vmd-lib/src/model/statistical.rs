// SPDX-License-Identifier: MPL-2.0

//! Statistical background update and foreground emission.
//!
//! Each frame, every cell observes the mean intensity of its block and
//! matches it against the warped candidate models. The matching model is
//! blended toward the observation with a learning rate decaying in its
//! age; when nothing matches, the youngest candidate is sacrificed and
//! restarted from the observation. Foreground is then read per pixel from
//! the apparent model, bilinearly interpolated between cell centers.

use nalgebra::DMatrix;

use crate::estimator::{Config, Foreground, Sensitivity};
use crate::grid::Grid;
use crate::model::ModelState;

/// Per-cell outcome of the model selection step.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Choice {
    /// The observation is within the gate of model `k`: blend.
    Matched(usize),
    /// Nothing matched: candidate `k` restarts from the observation.
    Evicted(usize),
    /// The cell was warped out of view: the apparent model restarts and
    /// the cell emits no foreground this frame.
    Restart,
}

pub struct StatisticalModel {
    grid: Grid,
    num_models: usize,
    var_init: f32,
    var_trim: f32,
    age_trim: f32,
    theta_s: f32,
    theta_d: f32,
    calc_probs: bool,
    sensitivity: Sensitivity,
    // Per-cell scratch, reused across frames.
    obs_means: Vec<f32>,
    choices: Vec<Choice>,
}

impl StatisticalModel {
    pub fn new(grid: Grid, config: &Config) -> Self {
        StatisticalModel {
            grid,
            num_models: config.num_models,
            var_init: config.var_init,
            var_trim: config.var_trim,
            age_trim: config.age_trim,
            theta_s: config.theta_s,
            theta_d: config.theta_d,
            calc_probs: config.calc_probs,
            sensitivity: config.sensitivity,
            obs_means: vec![0.0; grid.cells()],
            choices: vec![Choice::Matched(0); grid.cells()],
        }
    }

    /// Fuse `frame` into the warped statistics, producing the next state
    /// generation in `out` and the frame's foreground map.
    ///
    /// The sensitivity mode decides which generation of each statistic
    /// feeds the foreground test; selection and the state written to
    /// `out` are identical across modes.
    pub fn apply(
        &mut self,
        frame: &DMatrix<u8>,
        warped: &ModelState,
        out: &mut ModelState,
    ) -> Foreground {
        self.observe(frame);
        self.select(warped);
        out.copy_from(warped);

        match self.sensitivity {
            Sensitivity::UpdateFirst => {
                self.update_means(warped, out);
                self.update_vars_ages(warped, out);
                self.emit(frame, &out.means, &out.vars, &out.ages, &out.out_of_view)
            }
            Sensitivity::ForegroundFirst => {
                let foreground = self.emit(
                    frame,
                    &warped.means,
                    &warped.vars,
                    &warped.ages,
                    &warped.out_of_view,
                );
                self.update_means(warped, out);
                self.update_vars_ages(warped, out);
                foreground
            }
            Sensitivity::Mixed => {
                self.update_means(warped, out);
                let foreground = self.emit(
                    frame,
                    &out.means,
                    &warped.vars,
                    &warped.ages,
                    &warped.out_of_view,
                );
                self.update_vars_ages(warped, out);
                foreground
            }
        }
    }

    /// Mean intensity of every `B x B` block.
    fn observe(&mut self, frame: &DMatrix<u8>) {
        let b = self.grid.block_size();
        let inv_area = 1.0 / (b * b) as f32;
        for gy in 0..self.grid.rows() {
            for gx in 0..self.grid.cols() {
                let mut sum = 0u32;
                for y in gy * b..(gy + 1) * b {
                    for x in gx * b..(gx + 1) * b {
                        sum += frame[(y, x)] as u32;
                    }
                }
                self.obs_means[self.grid.cell_index(gx, gy)] = sum as f32 * inv_area;
            }
        }
    }

    /// Gated model selection against the warped statistics.
    fn select(&mut self, warped: &ModelState) {
        for cell in 0..self.grid.cells() {
            if warped.out_of_view[cell] {
                self.choices[cell] = Choice::Restart;
                continue;
            }
            let mu = self.obs_means[cell];
            let mut best_k = 0;
            let mut best_d = f32::INFINITY;
            for k in 0..self.num_models {
                let i = warped.index(cell, k);
                let d = mu - warped.means[i];
                let d = d * d / warped.vars[i].max(self.var_trim);
                if d < best_d {
                    best_d = d;
                    best_k = k;
                }
            }
            self.choices[cell] = if best_d <= self.theta_s {
                Choice::Matched(best_k)
            } else {
                // Sacrifice the youngest candidate model.
                let mut youngest = 1;
                for k in 2..self.num_models {
                    if warped.ages[warped.index(cell, k)]
                        < warped.ages[warped.index(cell, youngest)]
                    {
                        youngest = k;
                    }
                }
                Choice::Evicted(youngest)
            };
        }
    }

    fn update_means(&self, warped: &ModelState, out: &mut ModelState) {
        for cell in 0..self.grid.cells() {
            let mu = self.obs_means[cell];
            match self.choices[cell] {
                Choice::Matched(k) => {
                    let i = warped.index(cell, k);
                    let alpha = 1.0 / (warped.ages[i] + 1.0);
                    out.means[i] = (1.0 - alpha) * warped.means[i] + alpha * mu;
                }
                Choice::Evicted(k) => {
                    let i = warped.index(cell, k);
                    out.means[i] = mu;
                }
                Choice::Restart => {
                    let i = warped.index(cell, 0);
                    out.means[i] = mu;
                }
            }
        }
    }

    fn update_vars_ages(&self, warped: &ModelState, out: &mut ModelState) {
        for cell in 0..self.grid.cells() {
            let mu = self.obs_means[cell];
            let (touched, touched_age) = match self.choices[cell] {
                Choice::Matched(k) => {
                    let i = warped.index(cell, k);
                    let alpha = 1.0 / (warped.ages[i] + 1.0);
                    let innovation = mu - out.means[i];
                    let var = (1.0 - alpha) * warped.vars[i] + alpha * innovation * innovation;
                    out.vars[i] = var.max(self.var_trim);
                    let raw_age = warped.ages[i] + 1.0;
                    out.ages[i] = raw_age.min(self.age_trim);
                    (k, raw_age)
                }
                Choice::Evicted(k) => {
                    let i = warped.index(cell, k);
                    out.vars[i] = self.var_init;
                    out.ages[i] = 1.0;
                    (k, 1.0)
                }
                Choice::Restart => {
                    let i = warped.index(cell, 0);
                    out.vars[i] = self.var_init;
                    out.ages[i] = 1.0;
                    (0, 1.0)
                }
            };
            self.promote_oldest(out, cell, touched, touched_age);
        }
    }

    /// Move the oldest model of the cell into the apparent slot.
    ///
    /// The compensation pass decays ages per model, so any candidate may
    /// have outgrown the apparent model, not only the one this update
    /// touched. The touched slot is compared at its age before the
    /// `age_trim` saturation, otherwise a candidate capped at `age_trim`
    /// could never overtake an equally saturated apparent model. Ties
    /// keep the current apparent model in place.
    fn promote_oldest(&self, out: &mut ModelState, cell: usize, touched: usize, touched_age: f32) {
        let effective = |state: &ModelState, k: usize| {
            if k == touched {
                touched_age
            } else {
                state.ages[state.index(cell, k)]
            }
        };
        let mut oldest = 0;
        let mut oldest_age = effective(out, 0);
        for k in 1..self.num_models {
            let age = effective(out, k);
            if age > oldest_age {
                oldest = k;
                oldest_age = age;
            }
        }
        if oldest != 0 {
            out.swap_models(cell, 0, oldest);
        }
    }

    /// Per-pixel foreground from the apparent model of the given statistic
    /// arrays. Cells flagged out of view emit zero.
    fn emit(
        &self,
        frame: &DMatrix<u8>,
        means: &[f32],
        vars: &[f32],
        ages: &[f32],
        out_of_view: &[bool],
    ) -> Foreground {
        let (height, width) = frame.shape();
        let k = self.num_models;
        let theta_d_sqr = self.theta_d * self.theta_d;

        if self.calc_probs {
            let scores = DMatrix::from_fn(height, width, |y, x| {
                let (gx, gy) = self.grid.cell_of_pixel(x, y);
                let cell = self.grid.cell_index(gx, gy);
                if out_of_view[cell] {
                    return 0.0;
                }
                self.pixel_score(frame, means, vars, x, y, k)
            });
            Foreground::Scores(scores)
        } else {
            let mask = DMatrix::from_fn(height, width, |y, x| {
                let (gx, gy) = self.grid.cell_of_pixel(x, y);
                let cell = self.grid.cell_index(gx, gy);
                if out_of_view[cell] || ages[cell * k] < 1.0 {
                    return 0u8;
                }
                let z = self.pixel_score(frame, means, vars, x, y, k);
                if z > theta_d_sqr {
                    255
                } else {
                    0
                }
            });
            Foreground::Mask(mask)
        }
    }

    /// Squared normalized distance of one pixel to the interpolated
    /// apparent model.
    fn pixel_score(
        &self,
        frame: &DMatrix<u8>,
        means: &[f32],
        vars: &[f32],
        x: usize,
        y: usize,
        k: usize,
    ) -> f32 {
        let px = x as f32 + 0.5;
        let py = y as f32 + 0.5;
        // Every in-image pixel has at least one in-bounds neighbor cell.
        let (mu, var) = match self.grid.bilinear_weights(px, py) {
            Some(mix) => {
                let mut mu = 0.0f32;
                let mut var = 0.0f32;
                for (&cell, &w) in mix.cells.iter().zip(mix.weights.iter()) {
                    mu += w * means[cell * k];
                    var += w * vars[cell * k];
                }
                (mu, var)
            }
            None => {
                let (gx, gy) = self.grid.cell_of_pixel(x, y);
                let cell = self.grid.cell_index(gx, gy);
                (means[cell * k], vars[cell * k])
            }
        };
        let d = frame[(y, x)] as f32 - mu;
        d * d / var.max(self.var_trim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Config;

    fn test_config(sensitivity: Sensitivity) -> Config {
        Config {
            num_models: 2,
            block_size: 4,
            var_init: 100.0,
            var_trim: 25.0,
            age_trim: 30.0,
            theta_s: 2.0,
            theta_d: 2.0,
            sensitivity,
            smooth: false,
            ..Config::default()
        }
    }

    fn constant_frame(width: usize, height: usize, value: u8) -> DMatrix<u8> {
        DMatrix::from_element(height, width, value)
    }

    fn run_frames(
        model: &mut StatisticalModel,
        grid: Grid,
        config: &Config,
        frames: &[DMatrix<u8>],
    ) -> (ModelState, Foreground) {
        let mut state = ModelState::new(grid.cells(), config.num_models, config.var_init);
        let mut warped = ModelState::new(grid.cells(), config.num_models, config.var_init);
        let mut foreground = None;
        for frame in frames {
            // Identity warp between frames: copy state into the warped slot.
            warped.copy_from(&state);
            foreground = Some(model.apply(frame, &warped, &mut state));
        }
        (state, foreground.expect("at least one frame"))
    }

    #[test]
    fn first_frame_mask_is_all_zero() {
        let config = test_config(Sensitivity::Mixed);
        let grid = Grid::new(16, 16, 4).unwrap();
        let mut model = StatisticalModel::new(grid, &config);
        let frames = vec![constant_frame(16, 16, 128)];
        let (state, foreground) = run_frames(&mut model, grid, &config, &frames);
        match foreground {
            Foreground::Mask(mask) => assert!(mask.iter().all(|&v| v == 0)),
            Foreground::Scores(_) => panic!("expected a mask"),
        }
        // The observation landed in a restarted candidate which became
        // the apparent model.
        let apparent = state.index(0, 0);
        assert_eq!(state.means[apparent], 128.0);
        assert_eq!(state.ages[apparent], 1.0);
    }

    #[test]
    fn repeated_frames_converge_to_the_observation() {
        for &sensitivity in &[
            Sensitivity::UpdateFirst,
            Sensitivity::ForegroundFirst,
            Sensitivity::Mixed,
        ] {
            let config = test_config(sensitivity);
            let grid = Grid::new(16, 16, 4).unwrap();
            let mut model = StatisticalModel::new(grid, &config);
            let frames: Vec<_> = (0..10).map(|_| constant_frame(16, 16, 128)).collect();
            let (state, foreground) = run_frames(&mut model, grid, &config, &frames);
            for cell in 0..grid.cells() {
                let i = state.index(cell, 0);
                assert!((state.means[i] - 128.0).abs() < 1e-3);
                assert!((state.vars[i] - config.var_trim).abs() < 1e-3);
                assert_eq!(state.ages[i], 10.0);
            }
            match foreground {
                Foreground::Mask(mask) => assert!(mask.iter().all(|&v| v == 0)),
                Foreground::Scores(_) => panic!("expected a mask"),
            }
        }
    }

    #[test]
    fn sudden_anomaly_is_foreground_in_its_cell_only() {
        let config = test_config(Sensitivity::Mixed);
        let grid = Grid::new(32, 32, 4).unwrap();
        let mut model = StatisticalModel::new(grid, &config);
        let mut frames: Vec<_> = (0..30).map(|_| constant_frame(32, 32, 128)).collect();
        let mut anomaly = constant_frame(32, 32, 128);
        for y in 8..12 {
            for x in 8..12 {
                anomaly[(y, x)] = 255;
            }
        }
        frames.push(anomaly);
        let (_, foreground) = run_frames(&mut model, grid, &config, &frames);
        let mask = match foreground {
            Foreground::Mask(mask) => mask,
            Foreground::Scores(_) => panic!("expected a mask"),
        };
        // The bright patch at cell (2, 2) is foreground.
        for y in 9..11 {
            for x in 9..11 {
                assert_eq!(mask[(y, x)], 255, "pixel ({}, {})", x, y);
            }
        }
        // Far-away cells stay background.
        assert!(mask[(0, 0)] == 0);
        assert!(mask[(20, 20)] == 0);
    }

    #[test]
    fn persistent_change_is_absorbed_after_age_trim_frames() {
        let mut config = test_config(Sensitivity::Mixed);
        config.age_trim = 8.0;
        let grid = Grid::new(32, 32, 4).unwrap();
        let mut model = StatisticalModel::new(grid, &config);

        let mut state = ModelState::new(grid.cells(), config.num_models, config.var_init);
        let mut warped = ModelState::new(grid.cells(), config.num_models, config.var_init);
        for _ in 0..20 {
            warped.copy_from(&state);
            model.apply(&constant_frame(32, 32, 128), &warped, &mut state);
        }

        // A 2x2-cell patch; the probe pixel interpolates between changed
        // cells only, so it clears completely once they are absorbed.
        let mut changed = constant_frame(32, 32, 128);
        for y in 8..16 {
            for x in 8..16 {
                changed[(y, x)] = 255;
            }
        }
        let probe = (12, 12);
        let mut first_absorbed = None;
        for frame_index in 0..40 {
            warped.copy_from(&state);
            let foreground = model.apply(&changed, &warped, &mut state);
            let mask = match foreground {
                Foreground::Mask(mask) => mask,
                Foreground::Scores(_) => panic!("expected a mask"),
            };
            if frame_index == 0 {
                assert_eq!(mask[probe], 255, "fresh change must be foreground");
            }
            if mask[probe] == 0 {
                first_absorbed = Some(frame_index);
                break;
            }
        }
        // The patch stays foreground until the new model out-ages the old
        // apparent one, which saturates at age_trim.
        let absorbed = first_absorbed.expect("patch never absorbed");
        assert!(absorbed >= 5, "absorbed after {} frames", absorbed);
        assert!(absorbed <= 14, "absorbed after {} frames", absorbed);
    }

    #[test]
    fn older_candidate_takes_the_apparent_slot_even_when_apparent_matches() {
        // The warp can decay the apparent model's age below a candidate's.
        // Matching the apparent model must still hand slot 0 to the older
        // candidate.
        let config = test_config(Sensitivity::Mixed);
        let grid = Grid::new(8, 8, 4).unwrap();
        let mut model = StatisticalModel::new(grid, &config);
        let mut warped = ModelState::new(grid.cells(), config.num_models, config.var_init);
        for cell in 0..grid.cells() {
            warped.set(cell, 0, 100.0, 30.0, 2.0);
            warped.set(cell, 1, 200.0, 30.0, 9.0);
        }
        let mut out = ModelState::new(grid.cells(), config.num_models, config.var_init);
        model.apply(&constant_frame(8, 8, 100), &warped, &mut out);
        for cell in 0..grid.cells() {
            let apparent = out.index(cell, 0);
            let candidate = out.index(cell, 1);
            assert_eq!(out.means[apparent], 200.0);
            assert_eq!(out.ages[apparent], 9.0);
            assert!((out.means[candidate] - 100.0).abs() < 1e-3);
            assert_eq!(out.ages[candidate], 3.0);
        }
    }

    #[test]
    fn scores_mode_emits_normalized_distances() {
        let mut config = test_config(Sensitivity::Mixed);
        config.calc_probs = true;
        let grid = Grid::new(16, 16, 4).unwrap();
        let mut model = StatisticalModel::new(grid, &config);
        let frames: Vec<_> = (0..10).map(|_| constant_frame(16, 16, 100)).collect();
        let (state, _) = run_frames(&mut model, grid, &config, &frames);

        // One more frame, 20 gray levels brighter everywhere.
        let mut warped = ModelState::new(grid.cells(), config.num_models, config.var_init);
        warped.copy_from(&state);
        let mut out = ModelState::new(grid.cells(), config.num_models, config.var_init);
        let foreground = model.apply(&constant_frame(16, 16, 120), &warped, &mut out);
        let scores = match foreground {
            Foreground::Scores(scores) => scores,
            Foreground::Mask(_) => panic!("expected scores"),
        };
        // 20 gray levels outside the gate: the apparent model is left
        // alone and the score is 20^2 over the floored variance.
        let center = scores[(8, 8)];
        assert!((center - 16.0).abs() < 1e-3, "score {}", center);
    }

    #[test]
    fn update_first_is_least_sensitive_on_the_update_frame() {
        // An in-gate brightness step scores lower with update-first (the
        // model has already blended toward it) than with foreground-first,
        // which still tests against the warped statistics.
        let grid = Grid::new(16, 16, 4).unwrap();
        let mut score_by_mode = Vec::new();
        for &sensitivity in &[Sensitivity::UpdateFirst, Sensitivity::ForegroundFirst] {
            let mut config = test_config(sensitivity);
            config.calc_probs = true;
            let mut model = StatisticalModel::new(grid, &config);
            let mut frames: Vec<_> = (0..10).map(|_| constant_frame(16, 16, 100)).collect();
            frames.push(constant_frame(16, 16, 106));
            let (_, foreground) = run_frames(&mut model, grid, &config, &frames);
            let scores = match foreground {
                Foreground::Scores(scores) => scores,
                Foreground::Mask(_) => panic!("expected scores"),
            };
            score_by_mode.push(scores[(8, 8)]);
        }
        assert!(score_by_mode[0] < score_by_mode[1]);
        assert!(score_by_mode[1] > 1.0);
    }
}
