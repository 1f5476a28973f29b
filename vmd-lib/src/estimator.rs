// SPDX-License-Identifier: MPL-2.0

//! Foreground estimator facade.
//!
//! One `ForegroundEstimator` owns the full per-stream state: the KLT
//! tracker, the compensation and statistical models and the two retained
//! state generations. `process` runs one frame through the pipeline
//! `smooth -> homography -> compensate -> update -> emit` and returns the
//! foreground map. Instances are independent; there is no shared state.

use nalgebra::{DMatrix, Matrix3};
use std::str::FromStr;

use crate::errors::{ConfigError, Error};
use crate::grid::Grid;
use crate::img::filtering;
use crate::klt::{KltConfig, KltTracker};
use crate::model::compensation::CompensationModel;
use crate::model::statistical::StatisticalModel;
use crate::model::ModelState;

/// When to update the models relative to reading out foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Sensitivity {
    /// Update means, variances and ages, then emit from the new state.
    /// Least sensitive to change, least sensitive to noise.
    UpdateFirst,
    /// Emit from the warped state, then update. Most sensitive.
    ForegroundFirst,
    /// Update means, emit from new means and old variances, then update
    /// variances and ages.
    Mixed,
}

impl FromStr for Sensitivity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update-first" => Ok(Sensitivity::UpdateFirst),
            "foreground-first" => Ok(Sensitivity::ForegroundFirst),
            "mixed" => Ok(Sensitivity::Mixed),
            other => Err(ConfigError::UnknownSensitivity(other.to_string())),
        }
    }
}

/// Estimator configuration, validated at construction.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Models per cell, at least 2 (one apparent + candidates).
    pub num_models: usize,
    /// Side of the square grid cells; image dimensions must be multiples.
    pub block_size: usize,
    /// Initial model variance.
    pub var_init: f32,
    /// Lower bound kept on every variance.
    pub var_trim: f32,
    /// Age decay coefficient applied to high-variance warped cells.
    pub lam: f32,
    /// Variance threshold starting the age decay.
    pub theta_v: f32,
    /// Upper bound kept on every age.
    pub age_trim: f32,
    /// Squared-distance gate for matching an observation to a model.
    pub theta_s: f32,
    /// Foreground decision threshold in standard deviations; unused when
    /// `calc_probs` is set.
    pub theta_d: f32,
    /// Allow the warp to re-elect the apparent model per cell.
    pub dynamic: bool,
    /// Emit anomaly scores instead of a binary mask.
    pub calc_probs: bool,
    pub sensitivity: Sensitivity,
    /// Apply the median(5) + Gaussian(7x7) pre-blur.
    pub smooth: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_models: 2,
            block_size: 4,
            var_init: 20.0 * 20.0,
            var_trim: 5.0 * 5.0,
            lam: 0.001,
            theta_v: 50.0 * 50.0,
            age_trim: 30.0,
            theta_s: 2.0,
            theta_d: 2.0,
            dynamic: false,
            calc_probs: false,
            sensitivity: Sensitivity::Mixed,
            smooth: true,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_models < 2 {
            return Err(ConfigError::NotEnoughModels(self.num_models));
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        Ok(())
    }
}

/// Per-frame output: a `{0, 255}` mask, or anomaly scores (the squared
/// normalized distance to the interpolated apparent model) when
/// `calc_probs` is set.
#[derive(Debug, Clone, PartialEq)]
pub enum Foreground {
    Mask(DMatrix<u8>),
    Scores(DMatrix<f32>),
}

impl Foreground {
    pub fn as_mask(&self) -> Option<&DMatrix<u8>> {
        match self {
            Foreground::Mask(mask) => Some(mask),
            Foreground::Scores(_) => None,
        }
    }

    pub fn as_scores(&self) -> Option<&DMatrix<f32>> {
        match self {
            Foreground::Scores(scores) => Some(scores),
            Foreground::Mask(_) => None,
        }
    }
}

/// Pipeline state built on the first frame, once dimensions are known.
struct Pipeline {
    grid: Grid,
    klt: KltTracker,
    compensation: CompensationModel,
    statistical: StatisticalModel,
    /// Statistical output of the last frame; next frame's warp input.
    state: ModelState,
    /// Warped statistics scratch, overwritten every frame.
    warped: ModelState,
}

/// Moving-camera foreground estimator.
pub struct ForegroundEstimator {
    config: Config,
    klt_config: KltConfig,
    pipeline: Option<Pipeline>,
}

impl ForegroundEstimator {
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_klt_config(config, KltConfig::default())
    }

    /// Construct with explicit tracker settings.
    pub fn with_klt_config(config: Config, klt_config: KltConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(ForegroundEstimator {
            config,
            klt_config,
            pipeline: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current per-cell statistics, available once a first frame was
    /// processed.
    pub fn models(&self) -> Option<&ModelState> {
        self.pipeline.as_ref().map(|pipeline| &pipeline.state)
    }

    /// Process one frame and return its foreground map.
    ///
    /// Frames must arrive in capture order and share the dimensions of the
    /// first frame. The first frame initializes the models and its
    /// foreground is computed against the fresh statistics.
    pub fn process(&mut self, frame: &DMatrix<u8>) -> Result<Foreground, Error> {
        let smooth = self.config.smooth;
        let pipeline = match &mut self.pipeline {
            Some(pipeline) => pipeline,
            None => return self.first_pass(frame),
        };

        let (height, width) = frame.shape();
        if (width, height) != (pipeline.grid.width(), pipeline.grid.height()) {
            return Err(Error::DimensionMismatch {
                expected_width: pipeline.grid.width(),
                expected_height: pipeline.grid.height(),
                actual_width: width,
                actual_height: height,
            });
        }

        let frame = if smooth {
            filtering::gaussian_blur_7(&filtering::median_blur_5(frame))
        } else {
            frame.clone()
        };

        let h = pipeline.klt.run_track(&frame);
        pipeline
            .compensation
            .compensate(&h, &pipeline.state, &mut pipeline.warped);
        let foreground = pipeline
            .statistical
            .apply(&frame, &pipeline.warped, &mut pipeline.state);
        Ok(foreground)
    }

    /// Forget all state; the next frame is treated as a first frame.
    pub fn reset(&mut self) {
        self.pipeline = None;
    }

    fn first_pass(&mut self, frame: &DMatrix<u8>) -> Result<Foreground, Error> {
        let (height, width) = frame.shape();
        let grid = Grid::new(width, height, self.config.block_size)?;
        log::debug!(
            "estimator: first frame {}x{}, grid {}x{}, {} models per cell",
            width,
            height,
            grid.cols(),
            grid.rows(),
            self.config.num_models
        );

        let mut klt = KltTracker::new(self.klt_config.clone());
        klt.init(frame);

        let compensation = CompensationModel::new(grid, &self.config);
        let mut statistical = StatisticalModel::new(grid, &self.config);
        let mut state = ModelState::new(grid.cells(), self.config.num_models, self.config.var_init);
        let mut warped =
            ModelState::new(grid.cells(), self.config.num_models, self.config.var_init);

        // The first frame warps through the identity and fuses into the
        // freshly initialized statistics.
        compensation.compensate(&Matrix3::identity(), &state, &mut warped);
        let foreground = statistical.apply(frame, &warped, &mut state);

        self.pipeline = Some(Pipeline {
            grid,
            klt,
            compensation,
            statistical,
            state,
            warped,
        });
        Ok(foreground)
    }
}
