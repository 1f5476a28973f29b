// SPDX-License-Identifier: MPL-2.0

//! # Moving-camera video motion detection
//!
//! Grid-based dual-model background/foreground estimation that stays valid
//! under camera motion. The background statistics live on a coarse grid of
//! square cells; every frame they are warped through a frame-to-frame
//! homography estimated by a sparse KLT tracker, then fused with the new
//! observations. The output is a per-pixel foreground map, either a binary
//! mask or an anomaly-score image.

// #![warn(missing_docs)]

pub mod errors;
pub mod estimator;
pub mod grid;
pub mod homography;
pub mod img;
pub mod interop;
pub mod klt;
pub mod model;

pub use crate::errors::{ConfigError, Error};
pub use crate::estimator::{Config, Foreground, ForegroundEstimator, Sensitivity};
