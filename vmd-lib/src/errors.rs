// SPDX-License-Identifier: MPL-2.0

//! Error types of the foreground estimator.
//!
//! Only two things can go wrong from a caller's perspective: the
//! configuration is unusable, or a frame does not have the dimensions the
//! stream started with. Everything else (homography failures, cells warped
//! out of view, variance underflow) degrades gracefully inside the core.

use thiserror::Error;

/// Rejected configuration, fatal to the estimator instance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The per-cell mixture needs an apparent model and at least one candidate.
    #[error("at least two models per cell are required, got {0}")]
    NotEnoughModels(usize),
    #[error("block size must be at least 1 pixel")]
    ZeroBlockSize,
    /// The grid only tiles images whose sides are multiples of the block size.
    #[error("image dimensions {width}x{height} are not divisible by block size {block_size}")]
    IndivisibleDimensions {
        width: usize,
        height: usize,
        block_size: usize,
    },
    #[error("unknown sensitivity mode {0:?}, expected update-first, foreground-first or mixed")]
    UnknownSensitivity(String),
}

/// Errors surfaced by the estimator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    /// A frame arrived whose shape differs from the first frame's.
    /// The caller must `reset` or rebuild the estimator.
    #[error("frame is {actual_width}x{actual_height} but the stream started at {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: usize,
        expected_height: usize,
        actual_width: usize,
        actual_height: usize,
    },
}
