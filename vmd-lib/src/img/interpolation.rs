// SPDX-License-Identifier: MPL-2.0

//! Bilinear interpolation of matrix-shaped images.

use nalgebra::DMatrix;

/// Bilinear interpolation of the image at position `(x, y)`.
///
/// `x` indexes columns and `y` rows, matching the `(row, col)` matrix
/// convention used for frames. Coordinates are clamped to the image
/// borders, so sampling outside returns the nearest border value.
pub fn linear(x: f32, y: f32, img: &DMatrix<f32>) -> f32 {
    let (height, width) = img.shape();
    let x = x.max(0.0).min((width - 1) as f32);
    let y = y.max(0.0).min((height - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let top = (1.0 - fx) * img[(y0, x0)] + fx * img[(y0, x1)];
    let bottom = (1.0 - fx) * img[(y1, x0)] + fx * img[(y1, x1)];
    (1.0 - fy) * top + fy * bottom
}

/// Bilinear interpolation of a `(gx, gy)` gradient pair image at `(x, y)`.
pub fn linear_pair(x: f32, y: f32, img: &DMatrix<(f32, f32)>) -> (f32, f32) {
    let (height, width) = img.shape();
    let x = x.max(0.0).min((width - 1) as f32);
    let y = y.max(0.0).min((height - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let w00 = (1.0 - fx) * (1.0 - fy);
    let w10 = fx * (1.0 - fy);
    let w01 = (1.0 - fx) * fy;
    let w11 = fx * fy;
    let p00 = img[(y0, x0)];
    let p10 = img[(y0, x1)];
    let p01 = img[(y1, x0)];
    let p11 = img[(y1, x1)];
    (
        w00 * p00.0 + w10 * p10.0 + w01 * p01.0 + w11 * p11.0,
        w00 * p00.1 + w10 * p10.1 + w01 * p01.1 + w11 * p11.1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_positions_return_pixel_values() {
        let img = DMatrix::from_row_slice(2, 2, &[0.0, 10.0, 20.0, 30.0]);
        assert_eq!(linear(0.0, 0.0, &img), 0.0);
        assert_eq!(linear(1.0, 0.0, &img), 10.0);
        assert_eq!(linear(0.0, 1.0, &img), 20.0);
        assert_eq!(linear(1.0, 1.0, &img), 30.0);
    }

    #[test]
    fn midpoint_averages_the_four_neighbors() {
        let img = DMatrix::from_row_slice(2, 2, &[0.0, 10.0, 20.0, 30.0]);
        assert!((linear(0.5, 0.5, &img) - 15.0).abs() < 1e-6);
    }

    #[test]
    fn outside_samples_clamp_to_the_border() {
        let img = DMatrix::from_row_slice(2, 2, &[0.0, 10.0, 20.0, 30.0]);
        assert_eq!(linear(-3.0, -3.0, &img), 0.0);
        assert_eq!(linear(5.0, 5.0, &img), 30.0);
    }
}
