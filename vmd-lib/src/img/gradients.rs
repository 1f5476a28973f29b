// SPDX-License-Identifier: MPL-2.0

//! Centered image gradients.

use nalgebra::DMatrix;

/// Centered gradients `(gx, gy)` of an image, one pair per pixel.
///
/// Border pixels use one-sided differences scaled like the centered ones
/// (the border value is replicated outward).
pub fn centered_f32(img: &DMatrix<f32>) -> DMatrix<(f32, f32)> {
    let (height, width) = img.shape();
    DMatrix::from_fn(height, width, |y, x| {
        let xm = if x > 0 { x - 1 } else { 0 };
        let xp = (x + 1).min(width - 1);
        let ym = if y > 0 { y - 1 } else { 0 };
        let yp = (y + 1).min(height - 1);
        let gx = 0.5 * (img[(y, xp)] - img[(y, xm)]);
        let gy = 0.5 * (img[(yp, x)] - img[(ym, x)]);
        (gx, gy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizontal_ramp_has_unit_x_gradient() {
        let img = DMatrix::from_fn(4, 5, |_, x| x as f32);
        let grad = centered_f32(&img);
        // Interior pixels see the full centered difference.
        assert_eq!(grad[(1, 2)], (1.0, 0.0));
        assert_eq!(grad[(2, 3)], (1.0, 0.0));
        // Borders fall back to half-magnitude one-sided differences.
        assert_eq!(grad[(0, 0)], (0.5, 0.0));
    }
}
