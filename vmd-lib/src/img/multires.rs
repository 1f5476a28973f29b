// SPDX-License-Identifier: MPL-2.0

//! Multi-resolution mean pyramids.

use nalgebra::DMatrix;

/// Build a mean pyramid with up to `levels` levels.
///
/// Level 0 is the original image; every following level halves the
/// resolution by averaging 2x2 blocks (an odd trailing row or column is
/// dropped). Construction stops early once a side would shrink below two
/// pixels, so the returned vector may be shorter than `levels`.
pub fn mean_pyramid(levels: usize, img: DMatrix<f32>) -> Vec<DMatrix<f32>> {
    let mut pyramid = Vec::with_capacity(levels.max(1));
    pyramid.push(img);
    while pyramid.len() < levels {
        let prev = pyramid.last().unwrap();
        let (height, width) = prev.shape();
        if height < 4 || width < 4 {
            break;
        }
        let half = DMatrix::from_fn(height / 2, width / 2, |y, x| {
            0.25 * (prev[(2 * y, 2 * x)]
                + prev[(2 * y, 2 * x + 1)]
                + prev[(2 * y + 1, 2 * x)]
                + prev[(2 * y + 1, 2 * x + 1)])
        });
        pyramid.push(half);
    }
    pyramid
}

/// Convert an `u8` frame to the float matrix the pyramid levels use.
pub fn to_f32(img: &DMatrix<u8>) -> DMatrix<f32> {
    img.map(|v| v as f32)
}
