// SPDX-License-Identifier: MPL-2.0

//! Spatial pre-blur filters applied before the statistical update:
//! a 5x5 median followed by a 7x7 Gaussian.

use nalgebra::DMatrix;

/// 5x5 median filter with replicated borders.
pub fn median_blur_5(img: &DMatrix<u8>) -> DMatrix<u8> {
    let (height, width) = img.shape();
    DMatrix::from_fn(height, width, |y, x| {
        let mut window = [0u8; 25];
        let mut n = 0;
        for dy in -2i64..=2 {
            for dx in -2i64..=2 {
                let sy = (y as i64 + dy).max(0).min(height as i64 - 1) as usize;
                let sx = (x as i64 + dx).max(0).min(width as i64 - 1) as usize;
                window[n] = img[(sy, sx)];
                n += 1;
            }
        }
        window.sort_unstable();
        window[12]
    })
}

/// 7x7 Gaussian blur with replicated borders, applied separably.
///
/// Sigma is 1.4, the value a 7-tap kernel implies under OpenCV's
/// `sigma = 0.3 * ((ksize - 1) * 0.5 - 1) + 0.8` rule.
pub fn gaussian_blur_7(img: &DMatrix<u8>) -> DMatrix<u8> {
    let kernel = gaussian_kernel_7(1.4);
    let (height, width) = img.shape();

    // Horizontal pass into a float buffer, vertical pass back to u8.
    let mut horizontal = DMatrix::zeros(height, width);
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0f32;
            for (i, w) in kernel.iter().enumerate() {
                let sx = (x as i64 + i as i64 - 3).max(0).min(width as i64 - 1) as usize;
                acc += w * img[(y, sx)] as f32;
            }
            horizontal[(y, x)] = acc;
        }
    }
    DMatrix::from_fn(height, width, |y, x| {
        let mut acc = 0.0f32;
        for (i, w) in kernel.iter().enumerate() {
            let sy = (y as i64 + i as i64 - 3).max(0).min(height as i64 - 1) as usize;
            acc += w * horizontal[(sy, x)];
        }
        acc.round().max(0.0).min(255.0) as u8
    })
}

fn gaussian_kernel_7(sigma: f32) -> [f32; 7] {
    let mut kernel = [0.0f32; 7];
    let mut sum = 0.0;
    for (i, k) in kernel.iter_mut().enumerate() {
        let d = i as f32 - 3.0;
        *k = (-d * d / (2.0 * sigma * sigma)).exp();
        sum += *k;
    }
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}
