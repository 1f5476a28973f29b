// SPDX-License-Identifier: MPL-2.0

//! Interoperability conversions between the image and matrix types.

use image::{GrayImage, Luma};
use nalgebra::DMatrix;

/// Render a gray frame matrix as an image.
///
/// Frames are column major with shape `(height, width)` while image
/// buffers are row major, so each pixel is copied individually instead of
/// wrapping the raw storage. Inverse of `matrix_from_image`.
#[allow(clippy::cast_possible_truncation)]
pub fn image_from_matrix(mat: &DMatrix<u8>) -> GrayImage {
    let (height, width) = mat.shape();
    let mut img = GrayImage::new(width as u32, height as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = Luma([mat[(y as usize, x as usize)]]);
    }
    img
}

/// Read a gray image into a frame matrix of shape `(height, width)`.
/// Inverse of `image_from_matrix`.
pub fn matrix_from_image(img: GrayImage) -> DMatrix<u8> {
    let (width, height) = img.dimensions();
    DMatrix::from_row_slice(height as usize, width as usize, img.as_raw())
}

/// Render a float-valued foreground score matrix as a gray image.
///
/// Scores are rescaled so that the maximum maps to 255. An all-zero score
/// matrix renders black.
#[allow(clippy::cast_possible_truncation)]
pub fn image_from_scores(scores: &DMatrix<f32>) -> GrayImage {
    let max = scores.iter().cloned().fold(0.0_f32, f32::max);
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
    let (height, width) = scores.shape();
    let mut img = GrayImage::new(width as u32, height as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let v = scale * scores[(y as usize, x as usize)];
        *pixel = Luma([v.max(0.0).min(255.0) as u8]);
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_matrix_roundtrip_keeps_orientation() {
        // 2 rows x 3 cols, distinct values.
        let mat = DMatrix::from_row_slice(2, 3, &[1u8, 2, 3, 4, 5, 6]);
        let img = image_from_matrix(&mat);
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 0)[0], 3);
        assert_eq!(img.get_pixel(0, 1)[0], 4);
        let back = matrix_from_image(img);
        assert_eq!(back, mat);
    }
}
