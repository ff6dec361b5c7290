//! Grayscale raster helpers: downscaling for detection and face-crop
//! normalization for the recognizer.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

/// Side length of the square grayscale crop every sample and probe is
/// normalized to.
pub const FACE_SIZE: u32 = 200;

/// Convert an RGB frame to 8-bit luma.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// Shrink an image by `factor` (0.5 halves each side). Factors ≥ 1.0 return a copy.
pub fn downscale(image: &GrayImage, factor: f32) -> GrayImage {
    if factor >= 1.0 {
        return image.clone();
    }
    let w = ((image.width() as f32 * factor) as u32).max(1);
    let h = ((image.height() as f32 * factor) as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

/// Crop `region` out of `gray` and normalize it to `FACE_SIZE`².
///
/// The region is clipped to the image first; `None` if nothing remains.
pub fn crop_face(gray: &GrayImage, region: &FaceRegion) -> Option<GrayImage> {
    let r = region.clamped(gray.width(), gray.height())?;
    let crop = imageops::crop_imm(gray, r.x, r.y, r.width, r.height).to_image();
    Some(normalize_face(&crop))
}

/// Resize a crop to `FACE_SIZE`², leaving already-normalized crops untouched.
pub fn normalize_face(face: &GrayImage) -> GrayImage {
    if face.dimensions() == (FACE_SIZE, FACE_SIZE) {
        return face.clone();
    }
    imageops::resize(face, FACE_SIZE, FACE_SIZE, FilterType::Triangle)
}
