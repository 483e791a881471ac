//! Image preprocessing for the inference backends
//!
//! Saved-graph artifacts declare their own input geometry; traced graphs use
//! a fixed one. Task-bundled exports bypass this module and own their whole
//! preprocessing inside the prediction path.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;

use crate::engine::locator::BoundingBox;
use crate::error::PredictError;

/// Fixed input edge for traced-graph artifacts.
pub const TRACED_INPUT_SIZE: u32 = 224;

/// Input geometry declared by a saved-graph artifact, layout `[1, H, W, C]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub height: u32,
    pub width: u32,
    pub channels: i64,
}

/// Build the batch-of-one NHWC tensor a saved-graph artifact declares.
///
/// Channel count 1 converts to grayscale and keeps a trailing singleton
/// channel axis; 3 packs RGB. Pixel values are normalized to `[0, 1]`.
pub fn prepare_declared(
    image: &DynamicImage,
    spec: InputSpec,
) -> Result<Array4<f32>, PredictError> {
    match spec.channels {
        1 => {
            let gray = image.to_luma8();
            let resized =
                image::imageops::resize(&gray, spec.width, spec.height, FilterType::Triangle);
            let mut tensor =
                Array4::<f32>::zeros((1, spec.height as usize, spec.width as usize, 1));
            for (x, y, pixel) in resized.enumerate_pixels() {
                tensor[[0, y as usize, x as usize, 0]] = pixel[0] as f32 / 255.0;
            }
            Ok(tensor)
        }
        3 => {
            let rgb = image.to_rgb8();
            let resized =
                image::imageops::resize(&rgb, spec.width, spec.height, FilterType::Triangle);
            let mut tensor =
                Array4::<f32>::zeros((1, spec.height as usize, spec.width as usize, 3));
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
                }
            }
            Ok(tensor)
        }
        channels => Err(PredictError::UnsupportedChannelSpec { channels }),
    }
}

/// Build the batch-of-one 224x224 channel-first tensor for traced graphs.
pub fn prepare_traced(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(
        &rgb,
        TRACED_INPUT_SIZE,
        TRACED_INPUT_SIZE,
        FilterType::Triangle,
    );
    rgb_to_chw(&resized)
}

/// Pack an RGB image into a `[1, 3, H, W]` tensor normalized to `[0, 1]`.
pub(crate) fn rgb_to_chw(rgb: &RgbImage) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Crop to a located face region, clamped to the image bounds.
pub fn crop_box(image: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (image_width, image_height) = image.dimensions();
    let x = bbox.x.min(image_width.saturating_sub(1));
    let y = bbox.y.min(image_height.saturating_sub(1));
    let width = bbox.width.clamp(1, image_width - x);
    let height = bbox.height.clamp(1, image_height - y);
    image.crop_imm(x, y, width, height)
}

/// Mapping from letterboxed-canvas coordinates back to the original image.
#[derive(Debug, Clone, Copy)]
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );

        let new_w = (orig_w as f32 * scale) as u32;
        let new_h = (orig_h as f32 * scale) as u32;

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert canvas coordinates back to original image space.
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}

/// Aspect-preserving resize onto a centered square canvas padded with black.
pub fn letterbox(image: &DynamicImage, target: u32) -> (RgbImage, ResizeInfo) {
    let info = ResizeInfo::new(image.dimensions(), (target, target));

    let new_w = ((info.original_width as f32 * info.scale) as u32).max(1);
    let new_h = ((info.original_height as f32 * info.scale) as u32).max(1);

    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::Lanczos3);

    let mut canvas: RgbImage = ImageBuffer::from_pixel(target, target, Rgb([0u8, 0, 0]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        i64::from(info.offset_x),
        i64::from(info.offset_y),
    );

    (canvas, info)
}
