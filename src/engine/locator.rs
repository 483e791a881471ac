//! Face locator
//!
//! Best-effort frontal-face detection used to crop classification input and
//! to annotate results. Detection is an accuracy aid, not a required step:
//! any internal failure degrades to "no face found" and inference proceeds
//! on the full frame.

use std::path::Path;

use image::DynamicImage;
use opencv::core::{Mat, Rect, Size, Vector};
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Cascade parameters for the frontal-face detector.
const SCALE_FACTOR: f64 = 1.1;
const MIN_NEIGHBORS: i32 = 5;
const MIN_FACE_SIZE: i32 = 60;

/// Axis-aligned face region in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Frontal-face locator backed by a pretrained Haar cascade.
pub struct FaceLocator {
    classifier: Option<Mutex<CascadeClassifier>>,
}

impl FaceLocator {
    /// Load the cascade from `cascade_path`. A missing or unreadable cascade
    /// disables the locator instead of failing construction.
    pub fn new(cascade_path: &Path) -> Self {
        let classifier = match CascadeClassifier::new(&cascade_path.to_string_lossy()) {
            Ok(classifier) => match classifier.empty() {
                Ok(false) => Some(Mutex::new(classifier)),
                _ => {
                    warn!(
                        "face cascade {} is empty; locator disabled",
                        cascade_path.display()
                    );
                    None
                }
            },
            Err(e) => {
                warn!(
                    "failed to load face cascade {}: {}; locator disabled",
                    cascade_path.display(),
                    e
                );
                None
            }
        };
        Self { classifier }
    }

    /// A locator that always reports "no face".
    pub fn disabled() -> Self {
        Self { classifier: None }
    }

    /// Locate the most prominent face, or report none found. Never errors.
    pub fn locate(&self, image: &DynamicImage) -> Option<BoundingBox> {
        let classifier = self.classifier.as_ref()?;
        match run_cascade(classifier, image) {
            Ok(found) => found,
            Err(e) => {
                debug!("face detection failed: {}", e);
                None
            }
        }
    }
}

fn run_cascade(
    classifier: &Mutex<CascadeClassifier>,
    image: &DynamicImage,
) -> opencv::Result<Option<BoundingBox>> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Ok(None);
    }

    let mat = Mat::from_slice(gray.as_raw())?;
    let mat = mat.reshape(1, height as i32)?;

    let mut faces = Vector::<Rect>::new();
    classifier.lock().detect_multi_scale(
        &mat,
        &mut faces,
        SCALE_FACTOR,
        MIN_NEIGHBORS,
        0,
        Size::new(MIN_FACE_SIZE, MIN_FACE_SIZE),
        Size::new(0, 0),
    )?;

    Ok(largest_face(faces.iter(), width, height))
}

/// Pick the largest candidate by area and clamp it to the image bounds.
/// Ties keep the earlier candidate (detector order).
fn largest_face(
    candidates: impl Iterator<Item = Rect>,
    image_width: u32,
    image_height: u32,
) -> Option<BoundingBox> {
    candidates
        .filter(|rect| rect.width > 0 && rect.height > 0)
        .fold(None::<Rect>, |best, rect| match best {
            Some(b) if i64::from(b.width) * i64::from(b.height)
                >= i64::from(rect.width) * i64::from(rect.height) =>
            {
                Some(b)
            }
            _ => Some(rect),
        })
        .and_then(|rect| clamp_to_image(rect, image_width, image_height))
}

fn clamp_to_image(rect: Rect, image_width: u32, image_height: u32) -> Option<BoundingBox> {
    let x = rect.x.max(0) as u32;
    let y = rect.y.max(0) as u32;
    if x >= image_width || y >= image_height {
        return None;
    }
    let width = (rect.width as u32).min(image_width - x);
    let height = (rect.height as u32).min(image_height - y);
    if width == 0 || height == 0 {
        return None;
    }
    Some(BoundingBox {
        x,
        y,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_face_wins() {
        let candidates = vec![
            Rect::new(0, 0, 20, 20),
            Rect::new(50, 50, 100, 120),
            Rect::new(10, 10, 60, 60),
        ];
        let best = largest_face(candidates.into_iter(), 640, 480).unwrap();
        assert_eq!(
            best,
            BoundingBox {
                x: 50,
                y: 50,
                width: 100,
                height: 120
            }
        );
    }

    #[test]
    fn test_largest_face_tie_keeps_detector_order() {
        let candidates = vec![Rect::new(5, 5, 50, 50), Rect::new(90, 90, 50, 50)];
        let best = largest_face(candidates.into_iter(), 640, 480).unwrap();
        assert_eq!(best.x, 5);
    }

    #[test]
    fn test_box_clamped_to_image_bounds() {
        let candidates = vec![Rect::new(-10, 600, 100, 100)];
        assert!(largest_face(candidates.into_iter(), 640, 480).is_none());

        let candidates = vec![Rect::new(600, 440, 100, 100)];
        let best = largest_face(candidates.into_iter(), 640, 480).unwrap();
        assert_eq!(
            best,
            BoundingBox {
                x: 600,
                y: 440,
                width: 40,
                height: 40
            }
        );
    }

    #[test]
    fn test_no_candidates_means_no_face() {
        assert!(largest_face(std::iter::empty(), 640, 480).is_none());
    }

    #[test]
    fn test_disabled_locator_reports_no_face() {
        let locator = FaceLocator::disabled();
        let image = DynamicImage::new_rgb8(64, 64);
        assert!(locator.locate(&image).is_none());
    }
}
