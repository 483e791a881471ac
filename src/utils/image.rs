//! Image utility functions

use anyhow::Result;
use image::DynamicImage;

/// Decode image from bytes (JPEG, PNG, etc.) with EXIF orientation handling.
/// This ensures images are correctly oriented regardless of how they were captured.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image))
}

/// Apply EXIF orientation to correct image rotation.
/// Mobile phones often store images with EXIF orientation tags instead of rotating pixels.
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1) as u8,
        Err(_) => 1, // No EXIF or error reading, assume normal orientation
    };

    // See: https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        1 => image,
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_png_roundtrip() {
        let rgb = image::RgbImage::from_pixel(8, 6, image::Rgb([10u8, 20, 30]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(rgb)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();

        let decoded = decode_image(&bytes.into_inner()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }
}
