//! Image decoding for the Load stage.
//!
//! Photos are decoded to 8-bit RGB and turned upright according to their EXIF
//! orientation tag, so landmarks are predicted on the image as a viewer sees it.

use anyhow::{Context, Result};
use exif::{In, Reader, Tag, Value};
use image::{imageops, DynamicImage, RgbImage};
use log::debug;
use std::path::Path;

/// EXIF orientation tag values (0th IFD, tag 0x0112)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExifOrientation {
    /// Tag missing or out of range
    Undefined = 0,
    TopLeft = 1,
    TopRight = 2,
    BottomRight = 3,
    BottomLeft = 4,
    /// Mirrored along the main diagonal
    LeftTop = 5,
    /// Stored rotated; displayed after a 90 degree clockwise turn
    RightTop = 6,
    /// Mirrored along the anti-diagonal
    RightBottom = 7,
    /// Stored rotated; displayed after a 90 degree counter-clockwise turn
    LeftBottom = 8,
}

impl From<u32> for ExifOrientation {
    fn from(value: u32) -> Self {
        match value {
            1 => ExifOrientation::TopLeft,
            2 => ExifOrientation::TopRight,
            3 => ExifOrientation::BottomRight,
            4 => ExifOrientation::BottomLeft,
            5 => ExifOrientation::LeftTop,
            6 => ExifOrientation::RightTop,
            7 => ExifOrientation::RightBottom,
            8 => ExifOrientation::LeftBottom,
            _ => ExifOrientation::Undefined,
        }
    }
}

/// Decode an image file into upright 8-bit RGB
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    let rgb = decoded.to_rgb8();

    // A file without EXIF is the common case, not an error
    let orientation = read_exif_orientation(path).unwrap_or(ExifOrientation::Undefined);
    if orientation != ExifOrientation::Undefined && orientation != ExifOrientation::TopLeft {
        debug!("Applying EXIF orientation {:?} to {}", orientation, path.display());
    }

    Ok(DynamicImage::ImageRgb8(apply_orientation(rgb, orientation)))
}

/// Read the EXIF orientation tag of an image file
pub fn read_exif_orientation(path: &Path) -> Result<ExifOrientation> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open image for EXIF reading: {}", path.display()))?;

    let mut buf_reader = std::io::BufReader::new(file);
    let exif = Reader::new()
        .read_from_container(&mut buf_reader)
        .context("Failed to read EXIF data")?;

    let orientation = exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| match &field.value {
            Value::Short(values) => values.first().map(|&v| ExifOrientation::from(v as u32)),
            _ => None,
        })
        .unwrap_or(ExifOrientation::Undefined);
    Ok(orientation)
}

/// Turn a stored image upright for the given orientation tag
pub fn apply_orientation(img: RgbImage, orientation: ExifOrientation) -> RgbImage {
    match orientation {
        ExifOrientation::Undefined | ExifOrientation::TopLeft => img,
        ExifOrientation::TopRight => imageops::flip_horizontal(&img),
        ExifOrientation::BottomRight => imageops::rotate180(&img),
        ExifOrientation::BottomLeft => imageops::flip_vertical(&img),
        ExifOrientation::LeftTop => imageops::flip_horizontal(&imageops::rotate90(&img)),
        ExifOrientation::RightTop => imageops::rotate90(&img),
        ExifOrientation::RightBottom => imageops::flip_horizontal(&imageops::rotate270(&img)),
        ExifOrientation::LeftBottom => imageops::rotate270(&img),
    }
}
