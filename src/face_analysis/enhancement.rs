//! Enhancement chain applied to the aligned face crop.
//!
//! Order is fixed: bilateral smoothing, illumination normalization (CLAHE on
//! luminance), grayscale reduction. Each step works on an owned copy and a
//! failing step is skipped with a warning.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use log::{debug, warn};

use super::config::EnhancementConfig;
use crate::error::AnalysisError;

pub const CLAHE_CLIP_LIMIT: f32 = 2.0;
pub const CLAHE_TILE_GRID: u32 = 8;

/// Run the configured chain; absent or empty input yields `None`
pub fn enhance(image: Option<&DynamicImage>, config: &EnhancementConfig) -> Option<DynamicImage> {
    let image = image?;
    if image.width() == 0 || image.height() == 0 {
        warn!("Enhancement skipped: image has a zero dimension");
        return None;
    }

    let mut current = image.clone();

    if config.apply_bilateral_filter {
        current = apply_step("bilateral filter", current, |img| {
            bilateral_filter(
                img,
                config.bilateral_diameter,
                config.bilateral_sigma_color,
                config.bilateral_sigma_space,
            )
        });
    }

    if config.apply_illumination_norm {
        current = apply_step("illumination normalization", current, normalize_illumination);
    }

    if config.apply_grayscale {
        current = apply_step("grayscale conversion", current, to_grayscale);
    }

    Some(current)
}

fn apply_step<F>(name: &str, image: DynamicImage, step: F) -> DynamicImage
where
    F: FnOnce(&DynamicImage) -> Result<DynamicImage, AnalysisError>,
{
    match step(&image) {
        Ok(out) => {
            debug!("Applied {}", name);
            out
        }
        Err(e) => {
            warn!("Skipping {}: {}", name, e);
            image
        }
    }
}

fn unsupported(image: &DynamicImage) -> AnalysisError {
    AnalysisError::UnsupportedImage(format!("{:?}", image.color()))
}

/// BT.601 luma, matching the weights common face models are trained with
pub fn luma_bt601(rgb: &RgbImage) -> GrayImage {
    ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([l.round().clamp(0.0, 255.0) as u8])
    })
}

/// Single-channel view of any image, used for detection and landmarking
pub fn gray_view(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        DynamicImage::ImageRgb8(rgb) => luma_bt601(rgb),
        other => luma_bt601(&other.to_rgb8()),
    }
}

/// Grayscale reduction; already-gray input passes through unchanged
pub fn to_grayscale(image: &DynamicImage) -> Result<DynamicImage, AnalysisError> {
    match image {
        DynamicImage::ImageLuma8(_) => Ok(image.clone()),
        DynamicImage::ImageRgb8(rgb) => Ok(DynamicImage::ImageLuma8(luma_bt601(rgb))),
        other => Err(unsupported(other)),
    }
}

/// Edge-preserving bilateral smoothing for 8-bit gray and RGB images
///
/// A non-positive `diameter` derives the radius from `sigma_space`.
/// Colour distance on RGB is the sum of absolute channel differences.
pub fn bilateral_filter(
    image: &DynamicImage,
    diameter: i32,
    sigma_color: f64,
    sigma_space: f64,
) -> Result<DynamicImage, AnalysisError> {
    if !sigma_color.is_finite() || !sigma_space.is_finite() {
        return Err(AnalysisError::InvalidConfig(
            "bilateral sigmas must be finite".to_string(),
        ));
    }
    let kernel = BilateralKernel::new(diameter, sigma_color, sigma_space);
    match image {
        DynamicImage::ImageLuma8(gray) => Ok(DynamicImage::ImageLuma8(kernel.apply(gray))),
        DynamicImage::ImageRgb8(rgb) => Ok(DynamicImage::ImageRgb8(kernel.apply(rgb))),
        other => Err(unsupported(other)),
    }
}

struct BilateralKernel {
    offsets: Vec<(i32, i32, f32)>,
    color_coeff: f64,
}

impl BilateralKernel {
    fn new(diameter: i32, sigma_color: f64, sigma_space: f64) -> Self {
        let sigma_color = if sigma_color <= 0.0 { 1.0 } else { sigma_color };
        let sigma_space = if sigma_space <= 0.0 { 1.0 } else { sigma_space };
        let radius = if diameter <= 0 {
            (sigma_space * 1.5).round() as i32
        } else {
            diameter / 2
        }
        .max(1);

        let space_coeff = -0.5 / (sigma_space * sigma_space);
        let mut offsets = Vec::new();
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let r2 = (dx * dx + dy * dy) as f64;
                if r2.sqrt() > radius as f64 {
                    continue;
                }
                offsets.push((dx, dy, (r2 * space_coeff).exp() as f32));
            }
        }

        Self {
            offsets,
            color_coeff: -0.5 / (sigma_color * sigma_color),
        }
    }

    fn apply<P>(&self, src: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
    {
        let channels = P::CHANNEL_COUNT as usize;
        let color_lut: Vec<f32> = (0..=255 * channels)
            .map(|i| ((i * i) as f64 * self.color_coeff).exp() as f32)
            .collect();

        let (width, height) = src.dimensions();
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;
        let mut out = ImageBuffer::<P, Vec<u8>>::new(width, height);

        for y in 0..height {
            for x in 0..width {
                let center = src.get_pixel(x, y).channels();
                let mut sum = [0f32; 4];
                let mut weight_sum = 0f32;

                for &(dx, dy, space_w) in &self.offsets {
                    let sx = (x as i32 + dx).clamp(0, max_x) as u32;
                    let sy = (y as i32 + dy).clamp(0, max_y) as u32;
                    let neighbour = src.get_pixel(sx, sy).channels();
                    let diff: usize = center
                        .iter()
                        .zip(neighbour)
                        .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs() as usize)
                        .sum();
                    let w = space_w * color_lut[diff];
                    for c in 0..channels {
                        sum[c] += w * neighbour[c] as f32;
                    }
                    weight_sum += w;
                }

                let target = out.get_pixel_mut(x, y).channels_mut();
                for c in 0..channels {
                    target[c] = (sum[c] / weight_sum).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        out
    }
}

/// Contrast-limited adaptive histogram equalization on luminance
pub fn normalize_illumination(image: &DynamicImage) -> Result<DynamicImage, AnalysisError> {
    match image {
        DynamicImage::ImageLuma8(gray) => Ok(DynamicImage::ImageLuma8(clahe(
            gray,
            CLAHE_CLIP_LIMIT,
            CLAHE_TILE_GRID,
        ))),
        DynamicImage::ImageRgb8(rgb) => {
            let (luma, chroma) = split_yuv(rgb);
            let equalized = clahe(&luma, CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID);
            Ok(DynamicImage::ImageRgb8(merge_yuv(&equalized, &chroma)))
        }
        other => Err(unsupported(other)),
    }
}

/// Split RGB into a quantized Y plane and unquantized (U, V) pairs
fn split_yuv(rgb: &RgbImage) -> (GrayImage, Vec<(f32, f32)>) {
    let mut chroma = Vec::with_capacity((rgb.width() * rgb.height()) as usize);
    let luma = ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0.map(f32::from);
        let l = 0.299 * r + 0.587 * g + 0.114 * b;
        // from_fn walks row-major, same as the chroma index below
        chroma.push(((b - l) * 0.492, (r - l) * 0.877));
        Luma([l.round().clamp(0.0, 255.0) as u8])
    });
    (luma, chroma)
}

fn merge_yuv(luma: &GrayImage, chroma: &[(f32, f32)]) -> RgbImage {
    let width = luma.width();
    ImageBuffer::from_fn(width, luma.height(), |x, y| {
        let l = luma.get_pixel(x, y)[0] as f32;
        let (u, v) = chroma[(y * width + x) as usize];
        let r = l + 1.140 * v;
        let g = l - 0.395 * u - 0.581 * v;
        let b = l + 2.032 * u;
        Rgb([r, g, b].map(|c| c.round().clamp(0.0, 255.0) as u8))
    })
}

/// CLAHE over a `grid` x `grid` tile layout with bilinear blending between tiles
pub fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }
    let tile_w = width.div_ceil(grid.clamp(1, width));
    let tile_h = height.div_ceil(grid.clamp(1, height));
    // no empty trailing tiles
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            luts[(ty * tiles_x + tx) as usize] = tile_lut(gray, x0..x1, y0..y1, clip_limit);
        }
    }

    let inv_w = 1.0 / tile_w as f32;
    let inv_h = 1.0 / tile_h as f32;
    ImageBuffer::from_fn(width, height, |x, y| {
        let v = gray.get_pixel(x, y)[0] as usize;

        let tyf = y as f32 * inv_h - 0.5;
        let ty1 = tyf.floor() as i64;
        let ya = tyf - ty1 as f32;
        let ty2 = (ty1 + 1).min(tiles_y as i64 - 1) as u32;
        let ty1 = ty1.max(0) as u32;

        let txf = x as f32 * inv_w - 0.5;
        let tx1 = txf.floor() as i64;
        let xa = txf - tx1 as f32;
        let tx2 = (tx1 + 1).min(tiles_x as i64 - 1) as u32;
        let tx1 = tx1.max(0) as u32;

        let lut = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;
        let top = lut(tx1, ty1) * (1.0 - xa) + lut(tx2, ty1) * xa;
        let bottom = lut(tx1, ty2) * (1.0 - xa) + lut(tx2, ty2) * xa;
        let value = top * (1.0 - ya) + bottom * ya;
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

fn tile_lut(
    gray: &GrayImage,
    xs: std::ops::Range<u32>,
    ys: std::ops::Range<u32>,
    clip_limit: f32,
) -> [u8; 256] {
    let mut hist = [0u32; 256];
    let mut area = 0u32;
    for y in ys {
        for x in xs.clone() {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
            area += 1;
        }
    }

    let mut lut = [0u8; 256];
    if area == 0 {
        for (i, entry) in lut.iter_mut().enumerate() {
            *entry = i as u8;
        }
        return lut;
    }

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }

        let batch = excess / 256;
        let residual = excess % 256;
        for bin in hist.iter_mut() {
            *bin += batch;
        }
        if residual > 0 {
            let step = (256 / residual).max(1) as usize;
            for bin in hist.iter_mut().step_by(step).take(residual as usize) {
                *bin += 1;
            }
        }
    }

    let scale = 255.0 / area as f32;
    let mut cumulative = 0u32;
    for (entry, &count) in lut.iter_mut().zip(hist.iter()) {
        cumulative += count;
        *entry = (cumulative as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba};

    fn gradient_gray(width: u32, height: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, y| Luma([((x * 3 + y) % 200 + 20) as u8]))
    }

    fn grayscale_only() -> EnhancementConfig {
        EnhancementConfig {
            apply_bilateral_filter: false,
            apply_illumination_norm: false,
            apply_grayscale: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_absent_and_empty_inputs() {
        let config = EnhancementConfig::default();
        assert!(enhance(None, &config).is_none());
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(enhance(Some(&empty), &config).is_none());
    }

    #[test]
    fn test_grayscale_is_idempotent() {
        let gray = DynamicImage::ImageLuma8(gradient_gray(40, 30));
        let config = grayscale_only();
        let once = enhance(Some(&gray), &config).unwrap();
        let twice = enhance(Some(&once), &config).unwrap();
        assert_eq!(once, gray);
        assert_eq!(once, twice);

        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([200, 100, 50])));
        let once = enhance(Some(&rgb), &config).unwrap();
        let twice = enhance(Some(&once), &config).unwrap();
        assert!(matches!(once, DynamicImage::ImageLuma8(_)));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_input_is_not_mutated() {
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_fn(32, 32, |x, y| {
            Rgb([(x * 8) as u8, (y * 8) as u8, 128])
        }));
        let before = rgb.clone();
        let out = enhance(Some(&rgb), &EnhancementConfig::default()).unwrap();
        assert_eq!(rgb, before);
        assert_eq!(out.dimensions(), (32, 32));
        assert!(matches!(out, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_unsupported_layout_skips_steps() {
        let rgba = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(4, 4, Rgba([1, 2, 3, 255])));
        let out = enhance(Some(&rgba), &EnhancementConfig::default()).unwrap();
        assert_eq!(out, rgba);
    }

    #[test]
    fn test_bilateral_keeps_flat_regions() {
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([77])));
        let out = bilateral_filter(&flat, 7, 50.0, 50.0).unwrap();
        assert_eq!(out, flat);

        let derived = bilateral_filter(&flat, 0, 50.0, 2.0).unwrap();
        assert_eq!(derived, flat);
    }

    #[test]
    fn test_bilateral_preserves_strong_edge() {
        let edge = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 10 } else { 240 }]));
        let out = bilateral_filter(&DynamicImage::ImageLuma8(edge), 7, 10.0, 50.0).unwrap();
        let out = out.to_luma8();
        assert!(out.get_pixel(9, 10)[0] < 20);
        assert!(out.get_pixel(10, 10)[0] > 230);
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let low = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x % 16) as u8]));
        let out = clahe(&low, CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID);
        let min = out.pixels().map(|p| p[0]).min().unwrap();
        let max = out.pixels().map(|p| p[0]).max().unwrap();
        assert!(max - min > 15, "range {}..{}", min, max);
    }

    #[test]
    fn test_clahe_handles_tiny_images() {
        let tiny = gradient_gray(3, 2);
        let out = clahe(&tiny, CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID);
        assert_eq!(out.dimensions(), (3, 2));
    }

    #[test]
    fn test_yuv_round_trip_on_gray_pixels() {
        let rgb = RgbImage::from_fn(4, 4, |x, y| {
            let v = (x * 40 + y * 10) as u8;
            Rgb([v, v, v])
        });
        let (luma, chroma) = split_yuv(&rgb);
        assert_eq!(merge_yuv(&luma, &chroma), rgb);
    }
}
