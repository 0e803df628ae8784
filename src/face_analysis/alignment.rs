//! Similarity-transform face alignment.
//!
//! Five anchors (both eye centres, nose tip, mouth corners) are fitted by
//! least squares onto a canonical layout and the source image is resampled
//! into a square crop. Degenerate anchor layouts are rejected before warping.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use log::debug;

use super::geometry::{centroid, distance, Point};
use super::landmarks::{
    LandmarkSet, LEFT_EYE, MOUTH_LEFT_CORNER, MOUTH_RIGHT_CORNER, NOSE_TIP, RIGHT_EYE,
};
use crate::error::AnalysisError;

/// Anchor positions on a unit face: right eye, left eye, nose tip, right and left mouth corner
pub const CANONICAL_ANCHORS: [(f64, f64); 5] = [
    (0.23, 0.202),
    (0.77, 0.202),
    (0.50, 0.520),
    (0.30, 0.790),
    (0.70, 0.790),
];

const MIN_ANCHOR_SPREAD: f64 = 1.0;
const MIN_EIGEN_RATIO: f64 = 1e-3;
const MIN_EYE_DISTANCE: f64 = 1.0;
const MIN_SCALE: f64 = 1e-6;

/// x' = a*x - b*y + tx, y' = b*x + a*y + ty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl SimilarityTransform {
    /// Least-squares fit mapping `src` onto `dst`
    pub fn estimate(src: &[Point], dst: &[Point]) -> Result<Self, AnalysisError> {
        if src.len() != dst.len() || src.len() < 2 {
            return Err(AnalysisError::DegenerateTransform("anchor count mismatch"));
        }
        let n = src.len() as f64;

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_u = 0.0;
        let mut sum_v = 0.0;
        let mut sum_xx_yy = 0.0;
        let mut sum_ux_vy = 0.0;
        let mut sum_vx_uy = 0.0;

        for (s, d) in src.iter().zip(dst) {
            sum_x += s.x;
            sum_y += s.y;
            sum_u += d.x;
            sum_v += d.y;
            sum_xx_yy += s.x * s.x + s.y * s.y;
            sum_ux_vy += d.x * s.x + d.y * s.y;
            sum_vx_uy += d.y * s.x - d.x * s.y;
        }

        let denom = n * sum_xx_yy - sum_x * sum_x - sum_y * sum_y;
        if !denom.is_finite() || denom.abs() < 1e-9 {
            return Err(AnalysisError::DegenerateTransform("singular least-squares system"));
        }

        let a = (n * sum_ux_vy - sum_u * sum_x - sum_v * sum_y) / denom;
        let b = (n * sum_vx_uy + sum_u * sum_y - sum_v * sum_x) / denom;
        let transform = Self {
            a,
            b,
            tx: (sum_u - a * sum_x + b * sum_y) / n,
            ty: (sum_v - b * sum_x - a * sum_y) / n,
        };

        let scale = transform.scale();
        let finite = scale.is_finite() && transform.tx.is_finite() && transform.ty.is_finite();
        if !finite || scale < MIN_SCALE {
            return Err(AnalysisError::DegenerateTransform("vanishing or non-finite scale"));
        }
        Ok(transform)
    }

    pub fn scale(&self) -> f64 {
        self.a.hypot(self.b)
    }

    pub fn rotation_degrees(&self) -> f64 {
        self.b.atan2(self.a).to_degrees()
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x - self.b * p.y + self.tx,
            self.b * p.x + self.a * p.y + self.ty,
        )
    }

    fn projection(&self) -> Result<Projection, AnalysisError> {
        Projection::from_matrix([
            self.a as f32,
            -self.b as f32,
            self.tx as f32,
            self.b as f32,
            self.a as f32,
            self.ty as f32,
            0.0,
            0.0,
            1.0,
        ])
        .ok_or(AnalysisError::DegenerateTransform("non-invertible projection"))
    }
}

/// Right eye centre, left eye centre, nose tip, right and left mouth corners
pub fn anchor_points(landmarks: &LandmarkSet) -> [Point; 5] {
    let points = landmarks.points();
    [
        centroid(&points[RIGHT_EYE]),
        centroid(&points[LEFT_EYE]),
        points[NOSE_TIP],
        points[MOUTH_RIGHT_CORNER],
        points[MOUTH_LEFT_CORNER],
    ]
}

/// Canonical anchors scaled into a `target_size` crop with `padding` margin
pub fn target_anchors(target_size: u32, padding: f64) -> [Point; 5] {
    let size = target_size as f64;
    CANONICAL_ANCHORS.map(|(u, v)| {
        Point::new(
            (u + padding) / (1.0 + 2.0 * padding) * size,
            (v + padding) / (1.0 + 2.0 * padding) * size,
        )
    })
}

fn check_anchor_layout(anchors: &[Point; 5]) -> Result<(), AnalysisError> {
    if anchors.iter().any(|p| !p.is_finite()) {
        return Err(AnalysisError::DegenerateTransform("non-finite anchor"));
    }

    let mean = centroid(anchors);
    let n = anchors.len() as f64;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in anchors {
        let (dx, dy) = (p.x - mean.x, p.y - mean.y);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let (sxx, syy, sxy) = (sxx / n, syy / n, sxy / n);

    let trace = sxx + syy;
    if trace < MIN_ANCHOR_SPREAD {
        return Err(AnalysisError::DegenerateTransform("anchors collapsed to a point"));
    }

    let det = sxx * syy - sxy * sxy;
    let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
    let major = trace / 2.0 + disc;
    let minor = (trace / 2.0 - disc).max(0.0);
    if minor / major < MIN_EIGEN_RATIO {
        return Err(AnalysisError::DegenerateTransform("anchors are colinear"));
    }

    if distance(anchors[0], anchors[1]) < MIN_EYE_DISTANCE {
        return Err(AnalysisError::DegenerateTransform("eye centres coincide"));
    }
    Ok(())
}

/// Transform from image coordinates into the aligned crop
pub fn alignment_transform(
    landmarks: &LandmarkSet,
    target_size: u32,
    padding: f64,
) -> Result<SimilarityTransform, AnalysisError> {
    if target_size == 0 {
        return Err(AnalysisError::DegenerateTransform("zero target size"));
    }
    if !padding.is_finite() || padding < 0.0 {
        return Err(AnalysisError::DegenerateTransform("invalid padding"));
    }

    let anchors = anchor_points(landmarks);
    check_anchor_layout(&anchors)?;
    SimilarityTransform::estimate(&anchors, &target_anchors(target_size, padding))
}

/// Align and crop, reporting why a degenerate layout was rejected
pub fn try_align(
    image: &DynamicImage,
    landmarks: &LandmarkSet,
    target_size: u32,
    padding: f64,
) -> Result<DynamicImage, AnalysisError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(AnalysisError::UnsupportedImage("empty image".to_string()));
    }
    let transform = alignment_transform(landmarks, target_size, padding)?;
    debug!(
        "Alignment transform: scale {:.3}, rotation {:.2} deg",
        transform.scale(),
        transform.rotation_degrees()
    );
    let projection = transform.projection()?;

    let aligned = match image {
        DynamicImage::ImageLuma8(gray) => {
            let mut out = GrayImage::new(target_size, target_size);
            warp_into(gray, &projection, Interpolation::Bilinear, Luma([0]), &mut out);
            DynamicImage::ImageLuma8(out)
        }
        DynamicImage::ImageRgb8(rgb) => {
            DynamicImage::ImageRgb8(warp_rgb(rgb, &projection, target_size))
        }
        other => DynamicImage::ImageRgb8(warp_rgb(&other.to_rgb8(), &projection, target_size)),
    };
    Ok(aligned)
}

fn warp_rgb(rgb: &RgbImage, projection: &Projection, target_size: u32) -> RgbImage {
    let mut out = RgbImage::new(target_size, target_size);
    warp_into(rgb, projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    out
}

/// Aligned `target_size` square crop, or `None` when inputs are absent or degenerate
pub fn align(
    image: Option<&DynamicImage>,
    landmarks: Option<&LandmarkSet>,
    target_size: u32,
    padding: f64,
) -> Option<DynamicImage> {
    match try_align(image?, landmarks?, target_size, padding) {
        Ok(aligned) => Some(aligned),
        Err(e) => {
            debug!("Alignment failed: {}", e);
            None
        }
    }
}
