//! Detector and landmark predictor seams, plus best-face selection.
//!
//! Concrete models live outside this crate; anything that can report face
//! rectangles and 68 landmark points plugs in through these traits.

use anyhow::Result;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::landmarks::LandmarkSet;

/// Axis-aligned face candidate in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from exclusive `right`/`bottom` bounds, clamping anything left of or
    /// above the image origin
    pub fn from_bounds(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        let clamp = |v: i64| v.clamp(0, u32::MAX as i64) as u32;
        let (x, y) = (clamp(left), clamp(top));
        let (r, b) = (clamp(right), clamp(bottom));
        Self {
            x,
            y,
            width: r.saturating_sub(x),
            height: b.saturating_sub(y),
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Interrupts a blocked model call from another thread
pub type CancelHandle = Arc<dyn Fn() + Send + Sync>;

/// Finds candidate face rectangles in a grayscale image
pub trait FaceDetector: Send {
    fn detect(&mut self, gray: &GrayImage, upsample: u32) -> Result<Vec<Region>>;

    /// False once the backend can no longer answer and must be rebuilt
    fn is_usable(&self) -> bool {
        true
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        None
    }
}

/// Predicts the 68 landmark points inside a face region
///
/// `Ok(None)` means the model ran but produced no usable shape.
pub trait LandmarkPredictor: Send {
    fn predict(&mut self, gray: &GrayImage, region: &Region) -> Result<Option<LandmarkSet>>;

    /// False once the backend can no longer answer and must be rebuilt
    fn is_usable(&self) -> bool {
        true
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        None
    }
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, gray: &GrayImage, upsample: u32) -> Result<Vec<Region>> {
        (**self).detect(gray, upsample)
    }

    fn is_usable(&self) -> bool {
        (**self).is_usable()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        (**self).cancel_handle()
    }
}

impl<T: LandmarkPredictor + ?Sized> LandmarkPredictor for Box<T> {
    fn predict(&mut self, gray: &GrayImage, region: &Region) -> Result<Option<LandmarkSet>> {
        (**self).predict(gray, region)
    }

    fn is_usable(&self) -> bool {
        (**self).is_usable()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        (**self).cancel_handle()
    }
}

/// Pick the region with the largest area; the first one wins a tie
pub fn select_best_region(regions: &[Region]) -> Option<&Region> {
    regions
        .iter()
        .fold(None, |best: Option<&Region>, candidate| match best {
            Some(current) if current.area() >= candidate.area() => Some(current),
            _ => Some(candidate),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_largest_regardless_of_order() {
        let small = Region::new(0, 0, 10, 10);
        let large = Region::new(5, 5, 20, 20);
        let medium = Region::new(2, 2, 15, 15);

        let orders = [
            [small, large, medium],
            [large, small, medium],
            [medium, small, large],
            [medium, large, small],
        ];
        for regions in orders {
            let best = select_best_region(&regions).unwrap();
            assert_eq!(best.area(), 400);
            assert_eq!(*best, large);
        }
    }

    #[test]
    fn test_tie_keeps_first() {
        let a = Region::new(0, 0, 10, 20);
        let b = Region::new(50, 50, 20, 10);
        assert_eq!(select_best_region(&[a, b]), Some(&a));
        assert_eq!(select_best_region(&[b, a]), Some(&b));
        assert_eq!(select_best_region(&[]), None);
    }

    #[test]
    fn test_from_bounds_clamps_negative_origin() {
        let region = Region::from_bounds(-10, -5, 30, 40);
        assert_eq!(region, Region::new(0, 0, 30, 40));
        assert_eq!(region.area(), 1200);

        let inverted = Region::from_bounds(30, 30, 10, 10);
        assert_eq!(inverted.area(), 0);
    }
}
