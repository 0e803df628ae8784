//! Shared fixtures: a synthetic, left-right symmetric frontal face on a 300x300 canvas.

use anyhow::Result;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};

use super::detection::{FaceDetector, LandmarkPredictor, Region};
use super::landmarks::{LandmarkPoint, LandmarkSet};

pub const CANVAS: u32 = 300;

const FRONTAL: [(i32, i32); 68] = [
    // jaw 0-16
    (60, 120), (62, 140), (67, 160), (75, 178), (86, 194), (100, 208), (115, 219), (132, 227),
    (150, 230),
    (168, 227), (185, 219), (200, 208), (214, 194), (225, 178), (233, 160), (238, 140), (240, 120),
    // right eyebrow 17-21
    (80, 92), (92, 86), (104, 84), (116, 86), (128, 92),
    // left eyebrow 22-26
    (172, 92), (184, 86), (196, 84), (208, 86), (220, 92),
    // nose bridge 27-30
    (150, 105), (150, 120), (150, 135), (150, 150),
    // lower nose 31-35
    (135, 160), (142, 163), (150, 165), (158, 163), (165, 160),
    // right eye 36-41
    (85, 110), (95, 104), (107, 104), (117, 110), (107, 115), (95, 115),
    // left eye 42-47
    (183, 110), (193, 104), (205, 104), (215, 110), (205, 115), (193, 115),
    // outer lip 48-59
    (120, 190), (130, 184), (140, 181), (150, 182), (160, 181), (170, 184), (180, 190),
    (170, 198), (160, 202), (150, 203), (140, 202), (130, 198),
    // inner lip 60-67
    (126, 190), (140, 187), (150, 188), (160, 187), (174, 190), (160, 194), (150, 195), (140, 194),
];

pub fn frontal_landmarks() -> LandmarkSet {
    LandmarkSet::new(FRONTAL.iter().map(|&(x, y)| LandmarkPoint::new(x, y)).collect())
        .expect("fixture has 68 points")
}

/// Skin-toned canvas with darker eyes and mouth so enhancement has something to work on
pub fn frontal_image() -> DynamicImage {
    let img = RgbImage::from_fn(CANVAS, CANVAS, |x, y| {
        let (x, y) = (x as i32, y as i32);
        let in_eye = (104..=115).contains(&y)
            && ((85..=117).contains(&x) || (183..=215).contains(&x));
        let in_mouth = (120..=180).contains(&x) && (181..=203).contains(&y);
        if in_eye {
            Rgb([40, 30, 30])
        } else if in_mouth {
            Rgb([150, 60, 70])
        } else if (60..=240).contains(&x) && (80..=230).contains(&y) {
            Rgb([210, 170, 140])
        } else {
            Rgb([30, 60, 90])
        }
    });
    DynamicImage::ImageRgb8(img)
}

/// Detector returning a fixed list of regions
pub struct FixedDetector(pub Vec<Region>);

impl FaceDetector for FixedDetector {
    fn detect(&mut self, _gray: &GrayImage, _upsample: u32) -> Result<Vec<Region>> {
        Ok(self.0.clone())
    }
}

/// Predictor returning a fixed landmark set, or none
pub struct FixedPredictor(pub Option<LandmarkSet>);

impl LandmarkPredictor for FixedPredictor {
    fn predict(&mut self, _gray: &GrayImage, _region: &Region) -> Result<Option<LandmarkSet>> {
        Ok(self.0.clone())
    }
}

pub fn face_region() -> Region {
    Region::new(55, 75, 190, 160)
}
