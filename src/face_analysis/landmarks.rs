//! The 68-point facial landmark set and its anatomical index layout.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use super::geometry::Point;
use crate::error::AnalysisError;

pub const LANDMARK_COUNT: usize = 68;

pub const JAW: RangeInclusive<usize> = 0..=16;
pub const RIGHT_EYEBROW: RangeInclusive<usize> = 17..=21;
pub const LEFT_EYEBROW: RangeInclusive<usize> = 22..=26;
pub const NOSE_BRIDGE: RangeInclusive<usize> = 27..=30;
pub const LOWER_NOSE: RangeInclusive<usize> = 31..=35;
pub const RIGHT_EYE: RangeInclusive<usize> = 36..=41;
pub const LEFT_EYE: RangeInclusive<usize> = 42..=47;
pub const OUTER_LIP: RangeInclusive<usize> = 48..=59;
pub const INNER_LIP: RangeInclusive<usize> = 60..=67;

pub const CHIN: usize = 8;
pub const NOSE_TOP: usize = 27;
pub const NOSE_TIP: usize = 30;
pub const SUBNASALE: usize = 33;
pub const MOUTH_RIGHT_CORNER: usize = 48;
pub const MOUTH_LEFT_CORNER: usize = 54;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandmarkPoint {
    pub x: i32,
    pub y: i32,
}

impl LandmarkPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<LandmarkPoint> for Point {
    fn from(p: LandmarkPoint) -> Self {
        Point::new(p.x as f64, p.y as f64)
    }
}

/// Exactly 68 landmark points; any other count is rejected at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LandmarkSet {
    points: Vec<LandmarkPoint>,
}

impl LandmarkSet {
    pub fn new(points: Vec<LandmarkPoint>) -> Result<Self, AnalysisError> {
        if points.len() != LANDMARK_COUNT {
            return Err(AnalysisError::LandmarkCount {
                expected: LANDMARK_COUNT,
                actual: points.len(),
            });
        }
        Ok(Self { points })
    }

    /// Build from model output coordinates, rounding to the nearest pixel
    pub fn from_float_points(points: &[(f64, f64)]) -> Result<Self, AnalysisError> {
        if let Some((x, y)) = points.iter().find(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(AnalysisError::SidecarProtocol(format!(
                "non-finite landmark coordinate ({x}, {y})"
            )));
        }
        Self::new(
            points
                .iter()
                .map(|&(x, y)| LandmarkPoint::new(x.round() as i32, y.round() as i32))
                .collect(),
        )
    }

    pub fn get(&self, index: usize) -> Option<LandmarkPoint> {
        self.points.get(index).copied()
    }

    pub fn as_slice(&self) -> &[LandmarkPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Coordinates as floating-point points for geometric computation
    pub fn points(&self) -> Vec<Point> {
        self.points.iter().copied().map(Point::from).collect()
    }

    /// Points of one anatomical group, e.g. [`RIGHT_EYE`]
    pub fn group(&self, range: RangeInclusive<usize>) -> Vec<Point> {
        self.points[range].iter().copied().map(Point::from).collect()
    }
}

impl<'de> Deserialize<'de> for LandmarkSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let points = Vec::<LandmarkPoint>::deserialize(deserializer)?;
        LandmarkSet::new(points).map_err(serde::de::Error::custom)
    }
}
