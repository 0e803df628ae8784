//! Landmark-derived geometric descriptors.
//!
//! [`compute_features`] turns one 68-point set into a [`FeatureMap`] holding a
//! value for every [`Feature`]. Values that cannot be computed (collapsed
//! spans, non-positive denominators) are `NaN`, which serializes as `null`.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::str::FromStr;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumCount as EnumCountMacro, EnumIter, EnumString, IntoStaticStr};

use super::geometry::{
    angle_at, angle_between, centroid, distance, mean, perpendicular_distance, polygon_area,
    polyline_length, ratio, span, Point,
};
use super::landmarks::{LandmarkSet, LANDMARK_COUNT};

/// Closed set of feature names, declared in canonical column order
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumCountMacro,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    AngerLipCornerPullDownAvgY,
    AvgEar,
    BrowLowerIntensityYDiff,
    BrowLowerInterEyebrowAngle,
    ChinAngle,
    EyeAreaLeft,
    EyeAreaRatioLeftRight,
    EyeAreaRight,
    EyeAspectRatioLeft,
    EyeAspectRatioRight,
    EyeVerticalHeightLeft,
    EyeVerticalHeightRight,
    EyeWidthLeft,
    EyeWidthRight,
    EyebrowArchHeightLeft,
    EyebrowArchHeightRight,
    EyebrowLengthLeft,
    EyebrowLengthRight,
    FaceHeightNoseBridgeToChin,
    FaceThirdsRatioMiddleLower,
    FaceThirdsRatioUpperMiddle,
    FaceWidthMaxJaw,
    FaceWidthToHeightRatio,
    #[strum(serialize = "five_eyes_metric_1")]
    FiveEyesMetric1,
    ForeheadProxyHeight,
    InterOcularDistanceInner,
    InterOcularDistanceOuter,
    IntercanthalDistToFaceWidthRatio,
    JawPolygonArea,
    JawlineLength,
    LowerLipThicknessCenter,
    LowerThirdHeightSubnasaleToChin,
    MiddleThirdHeightGlabellaToSubnasale,
    MouthAspectRatioInner,
    MouthAspectRatioOuter,
    MouthHeightInnerLipsCenter,
    MouthHeightOuterLipsCenter,
    MouthWidthCorners,
    MouthWidthToFaceWidthRatio,
    NoseLength,
    NoseLengthToFaceHeightRatio,
    NoseLengthToWidthRatio,
    NoseWidthNostrils,
    NoseWidthToFaceWidthRatio,
    PhiltrumLength,
    PupilDistanceApprox,
    SmileCheekRaiseProxyLeftYDist,
    SmileCheekRaiseProxyRightYDist,
    SmileLipCornerPullUpAvgY,
    SmileMouthWidthCornersDist,
    SymmetryEyeCornersAvgHorizontalDiff,
    SymmetryJawPointsAvgDiff,
    TensionEyebrowGapHorizontalDist,
    TensionEyelidOpeningLeftVertDist,
    TensionEyelidOpeningRightVertDist,
    TensionInnerEyebrowHeightAvgY,
    TensionJawClenchMetric,
    TensionLipPressRatio,
    TensionNoseWingWidth,
    TensionUpperEyelidAvgDistToBrow,
    UpperLipThicknessCenter,
}

impl Feature {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// All feature names in canonical order
    pub fn names() -> impl Iterator<Item = &'static str> {
        Feature::iter().map(Feature::name)
    }
}

/// One value per [`Feature`]; `NaN` marks an undefined value
#[derive(Debug, Clone)]
pub struct FeatureMap {
    values: [f64; Feature::COUNT],
}

impl Default for FeatureMap {
    fn default() -> Self {
        Self::undefined()
    }
}

impl FeatureMap {
    /// Every feature present and undefined
    pub fn undefined() -> Self {
        Self {
            values: [f64::NAN; Feature::COUNT],
        }
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature as usize]
    }

    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        Feature::from_str(name).ok().map(|f| self.get(f))
    }

    /// Defined value or `None`
    pub fn value(&self, feature: Feature) -> Option<f64> {
        let v = self.get(feature);
        v.is_finite().then_some(v)
    }

    fn set(&mut self, feature: Feature, value: f64) {
        self.values[feature as usize] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        Feature::iter().map(move |f| (f, self.get(f)))
    }

    pub fn len(&self) -> usize {
        Feature::COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn defined_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    pub fn is_all_undefined(&self) -> bool {
        self.defined_count() == 0
    }

    /// Normalize infinities and NaN payloads to the plain undefined marker
    fn sanitize(&mut self) {
        for v in self.values.iter_mut() {
            if !v.is_finite() {
                *v = f64::NAN;
            }
        }
    }
}

impl Serialize for FeatureMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Feature::COUNT))?;
        for (feature, value) in self.iter() {
            map.serialize_entry(feature.name(), &value.is_finite().then_some(value))?;
        }
        map.end()
    }
}

/// Features for an optional landmark set; absent input gives an all-undefined map
pub fn compute_landmark_features(landmarks: Option<&LandmarkSet>) -> FeatureMap {
    match landmarks {
        Some(set) => compute_features(&set.points()),
        None => FeatureMap::undefined(),
    }
}

/// Compute every feature from exactly 68 points
///
/// Any other point count yields an all-undefined map; no partial computation.
pub fn compute_features(points: &[Point]) -> FeatureMap {
    let mut map = FeatureMap::undefined();
    if points.len() != LANDMARK_COUNT {
        return map;
    }

    let p = |i: usize| points[i];
    let x = |i: usize| points[i].x;
    let y = |i: usize| points[i].y;
    let d = |a: usize, b: usize| distance(points[a], points[b]);

    // Structural scales
    let face_width = span(p(0), p(16));
    let face_height = positive((y(27) - y(8)).abs());
    let eye_width_right = span(p(36), p(39));
    let eye_width_left = span(p(42), p(45));
    let mouth_width = span(p(48), p(54));
    let nose_length = span(p(27), p(30));
    let nose_width = span(p(31), p(35));

    // Eyes
    let right_vertical = d(37, 41) + d(38, 40);
    let left_vertical = d(43, 47) + d(44, 46);
    let ear_right = ratio(right_vertical, 2.0 * eye_width_right);
    let ear_left = ratio(left_vertical, 2.0 * eye_width_left);
    let right_eye = &points[36..=41];
    let left_eye = &points[42..=47];
    let eye_area_right = polygon_area(right_eye);
    let eye_area_left = polygon_area(left_eye);
    let iod_inner = d(39, 42);

    map.set(Feature::EyeWidthRight, eye_width_right);
    map.set(Feature::EyeWidthLeft, eye_width_left);
    map.set(Feature::EyeVerticalHeightRight, right_vertical / 2.0);
    map.set(Feature::EyeVerticalHeightLeft, left_vertical / 2.0);
    map.set(Feature::EyeAspectRatioRight, ear_right);
    map.set(Feature::EyeAspectRatioLeft, ear_left);
    map.set(Feature::AvgEar, mean(&[ear_right, ear_left]));
    map.set(
        Feature::PupilDistanceApprox,
        distance(centroid(right_eye), centroid(left_eye)),
    );
    map.set(Feature::InterOcularDistanceInner, iod_inner);
    map.set(Feature::InterOcularDistanceOuter, d(36, 45));
    map.set(Feature::EyeAreaRight, eye_area_right);
    map.set(Feature::EyeAreaLeft, eye_area_left);
    map.set(Feature::EyeAreaRatioLeftRight, ratio(eye_area_left, eye_area_right));

    // Face frame
    map.set(Feature::FaceWidthMaxJaw, face_width);
    map.set(Feature::FaceHeightNoseBridgeToChin, face_height);
    map.set(Feature::FaceWidthToHeightRatio, ratio(face_width, face_height));
    map.set(Feature::IntercanthalDistToFaceWidthRatio, ratio(iod_inner, face_width));
    map.set(
        Feature::FiveEyesMetric1,
        ratio(face_width, mean(&[eye_width_right, eye_width_left])),
    );

    // Nose
    map.set(Feature::NoseLength, nose_length);
    map.set(Feature::NoseWidthNostrils, nose_width);
    map.set(Feature::NoseLengthToWidthRatio, ratio(nose_length, nose_width));
    map.set(Feature::NoseLengthToFaceHeightRatio, ratio(nose_length, face_height));
    map.set(Feature::NoseWidthToFaceWidthRatio, ratio(nose_width, face_width));
    map.set(Feature::TensionNoseWingWidth, d(31, 35));

    // Mouth
    let outer_height = d(51, 57);
    let inner_height = d(62, 66);
    map.set(Feature::MouthWidthCorners, mouth_width);
    map.set(Feature::SmileMouthWidthCornersDist, mouth_width);
    map.set(Feature::MouthHeightOuterLipsCenter, outer_height);
    map.set(Feature::MouthHeightInnerLipsCenter, inner_height);
    map.set(Feature::MouthAspectRatioOuter, ratio(outer_height, mouth_width));
    map.set(
        Feature::MouthAspectRatioInner,
        ratio(inner_height, span(p(60), p(64))),
    );
    map.set(Feature::MouthWidthToFaceWidthRatio, ratio(mouth_width, face_width));
    map.set(Feature::UpperLipThicknessCenter, d(51, 62));
    map.set(Feature::LowerLipThicknessCenter, d(66, 57));
    map.set(Feature::PhiltrumLength, d(33, 51));
    map.set(Feature::TensionLipPressRatio, ratio(inner_height, outer_height));

    // Jaw
    let jaw = &points[0..=16];
    map.set(Feature::JawlineLength, polyline_length(jaw));
    map.set(Feature::JawPolygonArea, polygon_area(jaw));
    map.set(Feature::ChinAngle, angle_at(p(8), p(6), p(10)));
    map.set(Feature::TensionJawClenchMetric, ratio(d(3, 13), face_width));

    // Symmetry about the nose-bridge to chin midline
    let jaw_diffs: Vec<f64> = (0..8)
        .map(|i| {
            let right = perpendicular_distance(p(i), p(27), p(8));
            let left = perpendicular_distance(p(16 - i), p(27), p(8));
            (right - left).abs()
        })
        .collect();
    map.set(Feature::SymmetryJawPointsAvgDiff, mean(&jaw_diffs));
    map.set(
        Feature::SymmetryEyeCornersAvgHorizontalDiff,
        mean(&[
            ((x(27) - x(36)) - (x(45) - x(27))).abs(),
            ((x(27) - x(39)) - (x(42) - x(27))).abs(),
        ]),
    );

    // Eyebrows
    map.set(Feature::EyebrowLengthRight, polyline_length(&points[17..=21]));
    map.set(Feature::EyebrowLengthLeft, polyline_length(&points[22..=26]));
    map.set(
        Feature::EyebrowArchHeightRight,
        max_defined([18, 19, 20].map(|i| perpendicular_distance(p(i), p(17), p(21)))),
    );
    map.set(
        Feature::EyebrowArchHeightLeft,
        max_defined([23, 24, 25].map(|i| perpendicular_distance(p(i), p(22), p(26)))),
    );

    // Vertical thirds
    let upper_third = (mean(&[y(19), y(24)]) - y(27)).abs();
    let middle_third = (mean(&[y(21), y(22)]) - y(33)).abs();
    let lower_third = (y(33) - y(8)).abs();
    map.set(Feature::ForeheadProxyHeight, upper_third);
    map.set(Feature::MiddleThirdHeightGlabellaToSubnasale, middle_third);
    map.set(Feature::LowerThirdHeightSubnasaleToChin, lower_third);
    map.set(Feature::FaceThirdsRatioUpperMiddle, ratio(upper_third, middle_third));
    map.set(Feature::FaceThirdsRatioMiddleLower, ratio(middle_third, lower_third));

    // Expression cues; image y grows downwards
    let inner_brow_gap = mean(&[y(39) - y(21), y(42) - y(22)]);
    let outer_brow_gap = mean(&[y(36) - y(17), y(45) - y(26)]);
    map.set(Feature::TensionInnerEyebrowHeightAvgY, inner_brow_gap);
    map.set(Feature::BrowLowerIntensityYDiff, inner_brow_gap - outer_brow_gap);
    map.set(Feature::TensionEyebrowGapHorizontalDist, (x(21) - x(22)).abs());
    map.set(
        Feature::BrowLowerInterEyebrowAngle,
        angle_between((x(21) - x(19), y(21) - y(19)), (x(22) - x(24), y(22) - y(24))),
    );
    map.set(
        Feature::TensionUpperEyelidAvgDistToBrow,
        mean(&[d(19, 37), d(20, 38), d(23, 43), d(24, 44)]),
    );
    map.set(
        Feature::TensionEyelidOpeningRightVertDist,
        mean(&[(y(37) - y(41)).abs(), (y(38) - y(40)).abs()]),
    );
    map.set(
        Feature::TensionEyelidOpeningLeftVertDist,
        mean(&[(y(43) - y(47)).abs(), (y(44) - y(46)).abs()]),
    );

    let mouth_center_y = mean(&[y(51), y(57)]);
    let corners_y = mean(&[y(48), y(54)]);
    map.set(Feature::AngerLipCornerPullDownAvgY, corners_y - mouth_center_y);
    map.set(Feature::SmileLipCornerPullUpAvgY, mouth_center_y - corners_y);
    map.set(
        Feature::SmileCheekRaiseProxyRightYDist,
        y(48) - mean(&[y(40), y(41)]),
    );
    map.set(
        Feature::SmileCheekRaiseProxyLeftYDist,
        y(54) - mean(&[y(46), y(47)]),
    );

    map.sanitize();
    map
}

fn positive(v: f64) -> f64 {
    if v > 0.0 {
        v
    } else {
        f64::NAN
    }
}

fn max_defined<const N: usize>(values: [f64; N]) -> f64 {
    if values.iter().any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    values.into_iter().fold(f64::NEG_INFINITY, f64::max)
}
