//! Scalar 2D geometry over landmark coordinates.
//!
//! Every helper returns `f64::NAN` instead of failing when its inputs are
//! degenerate, so that undefined values propagate through later arithmetic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Euclidean distance between two points, NaN if either point is malformed
pub fn distance(a: Point, b: Point) -> f64 {
    if !a.is_finite() || !b.is_finite() {
        return f64::NAN;
    }
    (a.x - b.x).hypot(a.y - b.y)
}

/// Distance used as a scale: a collapsed (non-positive) span is undefined
pub fn span(a: Point, b: Point) -> f64 {
    let d = distance(a, b);
    if d > 0.0 {
        d
    } else {
        f64::NAN
    }
}

/// Quotient that is only defined for a strictly positive denominator
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if numerator.is_finite() && denominator.is_finite() && denominator > 0.0 {
        numerator / denominator
    } else {
        f64::NAN
    }
}

/// Arithmetic mean; NaN for an empty slice or any NaN member
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn centroid(points: &[Point]) -> Point {
    if points.is_empty() {
        return Point::new(f64::NAN, f64::NAN);
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point::new(sx / n, sy / n)
}

/// Sum of segment lengths along an open path
pub fn polyline_length(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return f64::NAN;
    }
    points.windows(2).map(|w| distance(w[0], w[1])).sum()
}

/// Shoelace area of the closed polygon through `points`
pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 || points.iter().any(|p| !p.is_finite()) {
        return f64::NAN;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();
    twice.abs() / 2.0
}

/// Distance from `p` to the infinite line through `a` and `b`
pub fn perpendicular_distance(p: Point, a: Point, b: Point) -> f64 {
    let length = span(a, b);
    if !length.is_finite() || !p.is_finite() {
        return f64::NAN;
    }
    ((b.x - a.x) * (a.y - p.y) - (a.x - p.x) * (b.y - a.y)).abs() / length
}

/// Angle in degrees between two direction vectors
pub fn angle_between(v1: (f64, f64), v2: (f64, f64)) -> f64 {
    let n1 = v1.0.hypot(v1.1);
    let n2 = v2.0.hypot(v2.1);
    if !(n1 > 0.0 && n2 > 0.0) {
        return f64::NAN;
    }
    let cos = ((v1.0 * v2.0 + v1.1 * v2.1) / (n1 * n2)).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Interior angle in degrees at `vertex` formed by rays towards `a` and `b`
pub fn angle_at(vertex: Point, a: Point, b: Point) -> f64 {
    angle_between((a.x - vertex.x, a.y - vertex.y), (b.x - vertex.x, b.y - vertex.y))
}
