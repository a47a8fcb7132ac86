//! # Sphere Geometry
//!
//! Points on the unit 3-sphere S³ ⊂ R⁴ and the two derived positions the
//! substrate needs: the normalized weighted mean of children (centroid) and
//! the normalized midpoint of relation endpoints.
//!
//! Summation always runs in the caller's order so results are bit-identical
//! for identical inputs.

use crate::primitives::{DEGENERATE_NORM, UNIT_NORM_TOLERANCE};
use serde::{Deserialize, Serialize};

/// A point in R⁴. Stored points are always unit length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point4(pub [f64; 4]);

impl Point4 {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self([x, y, z, w])
    }

    #[must_use]
    pub fn dot(&self, other: &Point4) -> f64 {
        self.0[0] * other.0[0]
            + self.0[1] * other.0[1]
            + self.0[2] * other.0[2]
            + self.0[3] * other.0[3]
    }

    #[must_use]
    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Scale to unit length. `None` when the vector has no direction.
    #[must_use]
    pub fn normalized(&self) -> Option<Point4> {
        let norm = self.norm();
        if !norm.is_finite() || norm < DEGENERATE_NORM {
            return None;
        }
        Some(Point4([
            self.0[0] / norm,
            self.0[1] / norm,
            self.0[2] / norm,
            self.0[3] / norm,
        ]))
    }

    #[must_use]
    pub fn is_unit(&self) -> bool {
        (self.norm() - 1.0).abs() <= UNIT_NORM_TOLERANCE
    }

    /// Straight-line distance in R⁴.
    #[must_use]
    pub fn chord_distance(&self, other: &Point4) -> f64 {
        let mut sum = 0.0;
        for i in 0..4 {
            let d = self.0[i] - other.0[i];
            sum += d * d;
        }
        sum.sqrt()
    }

    /// Great-circle distance in radians, for unit points.
    #[must_use]
    pub fn geodesic_distance(&self, other: &Point4) -> f64 {
        self.dot(other).clamp(-1.0, 1.0).acos()
    }

    /// Bit pattern of the coordinates, used for hashing.
    #[must_use]
    pub fn to_bits(&self) -> [u64; 4] {
        [
            self.0[0].to_bits(),
            self.0[1].to_bits(),
            self.0[2].to_bits(),
            self.0[3].to_bits(),
        ]
    }
}

/// Normalized weighted mean of `(point, weight)` pairs.
///
/// Returns `None` for empty input or when the mean has no direction.
pub fn centroid<'a, I>(points: I) -> Option<Point4>
where
    I: IntoIterator<Item = (&'a Point4, u32)>,
{
    let mut acc = [0.0f64; 4];
    let mut total = 0u64;
    for (point, weight) in points {
        let w = f64::from(weight);
        for (slot, coord) in acc.iter_mut().zip(point.0.iter()) {
            *slot += coord * w;
        }
        total = total.saturating_add(u64::from(weight));
    }
    if total == 0 {
        return None;
    }
    Point4(acc).normalized()
}

/// Normalized midpoint of two unit points. `None` for antipodal pairs.
#[must_use]
pub fn midpoint(a: &Point4, b: &Point4) -> Option<Point4> {
    centroid([(a, 1), (b, 1)])
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_zero() {
        assert!(Point4::default().normalized().is_none());
        let p = Point4::new(3.0, 0.0, 4.0, 0.0).normalized().expect("unit");
        assert!(p.is_unit());
        assert!((p.0[0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn centroid_weights_repeats() {
        let a = Point4::new(1.0, 0.0, 0.0, 0.0);
        let b = Point4::new(0.0, 1.0, 0.0, 0.0);
        let even = centroid([(&a, 1), (&b, 1)]).expect("centroid");
        let skewed = centroid([(&a, 3), (&b, 1)]).expect("centroid");
        assert!((even.0[0] - even.0[1]).abs() < 1e-12);
        assert!(skewed.0[0] > skewed.0[1]);
        assert!(skewed.is_unit());
    }

    #[test]
    fn centroid_of_nothing_is_invalid() {
        let empty: [(&Point4, u32); 0] = [];
        assert!(centroid(empty).is_none());
    }

    #[test]
    fn antipodal_midpoint_is_invalid() {
        let a = Point4::new(0.0, 0.0, 1.0, 0.0);
        let b = Point4::new(0.0, 0.0, -1.0, 0.0);
        assert!(midpoint(&a, &b).is_none());
    }

    #[test]
    fn distances_agree_for_small_angles() {
        let a = Point4::new(1.0, 0.0, 0.0, 0.0);
        let b = Point4::new(1.0, 0.01, 0.0, 0.0).normalized().expect("unit");
        let chord = a.chord_distance(&b);
        let arc = a.geodesic_distance(&b);
        assert!((chord - arc).abs() < 1e-6);
    }
}
