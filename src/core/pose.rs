//! 2D rigid transforms and points.

use serde::{Deserialize, Serialize};

use super::math::{angle_diff, normalize_angle};
use super::time::Time;

/// A point in the plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[inline]
    pub fn distance(&self, other: &Point2D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A 2D rigid transform: translation plus heading.
///
/// Composition follows the usual convention: `a.compose(&b)` applies `b`
/// first in `a`'s frame, i.e. the matrix product `A * B`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2D {
    #[inline]
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    /// The identity transform.
    #[inline]
    pub fn identity() -> Self {
        Self::default()
    }

    /// A pure translation.
    #[inline]
    pub fn translation(x: f64, y: f64) -> Self {
        Self { x, y, theta: 0.0 }
    }

    /// A pure rotation about the origin.
    #[inline]
    pub fn rotation(theta: f64) -> Self {
        Self { x: 0.0, y: 0.0, theta }
    }

    /// Translation component as a point.
    #[inline]
    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Compose with another transform: `self * other`.
    pub fn compose(&self, other: &Pose2D) -> Pose2D {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2D {
            x: self.x + other.x * cos_t - other.y * sin_t,
            y: self.y + other.x * sin_t + other.y * cos_t,
            theta: normalize_angle(self.theta + other.theta),
        }
    }

    /// Inverse transform: `self.inverse().compose(self) == identity`.
    pub fn inverse(&self) -> Pose2D {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2D {
            x: -self.x * cos_t - self.y * sin_t,
            y: self.x * sin_t - self.y * cos_t,
            theta: normalize_angle(-self.theta),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, point: Point2D) -> Point2D {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Point2D {
            x: self.x + point.x * cos_t - point.y * sin_t,
            y: self.y + point.x * sin_t + point.y * cos_t,
        }
    }

    /// Euclidean distance between the translation components.
    #[inline]
    pub fn distance(&self, other: &Pose2D) -> f64 {
        self.position().distance(&other.position())
    }
}

impl std::fmt::Display for Pose2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3}rad)", self.x, self.y, self.theta)
    }
}

/// A transform with the time at which it was observed.
#[derive(Clone, Copy, Debug)]
pub struct TimestampedPose {
    pub time: Time,
    pub pose: Pose2D,
}

/// Linear interpolation between two timestamped poses.
///
/// `time` must lie within `[start.time, end.time]`. Headings interpolate
/// along the shorter arc.
pub fn interpolate(start: &TimestampedPose, end: &TimestampedPose, time: Time) -> Pose2D {
    debug_assert!(start.time <= time && time <= end.time);
    if start.time == end.time {
        return start.pose;
    }
    let factor =
        (time.micros() - start.time.micros()) as f64 / (end.time.micros() - start.time.micros()) as f64;
    Pose2D {
        x: start.pose.x + factor * (end.pose.x - start.pose.x),
        y: start.pose.y + factor * (end.pose.y - start.pose.y),
        theta: normalize_angle(
            start.pose.theta + factor * angle_diff(start.pose.theta, end.pose.theta),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_compose_identity() {
        let pose = Pose2D::new(1.0, 2.0, 0.5);
        let composed = pose.compose(&Pose2D::identity());
        assert_relative_eq!(composed.x, pose.x);
        assert_relative_eq!(composed.y, pose.y);
        assert_relative_eq!(composed.theta, pose.theta);
    }

    #[test]
    fn test_compose_rotated() {
        // Facing +Y, step 1m forward lands at (0, 1).
        let pose = Pose2D::new(0.0, 0.0, FRAC_PI_2);
        let step = Pose2D::new(1.0, 0.0, 0.0);
        let result = pose.compose(&step);
        assert_relative_eq!(result.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = Pose2D::new(1.5, -2.3, 0.7);
        let round = pose.inverse().compose(&pose);
        assert_relative_eq!(round.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(round.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(round.theta, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_point() {
        let pose = Pose2D::new(1.0, 0.0, FRAC_PI_2);
        let p = pose.transform_point(Point2D::new(1.0, 0.0));
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolate_midpoint() {
        let a = TimestampedPose {
            time: Time(0),
            pose: Pose2D::new(0.0, 0.0, 0.0),
        };
        let b = TimestampedPose {
            time: Time(1_000_000),
            pose: Pose2D::new(2.0, 4.0, 1.0),
        };
        let mid = interpolate(&a, &b, Time(500_000));
        assert_relative_eq!(mid.x, 1.0);
        assert_relative_eq!(mid.y, 2.0);
        assert_relative_eq!(mid.theta, 0.5);
    }
}
