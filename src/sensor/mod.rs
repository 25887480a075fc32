//! Sensor data carried into the back-end.
//!
//! The local trajectory builder consumes raw sensor streams; only the
//! distilled forms below reach the pose graph, either attached to nodes
//! (point clouds) or forwarded to the optimization problem (IMU and
//! odometry) or stored as landmark observations.

use serde::{Deserialize, Serialize};

use crate::core::{Point2D, Pose2D, Time, TrajectoryId};

/// A gravity-aligned 2D point cloud in the tracking frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud2D {
    pub points: Vec<Point2D>,
}

impl PointCloud2D {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: Vec<Point2D>) -> Self {
        Self { points }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Transform every point by `pose`.
    pub fn transform(&self, pose: &Pose2D) -> PointCloud2D {
        PointCloud2D {
            points: self
                .points
                .iter()
                .map(|&p| pose.transform_point(p))
                .collect(),
        }
    }
}

/// One lidar revolution: the sensed returns plus the sensor origin, both
/// in the frame the submap is built in.
#[derive(Clone, Debug, Default)]
pub struct RangeData {
    pub origin: Point2D,
    pub returns: PointCloud2D,
    /// Ray endpoints that did not hit anything within sensor range.
    pub misses: PointCloud2D,
}

/// An IMU sample forwarded to the optimization problem.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ImuData {
    pub time: Time,
    /// Linear acceleration (x, y) in the tracking frame, m/s².
    pub linear_acceleration: Point2D,
    /// Angular velocity about z, rad/s.
    pub angular_velocity: f64,
}

/// An odometry sample forwarded to the optimization problem.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OdometryData {
    pub time: Time,
    pub pose: Pose2D,
}

/// One observation of a landmark from the tracking frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LandmarkObservation {
    pub trajectory_id: TrajectoryId,
    pub time: Time,
    pub landmark_to_tracking: Pose2D,
    pub translation_weight: f64,
    pub rotation_weight: f64,
}

/// A batch of landmark observations at a common time, keyed by landmark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LandmarkData {
    pub time: Time,
    pub observations: Vec<(String, Pose2D, f64, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cloud_transform() {
        let cloud = PointCloud2D::from_points(vec![Point2D::new(1.0, 0.0)]);
        let moved = cloud.transform(&Pose2D::new(1.0, 2.0, 0.0));
        assert_relative_eq!(moved.points[0].x, 2.0);
        assert_relative_eq!(moved.points[0].y, 2.0);
    }
}
