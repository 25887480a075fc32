//! The pose-graph back-end: constraint search, optimization, trimming.

pub mod connectivity;
pub mod constraint;
pub mod constraint_builder;
pub mod optimization;
pub mod pose_graph;
pub mod trimmer;
pub mod work_queue;

pub use connectivity::TrajectoryConnectivityState;
pub use constraint::{Constraint, ConstraintPose, ConstraintTag};
pub use constraint_builder::ConstraintBuilder;
pub use optimization::{NodeSpec, OptimizationProblem, SubmapSpec};
pub use pose_graph::{
    DeletionState, GlobalSlamOptimizationCallback, InitialTrajectoryPose, NodeFromProto,
    PoseGraph, SubmapData, SubmapPose, TrajectoryNodePose, TrajectoryState,
};
pub use trimmer::{OverlappingSubmapsTrimmer, PoseGraphTrimmer, Trimmable};

use std::sync::Arc;

use crate::core::{Pose2D, Time, Timestamped};
use crate::sensor::{LandmarkObservation, PointCloud2D};

/// Immutable per-node data produced by the local trajectory builder.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub time: Time,
    /// Pose in the trajectory's local frame (not gravity-aligned).
    pub local_pose: Pose2D,
    /// Rotation that gravity-aligns the tracking frame.
    pub gravity_alignment: f64,
    /// Gravity-aligned point cloud used for loop-closure matching.
    pub point_cloud: PointCloud2D,
}

impl NodeData {
    /// The node's pose in its local frame, gravity-aligned: the frame
    /// the point cloud and all 2D constraints live in.
    pub fn gravity_aligned_local_pose(&self) -> Pose2D {
        self.local_pose
            .compose(&Pose2D::rotation(-self.gravity_alignment))
    }
}

impl Timestamped for NodeData {
    fn time(&self) -> Time {
        self.time
    }
}

/// A node in the trajectory: immutable data plus its optimized pose.
#[derive(Clone, Debug)]
pub struct TrajectoryNode {
    pub constant_data: Arc<NodeData>,
    pub global_pose: Pose2D,
}

impl Timestamped for TrajectoryNode {
    fn time(&self) -> Time {
        self.constant_data.time
    }
}

/// A landmark: its observations and, once optimized, its global pose.
#[derive(Clone, Debug, Default)]
pub struct LandmarkNode {
    pub observations: Vec<LandmarkObservation>,
    pub global_pose: Option<Pose2D>,
}
