//! Foundation types: poses, time, typed ids, and the per-trajectory
//! ordered store.

pub mod id;
pub mod map_by_id;
pub mod math;
pub mod pose;
pub mod time;

pub use id::{GraphId, NodeId, SubmapId, TrajectoryId};
pub use map_by_id::MapById;
pub use pose::{interpolate, Point2D, Pose2D, TimestampedPose};
pub use time::{Time, Timestamped};
