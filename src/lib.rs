//! SetuSLAM - Global pose-graph back-end for 2D lidar SLAM
//!
//! # Architecture
//!
//! Front-ends produce short, locally consistent submaps together with
//! scan-matched node poses; this crate fuses them into one globally
//! optimized map by continuously discovering loop-closure constraints
//! and re-solving the pose graph.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    graph/                           │  ← Back-end
//! │   (pose graph, constraint builder, optimization,    │
//! │    connectivity, trimmers, work queue)              │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              submap/   matching/                    │  ← Map fragments
//! │     (shared submaps, correlative loop matcher)      │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                grid/   sensor/                      │  ← Data
//! │     (probability grids, range/IMU/odometry data)    │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              core/   utils/   config   io/          │  ← Foundation
//! │   (poses, ids, MapById, pool, sampler, serde)       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Data flow
//!
//! `PoseGraph::add_node` registers a node (and any new submap) and
//! enqueues a constraint search. The [`graph::ConstraintBuilder`] fans
//! scan matches out to a worker pool; when a node's batch settles, a
//! barrier fires, new constraints are folded in, and an optimization
//! pass updates every global pose. Trajectories can be finished,
//! frozen, or deleted; overlapping submaps can be trimmed to bound
//! memory.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use setu_slam::config::{PoseGraphConfig, SubmapConfig};
//! use setu_slam::graph::PoseGraph;
//! use setu_slam::submap::ActiveSubmaps2D;
//! use setu_slam::utils::ThreadPool;
//!
//! let pool = Arc::new(ThreadPool::new(4));
//! let graph = PoseGraph::new(PoseGraphConfig::default(), pool);
//! let mut submaps = ActiveSubmaps2D::new(SubmapConfig::default());
//! // For every scan the front-end matches:
//! //   let insertion = submaps.submaps();
//! //   submaps.insert_range_data(&range_data);
//! //   graph.add_node(node_data, trajectory_id, &insertion);
//! let _ = submaps.submaps();
//! graph.run_final_optimization();
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod graph;
pub mod grid;
pub mod io;
pub mod matching;
pub mod sensor;
pub mod submap;
pub mod utils;

pub use config::{
    ConstraintBuilderConfig, OptimizationConfig, OverlappingTrimmerConfig, PoseGraphConfig,
    SubmapConfig,
};
pub use crate::core::{NodeId, Point2D, Pose2D, SubmapId, Time, TrajectoryId};
pub use error::{Error, Result};
pub use graph::{
    Constraint, ConstraintTag, OverlappingSubmapsTrimmer, PoseGraph, TrajectoryState,
};
pub use submap::{ActiveSubmaps2D, Submap2D};
pub use utils::ThreadPool;
