//! Typed identifiers for trajectories, submaps, and nodes.

use serde::{Deserialize, Serialize};

/// Identifies one trajectory within the pose graph.
pub type TrajectoryId = u32;

/// Unique identifier for a submap: trajectory plus per-trajectory index.
///
/// Ordering is lexicographic (trajectory first), which gives `MapById`
/// its cross-trajectory iteration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmapId {
    pub trajectory_id: TrajectoryId,
    pub submap_index: u32,
}

impl SubmapId {
    #[inline]
    pub fn new(trajectory_id: TrajectoryId, submap_index: u32) -> Self {
        Self {
            trajectory_id,
            submap_index,
        }
    }
}

impl std::fmt::Display for SubmapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Submap({}, {})", self.trajectory_id, self.submap_index)
    }
}

/// Unique identifier for a trajectory node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub trajectory_id: TrajectoryId,
    pub node_index: u32,
}

impl NodeId {
    #[inline]
    pub fn new(trajectory_id: TrajectoryId, node_index: u32) -> Self {
        Self {
            trajectory_id,
            node_index,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}, {})", self.trajectory_id, self.node_index)
    }
}

/// Common shape of [`SubmapId`] and [`NodeId`], required by
/// [`MapById`](super::MapById) for per-trajectory bookkeeping.
pub trait GraphId: Copy + Ord + std::fmt::Display {
    fn trajectory_id(&self) -> TrajectoryId;
    fn index(&self) -> u32;
    fn with_index(trajectory_id: TrajectoryId, index: u32) -> Self;
}

impl GraphId for SubmapId {
    #[inline]
    fn trajectory_id(&self) -> TrajectoryId {
        self.trajectory_id
    }

    #[inline]
    fn index(&self) -> u32 {
        self.submap_index
    }

    #[inline]
    fn with_index(trajectory_id: TrajectoryId, index: u32) -> Self {
        SubmapId::new(trajectory_id, index)
    }
}

impl GraphId for NodeId {
    #[inline]
    fn trajectory_id(&self) -> TrajectoryId {
        self.trajectory_id
    }

    #[inline]
    fn index(&self) -> u32 {
        self.node_index
    }

    #[inline]
    fn with_index(trajectory_id: TrajectoryId, index: u32) -> Self {
        NodeId::new(trajectory_id, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering() {
        assert!(SubmapId::new(0, 5) < SubmapId::new(1, 0));
        assert!(SubmapId::new(1, 0) < SubmapId::new(1, 1));
        assert!(NodeId::new(2, 0) > NodeId::new(1, 100));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", SubmapId::new(0, 3)), "Submap(0, 3)");
        assert_eq!(format!("{}", NodeId::new(1, 7)), "Node(1, 7)");
    }
}
