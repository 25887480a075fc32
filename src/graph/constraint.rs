//! Constraints: weighted relative-pose edges between submaps and nodes.

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, Pose2D, SubmapId};

/// How a constraint was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintTag {
    /// Emitted when the node was inserted into the submap.
    IntraSubmap,
    /// Discovered by loop-closure search.
    InterSubmap,
}

/// The measured relative pose and its weights.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintPose {
    /// Pose of the node in the submap frame.
    pub relative_pose: Pose2D,
    pub translation_weight: f64,
    pub rotation_weight: f64,
}

/// A relative-pose edge between a submap and a node.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub submap_id: SubmapId,
    pub node_id: NodeId,
    pub pose: ConstraintPose,
    pub tag: ConstraintTag,
}

impl Constraint {
    pub fn intra(
        submap_id: SubmapId,
        node_id: NodeId,
        relative_pose: Pose2D,
        translation_weight: f64,
        rotation_weight: f64,
    ) -> Self {
        Self {
            submap_id,
            node_id,
            pose: ConstraintPose {
                relative_pose,
                translation_weight,
                rotation_weight,
            },
            tag: ConstraintTag::IntraSubmap,
        }
    }

    pub fn inter(
        submap_id: SubmapId,
        node_id: NodeId,
        relative_pose: Pose2D,
        translation_weight: f64,
        rotation_weight: f64,
    ) -> Self {
        Self {
            submap_id,
            node_id,
            pose: ConstraintPose {
                relative_pose,
                translation_weight,
                rotation_weight,
            },
            tag: ConstraintTag::InterSubmap,
        }
    }
}
