//! Serde shapes consumed and produced by the deserialization path.
//!
//! These are snapshot structures, not a stable wire format: the
//! persistence format may change between versions. Conversions are
//! lossless for the fields the back-end relies on: grid cells
//! round-trip bit-equal, poses to full double precision.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, Point2D, Pose2D, SubmapId, Time};
use crate::error::{Error, Result};
use crate::graph::pose_graph::NodeFromProto;
use crate::graph::{Constraint, ConstraintPose, ConstraintTag, NodeData};
use crate::grid::{CellLimits, MapLimits, ProbabilityGrid};
use crate::sensor::PointCloud2D;
use crate::submap::Submap2D;

/// Serialized probability grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedGrid {
    pub resolution: f64,
    pub max: Point2D,
    pub num_x_cells: i32,
    pub num_y_cells: i32,
    /// Log-odds per cell, row-major; meaningful where `known` is set.
    pub cells: Vec<i16>,
    pub known: Vec<bool>,
}

impl SerializedGrid {
    pub fn from_grid(grid: &ProbabilityGrid) -> Self {
        let limits = grid.limits();
        let (cells, known) = grid.raw_cells();
        Self {
            resolution: limits.resolution(),
            max: limits.max(),
            num_x_cells: limits.cell_limits().num_x_cells,
            num_y_cells: limits.cell_limits().num_y_cells,
            cells: cells.to_vec(),
            known: known.to_vec(),
        }
    }

    pub fn to_grid(&self) -> Result<ProbabilityGrid> {
        let size = (self.num_x_cells as usize) * (self.num_y_cells as usize);
        if self.cells.len() != size || self.known.len() != size {
            return Err(Error::Serialization(format!(
                "grid cell count {} does not match {}x{} limits",
                self.cells.len(),
                self.num_x_cells,
                self.num_y_cells
            )));
        }
        if self.resolution <= 0.0 {
            return Err(Error::Serialization(format!(
                "non-positive grid resolution {}",
                self.resolution
            )));
        }
        Ok(ProbabilityGrid::from_raw_cells(
            MapLimits::new(
                self.resolution,
                self.max,
                CellLimits::new(self.num_x_cells, self.num_y_cells),
            ),
            self.cells.clone(),
            self.known.clone(),
        ))
    }
}

/// Serialized submap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedSubmap {
    pub submap_id: SubmapId,
    pub local_pose: Pose2D,
    pub num_range_data: usize,
    pub finished: bool,
    pub grid: Option<SerializedGrid>,
}

impl SerializedSubmap {
    pub fn from_submap(submap_id: SubmapId, submap: &Submap2D) -> Self {
        Self {
            submap_id,
            local_pose: submap.local_pose(),
            num_range_data: submap.num_range_data(),
            finished: submap.finished(),
            grid: Some(SerializedGrid::from_grid(&submap.grid())),
        }
    }

    pub fn to_submap(&self) -> Result<Arc<Submap2D>> {
        let grid = self
            .grid
            .as_ref()
            .ok_or_else(|| {
                Error::Serialization(format!("submap {} has no grid", self.submap_id))
            })?
            .to_grid()?;
        Ok(Arc::new(Submap2D::from_parts(
            self.local_pose,
            grid,
            self.num_range_data,
            self.finished,
        )))
    }
}

/// Serialized trajectory node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub node_id: NodeId,
    pub time: Time,
    pub local_pose: Pose2D,
    pub gravity_alignment: f64,
    pub point_cloud: PointCloud2D,
    pub global_pose: Pose2D,
}

impl SerializedNode {
    pub fn to_node(&self) -> NodeFromProto {
        NodeFromProto {
            node_id: self.node_id,
            constant_data: Arc::new(NodeData {
                time: self.time,
                local_pose: self.local_pose,
                gravity_alignment: self.gravity_alignment,
                point_cloud: self.point_cloud.clone(),
            }),
        }
    }
}

/// Serialized constraint edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedConstraint {
    pub submap_id: SubmapId,
    pub node_id: NodeId,
    /// The measured node-in-submap pose (tracking frame).
    pub relative_pose: Pose2D,
    pub translation_weight: f64,
    pub rotation_weight: f64,
    pub tag: ConstraintTag,
}

impl SerializedConstraint {
    pub fn from_constraint(constraint: &Constraint) -> Self {
        Self {
            submap_id: constraint.submap_id,
            node_id: constraint.node_id,
            relative_pose: constraint.pose.relative_pose,
            translation_weight: constraint.pose.translation_weight,
            rotation_weight: constraint.pose.rotation_weight,
            tag: constraint.tag,
        }
    }

    pub fn to_constraint(&self) -> Constraint {
        Constraint {
            submap_id: self.submap_id,
            node_id: self.node_id,
            pose: ConstraintPose {
                relative_pose: self.relative_pose,
                translation_weight: self.translation_weight,
                rotation_weight: self.rotation_weight,
            },
            tag: self.tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::inserter::{range_data_from_returns, RangeDataInserter};
    use approx::assert_relative_eq;

    fn sample_submap() -> Submap2D {
        let submap = Submap2D::new(
            Pose2D::new(1.0, -2.0, 0.3),
            ProbabilityGrid::centered(0.05, Point2D::new(0.0, 0.0), 60),
        );
        let inserter = RangeDataInserter::new();
        let data = range_data_from_returns(
            Point2D::new(1.0, -2.0),
            (0..25).map(|i| Point2D::new(2.0, -2.0 + i as f64 * 0.04)).collect(),
        );
        submap.insert_range_data(&data, &inserter);
        submap.insert_range_data(&data, &inserter);
        submap.finish();
        submap
    }

    // Serialization preserves local_pose, num_range_data, finished, and
    // grid cells bit-for-bit.
    #[test]
    fn test_submap_roundtrip() {
        let submap = sample_submap();
        let serialized = SerializedSubmap::from_submap(SubmapId::new(0, 0), &submap);
        let restored = serialized.to_submap().unwrap();

        assert_relative_eq!(restored.local_pose().x, submap.local_pose().x, epsilon = 1e-6);
        assert_relative_eq!(restored.local_pose().y, submap.local_pose().y, epsilon = 1e-6);
        assert_relative_eq!(
            restored.local_pose().theta,
            submap.local_pose().theta,
            epsilon = 1e-6
        );
        assert_eq!(restored.num_range_data(), submap.num_range_data());
        assert_eq!(restored.finished(), submap.finished());

        let original_grid = submap.grid();
        let restored_grid = restored.grid();
        assert_eq!(*original_grid, *restored_grid);
    }

    #[test]
    fn test_submap_roundtrip_through_json() {
        let submap = sample_submap();
        let serialized = SerializedSubmap::from_submap(SubmapId::new(1, 4), &submap);
        let json = serde_json::to_string(&serialized).unwrap();
        let parsed: SerializedSubmap = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, serialized);
    }

    #[test]
    fn test_submap_without_grid_rejected() {
        let serialized = SerializedSubmap {
            submap_id: SubmapId::new(0, 0),
            local_pose: Pose2D::identity(),
            num_range_data: 1,
            finished: true,
            grid: None,
        };
        assert!(serialized.to_submap().is_err());
    }

    #[test]
    fn test_grid_shape_mismatch_rejected() {
        let grid = SerializedGrid {
            resolution: 0.05,
            max: Point2D::new(1.0, 1.0),
            num_x_cells: 10,
            num_y_cells: 10,
            cells: vec![0; 5],
            known: vec![false; 5],
        };
        assert!(grid.to_grid().is_err());
    }

    #[test]
    fn test_constraint_roundtrip() {
        let constraint = Constraint::inter(
            SubmapId::new(0, 2),
            NodeId::new(1, 7),
            Pose2D::new(0.5, -0.25, 0.1),
            1.1e4,
            1e5,
        );
        let serialized = SerializedConstraint::from_constraint(&constraint);
        assert_eq!(serialized.to_constraint(), constraint);
    }

    #[test]
    fn test_node_conversion() {
        let serialized = SerializedNode {
            node_id: NodeId::new(0, 3),
            time: Time(42),
            local_pose: Pose2D::new(1.0, 2.0, 0.3),
            gravity_alignment: 0.05,
            point_cloud: PointCloud2D::from_points(vec![Point2D::new(1.0, 0.0)]),
            global_pose: Pose2D::new(5.0, 5.0, 0.0),
        };
        let node = serialized.to_node();
        assert_eq!(node.node_id, NodeId::new(0, 3));
        assert_eq!(node.constant_data.time, Time(42));
        assert_eq!(node.constant_data.point_cloud.len(), 1);
    }
}
