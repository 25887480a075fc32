//! Pluggable pose-graph trimming policies.
//!
//! Trimmers bound memory by retiring submaps the graph no longer needs.
//! They are owned by the pose graph and invoked after each optimization
//! round with a short-lived [`Trimmable`] handle; a trimmer must not
//! hold on to the handle between invocations.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{MapById, NodeId, SubmapId, Time, TrajectoryId};

use super::constraint::{Constraint, ConstraintTag};
use super::pose_graph::SubmapData;
use super::TrajectoryNode;

/// Restricted view of the pose graph handed to trimmers.
pub trait Trimmable {
    fn num_submaps(&self, trajectory_id: TrajectoryId) -> usize;
    fn get_submap_ids(&self, trajectory_id: TrajectoryId) -> Vec<SubmapId>;
    /// Finished submaps that already have an optimized global pose.
    fn get_optimized_submap_data(&self) -> MapById<SubmapId, SubmapData>;
    fn get_trajectory_nodes(&self) -> MapById<NodeId, TrajectoryNode>;
    fn get_constraints(&self) -> Vec<Constraint>;
    fn is_finished_trajectory(&self, trajectory_id: TrajectoryId) -> bool;
    /// Atomically remove a submap, its constraints, and any nodes left
    /// without an intra-submap constraint.
    fn trim_submap(&mut self, submap_id: SubmapId);
}

/// A trimming policy run after every optimization round.
pub trait PoseGraphTrimmer: Send {
    fn trim(&mut self, trimmable: &mut dyn Trimmable);
    /// Finished trimmers are dropped by the pose graph.
    fn is_finished(&self) -> bool;
}

/// Retires submaps whose covered area is dominated by fresher submaps.
///
/// Finished submaps are rasterized onto a shared global grid; each cell
/// keeps the `fresh_submaps_count` most recently updated submaps
/// covering it, and submaps that win at least `min_covered_cells_count`
/// cells survive. Runs once.
pub struct OverlappingSubmapsTrimmer {
    fresh_submaps_count: u16,
    min_covered_cells_count: u16,
    finished: bool,
}

impl OverlappingSubmapsTrimmer {
    pub fn new(fresh_submaps_count: u16, min_covered_cells_count: u16) -> Self {
        Self {
            fresh_submaps_count,
            min_covered_cells_count,
            finished: false,
        }
    }
}

impl PoseGraphTrimmer for OverlappingSubmapsTrimmer {
    fn trim(&mut self, trimmable: &mut dyn Trimmable) {
        if self.finished {
            return;
        }
        self.finished = true;

        let constraints = trimmable.get_constraints();
        let submap_data = trimmable.get_optimized_submap_data();
        let trajectory_nodes = trimmable.get_trajectory_nodes();
        if submap_data.is_empty() {
            return;
        }

        let freshness = compute_submap_freshness(&submap_data, &trajectory_nodes, &constraints);
        let offset = submap_data
            .iter()
            .next()
            .expect("non-empty")
            .1
            .submap
            .grid()
            .limits()
            .max();

        let mut global_grid: BTreeMap<(i64, i64), Vec<(SubmapId, Time)>> = BTreeMap::new();
        let mut all_submap_ids = BTreeSet::new();
        for (submap_id, data) in submap_data.iter() {
            let Some(&fresh) = freshness.get(&submap_id) else {
                continue;
            };
            all_submap_ids.insert(submap_id);

            let grid = data.submap.grid();
            if grid.known_cells().next().is_none() {
                log::warn!("empty grid found in submap {}", submap_id);
                continue;
            }
            for (index, _) in grid.known_cells() {
                let center = data.pose.transform_point(grid.limits().cell_center(index));
                let cell = (
                    (offset.x - center.x).round() as i64,
                    (offset.y - center.y).round() as i64,
                );
                global_grid.entry(cell).or_default().push((submap_id, fresh));
            }
        }

        for id in find_submap_ids_to_trim(
            &global_grid,
            &all_submap_ids,
            self.fresh_submaps_count,
            self.min_covered_cells_count,
        ) {
            trimmable.trim_submap(id);
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Timestamp of each submap's most recent range-data insertion, via the
/// largest intra-submap-constrained node id.
fn compute_submap_freshness(
    submap_data: &MapById<SubmapId, SubmapData>,
    trajectory_nodes: &MapById<NodeId, TrajectoryNode>,
    constraints: &[Constraint],
) -> BTreeMap<SubmapId, Time> {
    let mut latest_node: BTreeMap<SubmapId, NodeId> = BTreeMap::new();
    for constraint in constraints {
        if constraint.tag != ConstraintTag::IntraSubmap {
            continue;
        }
        let entry = latest_node
            .entry(constraint.submap_id)
            .or_insert(constraint.node_id);
        *entry = (*entry).max(constraint.node_id);
    }

    let mut freshness = BTreeMap::new();
    for (submap_id, node_id) in latest_node {
        if !submap_data.contains(submap_id) {
            log::warn!(
                "intra-submap constraint between {} and {} is missing submap data",
                submap_id,
                node_id
            );
            continue;
        }
        let Some(node) = trajectory_nodes.get(node_id) else {
            continue;
        };
        freshness.insert(submap_id, node.constant_data.time);
    }
    freshness
}

/// Per cell, keep the freshest submaps; a submap survives when it wins
/// enough cells. Everything else is trimmed, in ascending id order.
fn find_submap_ids_to_trim(
    global_grid: &BTreeMap<(i64, i64), Vec<(SubmapId, Time)>>,
    all_submap_ids: &BTreeSet<SubmapId>,
    fresh_submaps_count: u16,
    min_covered_cells_count: u16,
) -> Vec<SubmapId> {
    let mut cells_covered: BTreeMap<SubmapId, u32> = BTreeMap::new();
    for submaps_per_cell in global_grid.values() {
        let mut submaps_per_cell = submaps_per_cell.clone();
        if submaps_per_cell.len() > fresh_submaps_count as usize {
            submaps_per_cell.sort_by(|left, right| right.1.cmp(&left.1));
            submaps_per_cell.truncate(fresh_submaps_count as usize);
        }
        for (submap_id, _) in submaps_per_cell {
            *cells_covered.entry(submap_id).or_insert(0) += 1;
        }
    }

    let keep: BTreeSet<SubmapId> = cells_covered
        .into_iter()
        .filter(|&(_, count)| count >= min_covered_cells_count as u32)
        .map(|(id, _)| id)
        .collect();

    all_submap_ids.difference(&keep).copied().collect()
}
