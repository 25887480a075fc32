//! The optimization problem behind the pose graph.
//!
//! Keeps its own view of submap and node poses, ingests constraints,
//! frozen trajectories, and landmark observations, and solves a
//! non-linear least-squares problem over the free poses. The pose graph
//! copies results back under its own lock; nothing here is thread-safe.
//!
//! The solver is a damped Gauss-Newton iteration over 3-DoF pose blocks
//! (one per submap, one per node). Frozen trajectories and the gauge
//! block (the first submap) are fixed parameter blocks: they contribute
//! residuals but receive no updates.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::OptimizationConfig;
use crate::core::math::angle_diff;
use crate::core::{
    interpolate, MapById, NodeId, Pose2D, SubmapId, Time, Timestamped, TimestampedPose,
    TrajectoryId,
};
use crate::sensor::{ImuData, OdometryData};

use super::constraint::{Constraint, ConstraintTag};
use super::LandmarkNode;

/// A node as the optimizer sees it.
#[derive(Clone, Copy, Debug)]
pub struct NodeSpec {
    pub time: Time,
    /// Gravity-aligned pose in the trajectory's local frame.
    pub local_pose: Pose2D,
    pub global_pose: Pose2D,
    /// Rotation that gravity-aligns the tracking frame.
    pub gravity_alignment: f64,
}

impl Timestamped for NodeSpec {
    fn time(&self) -> Time {
        self.time
    }
}

/// A submap as the optimizer sees it.
#[derive(Clone, Copy, Debug)]
pub struct SubmapSpec {
    pub global_pose: Pose2D,
}

/// Summary of one solve.
#[derive(Clone, Copy, Debug)]
pub struct SolveSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

/// Non-linear least-squares problem over submap and node poses.
pub struct OptimizationProblem {
    config: OptimizationConfig,
    max_num_iterations: usize,
    node_data: MapById<NodeId, NodeSpec>,
    submap_data: MapById<SubmapId, SubmapSpec>,
    landmark_data: BTreeMap<String, Pose2D>,
    imu_data: BTreeMap<TrajectoryId, Vec<ImuData>>,
    odometry_data: BTreeMap<TrajectoryId, Vec<OdometryData>>,
}

impl OptimizationProblem {
    pub fn new(config: OptimizationConfig) -> Self {
        let max_num_iterations = config.max_num_iterations;
        Self {
            config,
            max_num_iterations,
            node_data: MapById::new(),
            submap_data: MapById::new(),
            landmark_data: BTreeMap::new(),
            imu_data: BTreeMap::new(),
            odometry_data: BTreeMap::new(),
        }
    }

    pub fn node_data(&self) -> &MapById<NodeId, NodeSpec> {
        &self.node_data
    }

    pub fn submap_data(&self) -> &MapById<SubmapId, SubmapSpec> {
        &self.submap_data
    }

    pub fn landmark_data(&self) -> &BTreeMap<String, Pose2D> {
        &self.landmark_data
    }

    pub fn imu_data(&self) -> &BTreeMap<TrajectoryId, Vec<ImuData>> {
        &self.imu_data
    }

    pub fn odometry_data(&self) -> &BTreeMap<TrajectoryId, Vec<OdometryData>> {
        &self.odometry_data
    }

    pub fn add_submap(&mut self, trajectory_id: TrajectoryId, global_pose: Pose2D) -> SubmapId {
        self.submap_data
            .append(trajectory_id, SubmapSpec { global_pose })
    }

    pub fn insert_submap(&mut self, submap_id: SubmapId, global_pose: Pose2D) {
        self.submap_data
            .insert(submap_id, SubmapSpec { global_pose });
    }

    pub fn trim_submap(&mut self, submap_id: SubmapId) {
        self.submap_data.trim(submap_id);
    }

    pub fn add_trajectory_node(&mut self, trajectory_id: TrajectoryId, spec: NodeSpec) -> NodeId {
        self.node_data.append(trajectory_id, spec)
    }

    pub fn insert_trajectory_node(&mut self, node_id: NodeId, spec: NodeSpec) {
        self.node_data.insert(node_id, spec);
    }

    pub fn trim_trajectory_node(&mut self, node_id: NodeId) {
        self.node_data.trim(node_id);
    }

    pub fn add_imu_data(&mut self, trajectory_id: TrajectoryId, imu_data: ImuData) {
        self.imu_data.entry(trajectory_id).or_default().push(imu_data);
    }

    pub fn add_odometry_data(&mut self, trajectory_id: TrajectoryId, odometry_data: OdometryData) {
        self.odometry_data
            .entry(trajectory_id)
            .or_default()
            .push(odometry_data);
    }

    /// Override the iteration cap (used for the final optimization).
    pub fn set_max_num_iterations(&mut self, max_num_iterations: usize) {
        self.max_num_iterations = max_num_iterations;
    }

    pub fn max_num_iterations(&self) -> usize {
        self.max_num_iterations
    }

    /// Solve for the free poses and re-estimate landmark positions.
    ///
    /// Submaps and nodes of `frozen_trajectories` are fixed parameter
    /// blocks, as is the first submap (the gauge).
    pub fn solve(
        &mut self,
        constraints: &[Constraint],
        frozen_trajectories: &BTreeSet<TrajectoryId>,
        landmark_nodes: &BTreeMap<String, LandmarkNode>,
    ) -> SolveSummary {
        if self.submap_data.is_empty() {
            return SolveSummary {
                iterations: 0,
                initial_cost: 0.0,
                final_cost: 0.0,
                converged: true,
            };
        }

        let blocks = BlockIndex::new(&self.submap_data, &self.node_data, frozen_trajectories);
        let usable: Vec<&Constraint> = constraints
            .iter()
            .filter(|c| {
                let ok = self.submap_data.contains(c.submap_id) && self.node_data.contains(c.node_id);
                if !ok {
                    log::warn!(
                        "constraint {} -> {} references trimmed data, skipping",
                        c.submap_id,
                        c.node_id
                    );
                }
                ok
            })
            .collect();

        let initial_cost = self.cost(&usable);
        let mut current_cost = initial_cost;
        let mut lambda = self.config.damping;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_num_iterations {
            iterations += 1;
            let (h, b) = self.build_normal_equations(&usable, &blocks, lambda);
            let Some(dx) = solve_dense(h, b) else {
                log::warn!("optimization linear solve failed at iteration {iterations}");
                break;
            };
            let previous = self.snapshot_poses(&blocks);
            self.apply_update(&blocks, &dx);

            let new_cost = self.cost(&usable);
            if new_cost > current_cost * (1.0 + 1e-9) {
                // Step made things worse; back off and damp harder.
                self.restore_poses(&blocks, &previous);
                lambda *= 10.0;
                if lambda > 1e8 {
                    break;
                }
                continue;
            }
            lambda = (lambda * 0.5).max(1e-12);
            let relative_change = (current_cost - new_cost) / current_cost.max(1e-12);
            current_cost = new_cost;
            if relative_change < self.config.convergence_threshold {
                converged = true;
                break;
            }
        }

        self.solve_landmarks(landmark_nodes);
        log::info!(
            "optimization: {} constraints, {} iterations, cost {:.6} -> {:.6}",
            usable.len(),
            iterations,
            initial_cost,
            current_cost
        );
        SolveSummary {
            iterations,
            initial_cost,
            final_cost: current_cost,
            converged,
        }
    }

    fn pose_of(&self, block: Block) -> Pose2D {
        match block {
            Block::Submap(id) => self.submap_data.at(id).global_pose,
            Block::Node(id) => self.node_data.at(id).global_pose,
        }
    }

    fn cost(&self, constraints: &[&Constraint]) -> f64 {
        let mut cost = 0.0;
        for constraint in constraints {
            let submap_pose = self.submap_data.at(constraint.submap_id).global_pose;
            let node_pose = self.node_data.at(constraint.node_id).global_pose;
            let error = edge_error(&submap_pose, &node_pose, &constraint.pose.relative_pose);
            let (tw, rw) = self.effective_weights(constraint, &error);
            cost += tw * (error[0] * error[0] + error[1] * error[1]) + rw * error[2] * error[2];
        }
        cost
    }

    /// Weights for one residual, with Huber attenuation on loop
    /// closures so a single bad match cannot warp the map.
    fn effective_weights(&self, constraint: &Constraint, error: &[f64; 3]) -> (f64, f64) {
        let mut tw = constraint.pose.translation_weight;
        let mut rw = constraint.pose.rotation_weight;
        if constraint.tag == ConstraintTag::InterSubmap {
            let norm = (error[0] * error[0] + error[1] * error[1]).sqrt();
            if norm > self.config.huber_scale {
                let scale = self.config.huber_scale / norm;
                tw *= scale;
                rw *= scale;
            }
        }
        (tw, rw)
    }

    fn build_normal_equations(
        &self,
        constraints: &[&Constraint],
        blocks: &BlockIndex,
        lambda: f64,
    ) -> (Vec<Vec<f64>>, Vec<f64>) {
        let dim = blocks.num_free_blocks() * 3;
        let mut h = vec![vec![0.0; dim]; dim];
        let mut b = vec![0.0; dim];

        for constraint in constraints {
            let submap_pose = self.submap_data.at(constraint.submap_id).global_pose;
            let node_pose = self.node_data.at(constraint.node_id).global_pose;
            let error = edge_error(&submap_pose, &node_pose, &constraint.pose.relative_pose);
            let (j_submap, j_node) = edge_jacobians(&submap_pose, &node_pose);
            let (tw, rw) = self.effective_weights(constraint, &error);
            let weights = [tw, tw, rw];

            let submap_index = blocks.free_index(Block::Submap(constraint.submap_id));
            let node_index = blocks.free_index(Block::Node(constraint.node_id));

            accumulate(
                &mut h,
                &mut b,
                &error,
                &weights,
                submap_index,
                &j_submap,
                node_index,
                &j_node,
            );
        }

        for d in 0..dim {
            let diagonal = h[d][d];
            h[d][d] = diagonal + lambda * (1.0 + diagonal);
        }
        (h, b)
    }

    fn snapshot_poses(&self, blocks: &BlockIndex) -> Vec<Pose2D> {
        blocks.free.iter().map(|&block| self.pose_of(block)).collect()
    }

    fn restore_poses(&mut self, blocks: &BlockIndex, poses: &[Pose2D]) {
        for (&block, &pose) in blocks.free.iter().zip(poses) {
            match block {
                Block::Submap(id) => self.submap_data.at_mut(id).global_pose = pose,
                Block::Node(id) => self.node_data.at_mut(id).global_pose = pose,
            }
        }
    }

    fn apply_update(&mut self, blocks: &BlockIndex, dx: &[f64]) {
        for (i, &block) in blocks.free.iter().enumerate() {
            let delta = Pose2D::new(dx[3 * i], dx[3 * i + 1], dx[3 * i + 2]);
            match block {
                Block::Submap(id) => {
                    let pose = &mut self.submap_data.at_mut(id).global_pose;
                    *pose = Pose2D::new(
                        pose.x + delta.x,
                        pose.y + delta.y,
                        crate::core::math::normalize_angle(pose.theta + delta.theta),
                    );
                }
                Block::Node(id) => {
                    let pose = &mut self.node_data.at_mut(id).global_pose;
                    *pose = Pose2D::new(
                        pose.x + delta.x,
                        pose.y + delta.y,
                        crate::core::math::normalize_angle(pose.theta + delta.theta),
                    );
                }
            }
        }
    }

    /// Re-estimate landmark global poses from their observations.
    ///
    /// Each observation is anchored by interpolating the observing
    /// trajectory's node poses at the observation time; candidates are
    /// combined by a translation-weighted mean.
    fn solve_landmarks(&mut self, landmark_nodes: &BTreeMap<String, LandmarkNode>) {
        for (id, landmark) in landmark_nodes {
            let mut weight_sum = 0.0;
            let mut x = 0.0;
            let mut y = 0.0;
            let mut sin_sum = 0.0;
            let mut cos_sum = 0.0;
            for observation in &landmark.observations {
                let Some(tracking_pose) =
                    self.interpolated_node_pose(observation.trajectory_id, observation.time)
                else {
                    log::warn!(
                        "landmark {} observed from trajectory {} with no surrounding nodes",
                        id,
                        observation.trajectory_id
                    );
                    continue;
                };
                let candidate = tracking_pose.compose(&observation.landmark_to_tracking);
                let weight = observation.translation_weight.max(1e-9);
                weight_sum += weight;
                x += weight * candidate.x;
                y += weight * candidate.y;
                sin_sum += weight * candidate.theta.sin();
                cos_sum += weight * candidate.theta.cos();
            }
            if weight_sum > 0.0 {
                self.landmark_data.insert(
                    id.clone(),
                    Pose2D::new(x / weight_sum, y / weight_sum, sin_sum.atan2(cos_sum)),
                );
            }
        }
    }

    fn interpolated_node_pose(&self, trajectory_id: TrajectoryId, time: Time) -> Option<Pose2D> {
        let (upper_id, upper) = self.node_data.lower_bound(trajectory_id, time).or_else(|| {
            // Past the last node: clamp to it.
            self.node_data.last_of_trajectory(trajectory_id)
        })?;
        if upper.time <= time {
            return Some(upper.global_pose);
        }
        let lower = self
            .node_data
            .trajectory(trajectory_id)
            .take_while(|(id, _)| id.node_index < upper_id.node_index)
            .last();
        let Some((_, lower)) = lower else {
            return Some(upper.global_pose);
        };
        Some(interpolate(
            &TimestampedPose {
                time: lower.time,
                pose: lower.global_pose,
            },
            &TimestampedPose {
                time: upper.time,
                pose: upper.global_pose,
            },
            time.max(lower.time).min(upper.time),
        ))
    }
}

/// A 3-DoF parameter block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Block {
    Submap(SubmapId),
    Node(NodeId),
}

/// Free-block numbering for the normal equations.
struct BlockIndex {
    free: Vec<Block>,
    index: HashMap<Block, usize>,
}

impl BlockIndex {
    fn new(
        submap_data: &MapById<SubmapId, SubmapSpec>,
        node_data: &MapById<NodeId, NodeSpec>,
        frozen_trajectories: &BTreeSet<TrajectoryId>,
    ) -> Self {
        let mut free = Vec::new();
        let mut first_submap = true;
        for (id, _) in submap_data.iter() {
            let frozen = frozen_trajectories.contains(&id.trajectory_id);
            // The first submap anchors the global frame.
            if !frozen && !first_submap {
                free.push(Block::Submap(id));
            }
            first_submap = false;
        }
        for (id, _) in node_data.iter() {
            if !frozen_trajectories.contains(&id.trajectory_id) {
                free.push(Block::Node(id));
            }
        }
        let index = free.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        Self { free, index }
    }

    fn num_free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Index of a block, or `None` for fixed blocks.
    fn free_index(&self, block: Block) -> Option<usize> {
        self.index.get(&block).copied()
    }
}

/// Error of one constraint edge: predicted relative pose minus measured.
fn edge_error(submap_pose: &Pose2D, node_pose: &Pose2D, measured: &Pose2D) -> [f64; 3] {
    let predicted = submap_pose.inverse().compose(node_pose);
    [
        predicted.x - measured.x,
        predicted.y - measured.y,
        angle_diff(measured.theta, predicted.theta),
    ]
}

/// Jacobians of the edge error w.r.t. the submap and node blocks.
///
/// Rows are (ex, ey, etheta); columns are (x, y, theta) of the block.
fn edge_jacobians(submap_pose: &Pose2D, node_pose: &Pose2D) -> ([[f64; 3]; 3], [[f64; 3]; 3]) {
    let (sin_s, cos_s) = submap_pose.theta.sin_cos();
    let dx = node_pose.x - submap_pose.x;
    let dy = node_pose.y - submap_pose.y;

    // d(Rsᵀ (tn - ts)) / d(...)
    let j_submap = [
        [-cos_s, -sin_s, -sin_s * dx + cos_s * dy],
        [sin_s, -cos_s, -cos_s * dx - sin_s * dy],
        [0.0, 0.0, -1.0],
    ];
    let j_node = [
        [cos_s, sin_s, 0.0],
        [-sin_s, cos_s, 0.0],
        [0.0, 0.0, 1.0],
    ];
    (j_submap, j_node)
}

/// Accumulate one weighted edge into H and b.
#[allow(clippy::too_many_arguments)]
fn accumulate(
    h: &mut [Vec<f64>],
    b: &mut [f64],
    error: &[f64; 3],
    weights: &[f64; 3],
    submap_index: Option<usize>,
    j_submap: &[[f64; 3]; 3],
    node_index: Option<usize>,
    j_node: &[[f64; 3]; 3],
) {
    let blocks = [(submap_index, j_submap), (node_index, j_node)];
    for (index_a, j_a) in blocks {
        let Some(a) = index_a else { continue };
        // b += Jᵀ W e
        for col in 0..3 {
            let mut value = 0.0;
            for row in 0..3 {
                value += j_a[row][col] * weights[row] * error[row];
            }
            b[3 * a + col] += value;
        }
        // H += Jᵀ W J, block by block.
        for (index_b, j_b) in blocks {
            let Some(bb) = index_b else { continue };
            for col_a in 0..3 {
                for col_b in 0..3 {
                    let mut value = 0.0;
                    for row in 0..3 {
                        value += j_a[row][col_a] * weights[row] * j_b[row][col_b];
                    }
                    h[3 * a + col_a][3 * bb + col_b] += value;
                }
            }
        }
    }
}

/// Solve H·x = −b by Gaussian elimination with partial pivoting.
fn solve_dense(mut h: Vec<Vec<f64>>, b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if n == 0 {
        return Some(Vec::new());
    }
    let mut rhs: Vec<f64> = b.iter().map(|v| -v).collect();

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&a, &b| h[a][col].abs().total_cmp(&h[b][col].abs()))?;
        if h[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        h.swap(col, pivot_row);
        rhs.swap(col, pivot_row);
        let pivot_row = h[col].clone();
        let pivot_rhs = rhs[col];
        for row in (col + 1)..n {
            let factor = h[row][col] / pivot_row[col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                h[row][k] -= factor * pivot_row[k];
            }
            rhs[row] -= factor * pivot_rhs;
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut value = rhs[row];
        for col in (row + 1)..n {
            value -= h[row][col] * x[col];
        }
        x[row] = value / h[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spec(time_micros: i64, pose: Pose2D) -> NodeSpec {
        NodeSpec {
            time: Time(time_micros),
            local_pose: pose,
            global_pose: pose,
            gravity_alignment: 0.0,
        }
    }

    #[test]
    fn test_solve_empty_problem() {
        let mut problem = OptimizationProblem::new(OptimizationConfig::default());
        let summary = problem.solve(&[], &BTreeSet::new(), &BTreeMap::new());
        assert!(summary.converged);
        assert_eq!(summary.iterations, 0);
    }

    #[test]
    fn test_solve_pulls_node_onto_constraint() {
        let mut problem = OptimizationProblem::new(OptimizationConfig::default());
        let submap_id = problem.add_submap(0, Pose2D::identity());
        let node_id = problem.add_trajectory_node(0, spec(0, Pose2D::new(1.3, -0.2, 0.1)));

        // The constraint says the node sits at (1, 0) in the submap frame.
        let constraints = vec![Constraint::intra(
            submap_id,
            node_id,
            Pose2D::new(1.0, 0.0, 0.0),
            1e2,
            1e2,
        )];
        problem.solve(&constraints, &BTreeSet::new(), &BTreeMap::new());

        let node_pose = problem.node_data().at(node_id).global_pose;
        assert_relative_eq!(node_pose.x, 1.0, epsilon = 1e-3);
        assert_relative_eq!(node_pose.y, 0.0, epsilon = 1e-3);
        assert_relative_eq!(node_pose.theta, 0.0, epsilon = 1e-3);
        // Gauge submap untouched.
        let submap_pose = problem.submap_data().at(submap_id).global_pose;
        assert_relative_eq!(submap_pose.x, 0.0);
    }

    #[test]
    fn test_frozen_trajectory_poses_unchanged() {
        let mut problem = OptimizationProblem::new(OptimizationConfig::default());
        let frozen_submap = problem.add_submap(0, Pose2D::new(0.5, 0.5, 0.2));
        let frozen_node = problem.add_trajectory_node(0, spec(0, Pose2D::new(0.7, 0.5, 0.2)));
        let live_submap = problem.add_submap(1, Pose2D::identity());
        let live_node = problem.add_trajectory_node(1, spec(0, Pose2D::new(2.0, 0.0, 0.0)));

        let constraints = vec![
            Constraint::intra(frozen_submap, frozen_node, Pose2D::new(0.5, 0.0, 0.0), 1e2, 1e2),
            Constraint::intra(live_submap, live_node, Pose2D::new(1.0, 0.0, 0.0), 1e2, 1e2),
        ];
        let frozen: BTreeSet<TrajectoryId> = [0].into_iter().collect();
        problem.solve(&constraints, &frozen, &BTreeMap::new());
        problem.solve(&constraints, &frozen, &BTreeMap::new());

        let submap_pose = problem.submap_data().at(frozen_submap).global_pose;
        let node_pose = problem.node_data().at(frozen_node).global_pose;
        assert_eq!(submap_pose, Pose2D::new(0.5, 0.5, 0.2));
        assert_eq!(node_pose, Pose2D::new(0.7, 0.5, 0.2));
        // The live pair still converges onto its constraint.
        let live_submap_pose = problem.submap_data().at(live_submap).global_pose;
        let live_node_pose = problem.node_data().at(live_node).global_pose;
        let relative = live_submap_pose.inverse().compose(&live_node_pose);
        assert_relative_eq!(relative.x, 1.0, epsilon = 1e-3);
        assert_relative_eq!(relative.y, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_constraint_with_trimmed_node_skipped() {
        let mut problem = OptimizationProblem::new(OptimizationConfig::default());
        let submap_id = problem.add_submap(0, Pose2D::identity());
        let node_id = problem.add_trajectory_node(0, spec(0, Pose2D::identity()));
        problem.trim_trajectory_node(node_id);

        let constraints = vec![Constraint::intra(
            submap_id,
            node_id,
            Pose2D::identity(),
            1e2,
            1e2,
        )];
        // Must not panic; constraint is dropped with a warning.
        let summary = problem.solve(&constraints, &BTreeSet::new(), &BTreeMap::new());
        assert_relative_eq!(summary.final_cost, 0.0);
    }

    #[test]
    fn test_landmark_estimated_from_observations() {
        let mut problem = OptimizationProblem::new(OptimizationConfig::default());
        problem.add_submap(0, Pose2D::identity());
        problem.add_trajectory_node(0, spec(0, Pose2D::identity()));
        problem.add_trajectory_node(0, spec(1_000_000, Pose2D::new(2.0, 0.0, 0.0)));

        let mut landmarks = BTreeMap::new();
        landmarks.insert(
            "lamp".to_string(),
            LandmarkNode {
                observations: vec![crate::sensor::LandmarkObservation {
                    trajectory_id: 0,
                    time: Time(500_000),
                    landmark_to_tracking: Pose2D::new(0.0, 1.0, 0.0),
                    translation_weight: 1.0,
                    rotation_weight: 1.0,
                }],
                global_pose: None,
            },
        );
        problem.solve(&[], &BTreeSet::new(), &landmarks);

        let pose = problem.landmark_data().get("lamp").unwrap();
        // Node interpolates to (1, 0); landmark is 1m to its left.
        assert_relative_eq!(pose.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(pose.y, 1.0, epsilon = 1e-6);
    }
}
