//! The work-queue-driven pose graph.
//!
//! All canonical SLAM state lives here: submaps, nodes, constraints,
//! landmarks, trajectory lifecycle. Mutations are serialized by one
//! state lock and arrive either as direct calls or as deferred work
//! items drained by whichever worker completes the optimization
//! barrier.
//!
//! # Work-queue discipline
//!
//! The graph runs in one of two modes. In *direct mode* (no queue) a
//! work item executes immediately under the already-held state lock. In
//! *queued mode* items append to a FIFO; the queue is created by
//! `dispatch_optimization`, which also arms the constraint builder's
//! `when_done` barrier. When the barrier fires, `handle_work_queue`
//! folds the new constraints in, solves, applies the result, runs
//! trimmers, and drains the queue until either another optimization is
//! dispatched (re-arm) or the queue empties (back to direct mode).
//! While an optimization is in flight, nothing else may mutate the
//! graph's view of the constraint set, which is exactly what queued
//! mode guarantees.
//!
//! # Locking
//!
//! Lock order is state lock, then the optimization problem's lock, then
//! the constraint builder's internal lock; the `solve` call holds only
//! the optimization lock so front-end writes keep flowing. The
//! global-SLAM callback and the `when_done` barrier are always invoked
//! with no graph lock held, because callers historically re-enter the
//! graph from them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::PoseGraphConfig;
use crate::core::{
    interpolate, MapById, NodeId, Pose2D, SubmapId, Time, TimestampedPose, TrajectoryId,
};
use crate::sensor::{ImuData, LandmarkData, LandmarkObservation, OdometryData};
use crate::submap::Submap2D;
use crate::utils::{FixedRatioSampler, ThreadPool};

use super::connectivity::TrajectoryConnectivityState;
use super::constraint::{Constraint, ConstraintPose, ConstraintTag};
use super::constraint_builder::ConstraintBuilder;
use super::optimization::{NodeSpec, OptimizationProblem, SubmapSpec};
use super::trimmer::{PoseGraphTrimmer, Trimmable};
use super::work_queue::{WorkItem, WorkItemKind, WorkQueue};
use super::{LandmarkNode, NodeData, TrajectoryNode};

/// Lifecycle state of a trajectory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajectoryState {
    Active,
    Finished,
    Frozen,
    Deleted,
}

/// Two-phase deletion progress, orthogonal to [`TrajectoryState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionState {
    Normal,
    ScheduledForDeletion,
    WaitForDeletion,
}

#[derive(Clone, Copy, Debug)]
struct InternalTrajectoryState {
    state: TrajectoryState,
    deletion_state: DeletionState,
}

impl Default for InternalTrajectoryState {
    fn default() -> Self {
        Self {
            state: TrajectoryState::Active,
            deletion_state: DeletionState::Normal,
        }
    }
}

/// Lifecycle state of a submap within the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubmapState {
    Active,
    Finished,
}

/// Graph-side bookkeeping for one submap.
struct InternalSubmapData {
    submap: Arc<Submap2D>,
    state: SubmapState,
    /// Nodes inserted into this submap.
    node_ids: BTreeSet<NodeId>,
}

/// Snapshot of one submap with its (possibly extrapolated) global pose.
#[derive(Clone, Debug)]
pub struct SubmapData {
    pub submap: Arc<Submap2D>,
    pub pose: Pose2D,
}

/// Lightweight submap pose snapshot.
#[derive(Clone, Copy, Debug)]
pub struct SubmapPose {
    /// Range-data count at snapshot time.
    pub version: usize,
    pub pose: Pose2D,
}

/// Lightweight node pose snapshot.
#[derive(Clone, Copy, Debug)]
pub struct TrajectoryNodePose {
    pub global_pose: Pose2D,
    /// Time and local pose, when the node's constant data is present.
    pub constant_pose_data: Option<(Time, Pose2D)>,
}

/// Seed transform tying a new trajectory to an existing one.
#[derive(Clone, Copy, Debug)]
pub struct InitialTrajectoryPose {
    pub to_trajectory_id: TrajectoryId,
    pub relative_pose: Pose2D,
    pub time: Time,
}

/// Serialized inputs for [`PoseGraph::add_node_from_proto`].
#[derive(Clone, Debug)]
pub struct NodeFromProto {
    pub node_id: NodeId,
    pub constant_data: Arc<NodeData>,
}

/// Callback invoked once per completed optimization pass with the last
/// optimized submap and node per trajectory.
pub type GlobalSlamOptimizationCallback = Box<
    dyn Fn(&BTreeMap<TrajectoryId, SubmapId>, &BTreeMap<TrajectoryId, NodeId>) + Send + Sync,
>;

/// Everything owned by the pose graph, behind the state lock.
struct PoseGraphData {
    submap_data: MapById<SubmapId, InternalSubmapData>,
    trajectory_nodes: MapById<NodeId, TrajectoryNode>,
    /// Nodes added through `add_node` (deserialized nodes not counted);
    /// drives the quiescence condition.
    num_trajectory_nodes: usize,
    constraints: Vec<Constraint>,
    landmark_nodes: BTreeMap<String, LandmarkNode>,
    trajectories_state: BTreeMap<TrajectoryId, InternalTrajectoryState>,
    initial_trajectory_poses: BTreeMap<TrajectoryId, InitialTrajectoryPose>,
    /// Global submap poses as of the last optimization.
    global_submap_poses: MapById<SubmapId, SubmapSpec>,
    connectivity: TrajectoryConnectivityState,
}

type Task = Box<dyn FnOnce(&Arc<Shared>, &mut State) + Send>;

struct State {
    data: PoseGraphData,
    work_queue: Option<WorkQueue<Task>>,
    global_localization_samplers: HashMap<TrajectoryId, FixedRatioSampler>,
    trimmers: Vec<Box<dyn PoseGraphTrimmer>>,
    num_nodes_since_last_loop_closure: usize,
    run_loop_closure: bool,
}

struct Shared {
    config: PoseGraphConfig,
    constraint_builder: ConstraintBuilder,
    optimization_problem: Mutex<OptimizationProblem>,
    state: Mutex<State>,
    quiescence: Condvar,
    global_slam_callback:
        Mutex<Option<Arc<dyn Fn(&BTreeMap<TrajectoryId, SubmapId>, &BTreeMap<TrajectoryId, NodeId>) + Send + Sync>>>,
}

/// The global SLAM back-end.
pub struct PoseGraph {
    shared: Arc<Shared>,
}

impl PoseGraph {
    pub fn new(config: PoseGraphConfig, thread_pool: Arc<ThreadPool>) -> Self {
        let constraint_builder =
            ConstraintBuilder::new(config.constraint_builder.clone(), thread_pool);
        let optimization_problem = Mutex::new(OptimizationProblem::new(config.optimization.clone()));
        Self {
            shared: Arc::new(Shared {
                config,
                constraint_builder,
                optimization_problem,
                state: Mutex::new(State {
                    data: PoseGraphData {
                        submap_data: MapById::new(),
                        trajectory_nodes: MapById::new(),
                        num_trajectory_nodes: 0,
                        constraints: Vec::new(),
                        landmark_nodes: BTreeMap::new(),
                        trajectories_state: BTreeMap::new(),
                        initial_trajectory_poses: BTreeMap::new(),
                        global_submap_poses: MapById::new(),
                        connectivity: TrajectoryConnectivityState::new(),
                    },
                    work_queue: None,
                    global_localization_samplers: HashMap::new(),
                    trimmers: Vec::new(),
                    num_nodes_since_last_loop_closure: 0,
                    run_loop_closure: false,
                }),
                quiescence: Condvar::new(),
                global_slam_callback: Mutex::new(None),
            }),
        }
    }

    /// Insert a node and schedule its constraint search.
    pub fn add_node(
        &self,
        constant_data: Arc<NodeData>,
        trajectory_id: TrajectoryId,
        insertion_submaps: &[Arc<Submap2D>],
    ) -> NodeId {
        self.shared
            .add_node(constant_data, trajectory_id, insertion_submaps)
    }

    pub fn add_imu_data(&self, trajectory_id: TrajectoryId, imu_data: ImuData) {
        self.shared.add_sensor_data(trajectory_id, move |problem| {
            problem.add_imu_data(trajectory_id, imu_data)
        });
    }

    pub fn add_odometry_data(&self, trajectory_id: TrajectoryId, odometry_data: OdometryData) {
        self.shared.add_sensor_data(trajectory_id, move |problem| {
            problem.add_odometry_data(trajectory_id, odometry_data)
        });
    }

    /// Fixed-frame poses are not supported by the 2D back-end.
    pub fn add_fixed_frame_pose_data(&self, trajectory_id: TrajectoryId) {
        log::error!(
            "add_fixed_frame_pose_data called for trajectory {trajectory_id}, not implemented for 2D"
        );
        panic!("add_fixed_frame_pose_data is not implemented for 2D");
    }

    pub fn add_landmark_data(&self, trajectory_id: TrajectoryId, landmark_data: LandmarkData) {
        self.shared.add_landmark_data(trajectory_id, landmark_data);
    }

    /// Install a deserialized submap, created finished at `global_pose`.
    pub fn add_submap_from_proto(
        &self,
        global_pose: Pose2D,
        submap_id: SubmapId,
        submap: Arc<Submap2D>,
    ) {
        self.shared
            .add_submap_from_proto(global_pose, submap_id, submap);
    }

    /// Install a deserialized node at `global_pose`.
    pub fn add_node_from_proto(&self, global_pose: Pose2D, node: NodeFromProto) {
        self.shared.add_node_from_proto(global_pose, node);
    }

    /// Re-install serialized constraints, recomposing each stored pose
    /// with the node's gravity alignment.
    pub fn add_serialized_constraints(&self, constraints: Vec<Constraint>) {
        self.shared.add_serialized_constraints(constraints);
    }

    /// Record membership of a deserialized node in a submap.
    pub fn add_node_to_submap(&self, node_id: NodeId, submap_id: SubmapId) {
        self.shared.add_node_to_submap(node_id, submap_id);
    }

    pub fn finish_trajectory(&self, trajectory_id: TrajectoryId) {
        self.shared.finish_trajectory(trajectory_id);
    }

    pub fn freeze_trajectory(&self, trajectory_id: TrajectoryId) {
        self.shared.freeze_trajectory(trajectory_id);
    }

    /// Two-phase deletion: scheduled now, performed after the next
    /// optimization round. The trajectory must not be active.
    pub fn delete_trajectory(&self, trajectory_id: TrajectoryId) {
        self.shared.delete_trajectory(trajectory_id);
    }

    pub fn is_trajectory_finished(&self, trajectory_id: TrajectoryId) -> bool {
        let state = self.shared.state.lock();
        Shared::is_trajectory_finished(&state, trajectory_id)
    }

    pub fn is_trajectory_frozen(&self, trajectory_id: TrajectoryId) -> bool {
        let state = self.shared.state.lock();
        Shared::is_trajectory_frozen(&state, trajectory_id)
    }

    pub fn add_trimmer(&self, trimmer: Box<dyn PoseGraphTrimmer>) {
        self.shared.add_trimmer(trimmer);
    }

    /// Dispatch a final optimization with the raised iteration cap and
    /// wait for the graph to go quiescent.
    pub fn run_final_optimization(&self) {
        self.shared.run_final_optimization();
    }

    /// Block until the constraint builder and work queue are idle.
    pub fn wait_for_all_computations(&self) {
        self.shared.wait_for_all_computations();
    }

    pub fn set_initial_trajectory_pose(
        &self,
        from_trajectory_id: TrajectoryId,
        to_trajectory_id: TrajectoryId,
        relative_pose: Pose2D,
        time: Time,
    ) {
        let mut state = self.shared.state.lock();
        state.data.initial_trajectory_poses.insert(
            from_trajectory_id,
            InitialTrajectoryPose {
                to_trajectory_id,
                relative_pose,
                time,
            },
        );
    }

    pub fn set_landmark_pose(&self, landmark_id: &str, global_pose: Pose2D) {
        self.shared.set_landmark_pose(landmark_id, global_pose);
    }

    pub fn set_global_slam_optimization_callback(
        &self,
        callback: GlobalSlamOptimizationCallback,
    ) {
        *self.shared.global_slam_callback.lock() = Some(Arc::from(callback));
    }

    // ------------------------------------------------------------------
    // Snapshot queries. All take the state lock and return values.
    // ------------------------------------------------------------------

    pub fn get_trajectory_nodes(&self) -> MapById<NodeId, TrajectoryNode> {
        self.shared.state.lock().data.trajectory_nodes.clone()
    }

    pub fn get_trajectory_node_poses(&self) -> MapById<NodeId, TrajectoryNodePose> {
        let state = self.shared.state.lock();
        let mut poses = MapById::new();
        for (id, node) in state.data.trajectory_nodes.iter() {
            poses.insert(
                id,
                TrajectoryNodePose {
                    global_pose: node.global_pose,
                    constant_pose_data: Some((
                        node.constant_data.time,
                        node.constant_data.local_pose,
                    )),
                },
            );
        }
        poses
    }

    pub fn get_trajectory_states(&self) -> BTreeMap<TrajectoryId, TrajectoryState> {
        let state = self.shared.state.lock();
        state
            .data
            .trajectories_state
            .iter()
            .map(|(&id, entry)| (id, entry.state))
            .collect()
    }

    pub fn get_deletion_state(&self, trajectory_id: TrajectoryId) -> Option<DeletionState> {
        let state = self.shared.state.lock();
        state
            .data
            .trajectories_state
            .get(&trajectory_id)
            .map(|entry| entry.deletion_state)
    }

    pub fn get_landmark_poses(&self) -> BTreeMap<String, Pose2D> {
        let state = self.shared.state.lock();
        state
            .data
            .landmark_nodes
            .iter()
            .filter_map(|(id, node)| node.global_pose.map(|pose| (id.clone(), pose)))
            .collect()
    }

    pub fn get_landmark_nodes(&self) -> BTreeMap<String, LandmarkNode> {
        self.shared.state.lock().data.landmark_nodes.clone()
    }

    /// All constraints, with each pose recomposed into the node's
    /// tracking frame (the inverse of what
    /// [`add_serialized_constraints`](Self::add_serialized_constraints)
    /// applies).
    pub fn constraints(&self) -> Vec<Constraint> {
        let state = self.shared.state.lock();
        state
            .data
            .constraints
            .iter()
            .map(|constraint| {
                let gravity = state
                    .data
                    .trajectory_nodes
                    .at(constraint.node_id)
                    .constant_data
                    .gravity_alignment;
                Constraint {
                    pose: ConstraintPose {
                        relative_pose: constraint
                            .pose
                            .relative_pose
                            .compose(&Pose2D::rotation(gravity)),
                        ..constraint.pose
                    },
                    ..*constraint
                }
            })
            .collect()
    }

    pub fn get_submap_data(&self, submap_id: SubmapId) -> Option<SubmapData> {
        let state = self.shared.state.lock();
        Shared::submap_data_under_lock(&state.data, submap_id)
    }

    pub fn get_all_submap_data(&self) -> MapById<SubmapId, SubmapData> {
        let state = self.shared.state.lock();
        Shared::all_submap_data_under_lock(&state.data)
    }

    pub fn get_all_submap_poses(&self) -> MapById<SubmapId, SubmapPose> {
        let state = self.shared.state.lock();
        let mut poses = MapById::new();
        for (id, _) in state.data.submap_data.iter() {
            let data = Shared::submap_data_under_lock(&state.data, id).expect("iterated id");
            poses.insert(
                id,
                SubmapPose {
                    version: data.submap.num_range_data(),
                    pose: data.pose,
                },
            );
        }
        poses
    }

    /// Transform from a trajectory's local frame to the global frame,
    /// derived from its last optimized submap (or its initial pose).
    pub fn get_local_to_global_transform(&self, trajectory_id: TrajectoryId) -> Pose2D {
        let state = self.shared.state.lock();
        Shared::compute_local_to_global_transform(&state.data, trajectory_id)
    }

    pub fn get_connected_trajectories(&self) -> Vec<Vec<TrajectoryId>> {
        self.shared.state.lock().data.connectivity.components()
    }

    pub fn get_interpolated_global_trajectory_pose(
        &self,
        trajectory_id: TrajectoryId,
        time: Time,
    ) -> Pose2D {
        let state = self.shared.state.lock();
        Shared::interpolated_global_trajectory_pose(&state.data, trajectory_id, time)
    }
}

impl Drop for PoseGraph {
    fn drop(&mut self) {
        self.shared.wait_for_all_computations();
        let state = self.shared.state.lock();
        assert!(state.work_queue.is_none(), "work queue not drained at shutdown");
    }
}

impl Shared {
    // ------------------------------------------------------------------
    // Work-queue machinery
    // ------------------------------------------------------------------

    /// Run `item` now (direct mode) or defer it (queued mode).
    fn add_work_item(self: &Arc<Self>, state: &mut State, item: WorkItem<Task>) {
        match &mut state.work_queue {
            None => (item.task)(self, state),
            Some(queue) => queue.push_back(item),
        }
    }

    fn dispatch_optimization(self: &Arc<Self>, state: &mut State) {
        state.run_loop_closure = true;
        // If a queue already exists, the thread that drains it re-arms
        // the barrier.
        if state.work_queue.is_none() {
            state.work_queue = Some(WorkQueue::new());
            let graph = Arc::clone(self);
            self.constraint_builder
                .when_done(move |result| graph.handle_work_queue(result));
        }
    }

    /// The optimization barrier: runs on the worker that completed the
    /// constraint builder's batch.
    fn handle_work_queue(self: &Arc<Self>, result: Vec<Constraint>) {
        {
            let mut state = self.state.lock();
            state.data.constraints.extend(result.iter().copied());
        }
        self.run_optimization();

        let callback = self.global_slam_callback.lock().clone();
        if let Some(callback) = callback {
            let (last_submap_ids, last_node_ids) = {
                let _state = self.state.lock();
                let problem = self.optimization_problem.lock();
                let mut submap_ids = BTreeMap::new();
                let mut node_ids = BTreeMap::new();
                for trajectory_id in problem.node_data().trajectory_ids() {
                    if let Some((id, _)) = problem.node_data().last_of_trajectory(trajectory_id) {
                        node_ids.insert(trajectory_id, id);
                    }
                    if let Some((id, _)) = problem.submap_data().last_of_trajectory(trajectory_id)
                    {
                        submap_ids.insert(trajectory_id, id);
                    }
                }
                (submap_ids, node_ids)
            };
            callback.as_ref()(&last_submap_ids, &last_node_ids);
        }

        let mut state = self.state.lock();
        for constraint in &result {
            Self::update_trajectory_connectivity(&mut state.data, constraint);
        }
        self.delete_trajectories_if_needed(&mut state);
        self.run_trimmers(&mut state);

        state.num_nodes_since_last_loop_closure = 0;
        state.run_loop_closure = false;
        while !state.run_loop_closure {
            let item = match state.work_queue.as_mut().and_then(WorkQueue::pop_front) {
                Some(item) => item,
                None => {
                    state.work_queue = None;
                    self.quiescence.notify_all();
                    return;
                }
            };
            (item.task)(self, &mut state);
        }
        log::info!(
            "remaining work items in queue: {}",
            state.work_queue.as_ref().map_or(0, WorkQueue::len)
        );
        // Another optimization was requested while draining.
        let graph = Arc::clone(self);
        self.constraint_builder
            .when_done(move |result| graph.handle_work_queue(result));
    }

    fn wait_for_all_computations(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let num_finished_nodes_at_start = self.constraint_builder.get_num_finished_nodes();
        while !(self.constraint_builder.get_num_finished_nodes()
            == state.data.num_trajectory_nodes
            && state.work_queue.is_none())
        {
            let timed_out = self
                .quiescence
                .wait_for(&mut state, Duration::from_secs(1))
                .timed_out();
            if timed_out && state.data.num_trajectory_nodes != num_finished_nodes_at_start {
                let finished = self.constraint_builder.get_num_finished_nodes();
                log::info!(
                    "optimizing: {:.1}%",
                    100.0 * (finished - num_finished_nodes_at_start) as f64
                        / (state.data.num_trajectory_nodes - num_finished_nodes_at_start) as f64
                );
            }
        }
        // Flush whatever the constraint builder still buffers.
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.constraint_builder.when_done(move |result| {
            let _ = sender.send(result);
        });
        drop(state);
        let result = receiver.recv().expect("constraint builder gone");
        self.state.lock().data.constraints.extend(result);
    }

    // ------------------------------------------------------------------
    // Node insertion and constraint search
    // ------------------------------------------------------------------

    fn add_node(
        self: &Arc<Self>,
        constant_data: Arc<NodeData>,
        trajectory_id: TrajectoryId,
        insertion_submaps: &[Arc<Submap2D>],
    ) -> NodeId {
        assert!(!insertion_submaps.is_empty());
        let mut state = self.state.lock();
        let optimized_pose = Self::compute_local_to_global_transform(&state.data, trajectory_id)
            .compose(&constant_data.local_pose);

        self.add_trajectory_if_needed(&mut state, trajectory_id);
        if !Self::can_add_work_item_modifying(&mut state, trajectory_id) {
            log::warn!("add_node was called for finished or deleted trajectory");
        }
        let node_id = state.data.trajectory_nodes.append(
            trajectory_id,
            TrajectoryNode {
                constant_data: Arc::clone(&constant_data),
                global_pose: optimized_pose,
            },
        );
        state.data.num_trajectory_nodes += 1;

        // The first time a submap appears it is `insertion_submaps.back()`.
        let back = insertion_submaps.last().expect("non-empty");
        let is_new_submap = state
            .data
            .submap_data
            .last_of_trajectory(trajectory_id)
            .map_or(true, |(_, data)| !Arc::ptr_eq(&data.submap, back));
        if is_new_submap {
            state.data.submap_data.append(
                trajectory_id,
                InternalSubmapData {
                    submap: Arc::clone(back),
                    state: SubmapState::Active,
                    node_ids: BTreeSet::new(),
                },
            );
        }

        // Read now: the front submap may finish before the deferred work
        // item runs.
        let newly_finished_submap = insertion_submaps[0].finished();
        let submaps: Vec<Arc<Submap2D>> = insertion_submaps.to_vec();
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::ComputeConstraint,
                Box::new(move |graph, state| {
                    graph.compute_constraints_for_node(state, node_id, submaps, newly_finished_submap);
                }),
            ),
        );
        node_id
    }

    fn add_trajectory_if_needed(&self, state: &mut State, trajectory_id: TrajectoryId) {
        let entry = state
            .data
            .trajectories_state
            .entry(trajectory_id)
            .or_default();
        assert!(
            entry.state != TrajectoryState::Finished && entry.state != TrajectoryState::Deleted,
            "trajectory {trajectory_id} is finished or deleted"
        );
        assert_eq!(entry.deletion_state, DeletionState::Normal);
        state.data.connectivity.add(trajectory_id);
        let ratio = self.config.global_sampling_ratio;
        state
            .global_localization_samplers
            .entry(trajectory_id)
            .or_insert_with(|| FixedRatioSampler::new(ratio));
    }

    /// Whether modifying work for `trajectory_id` may be enqueued.
    ///
    /// Unknown trajectories are allowed with a warning (deserialization
    /// touches trajectories before they are registered); finished,
    /// deleted, and deletion-scheduled trajectories are contract
    /// violations.
    fn can_add_work_item_modifying(state: &mut State, trajectory_id: TrajectoryId) -> bool {
        let Some(entry) = state.data.trajectories_state.get(&trajectory_id) else {
            log::warn!(
                "trajectory {trajectory_id} has not been added but modification is requested"
            );
            return true;
        };
        if entry.state == TrajectoryState::Finished {
            log::error!("trajectory {trajectory_id} has finished but modification is requested");
            panic!("modification of finished trajectory {trajectory_id}");
        }
        if entry.deletion_state != DeletionState::Normal {
            log::error!(
                "trajectory {trajectory_id} has been scheduled for deletion but modification is requested"
            );
            panic!("modification of trajectory {trajectory_id} scheduled for deletion");
        }
        if entry.state == TrajectoryState::Deleted {
            log::error!("trajectory {trajectory_id} has been deleted but modification is requested");
            panic!("modification of deleted trajectory {trajectory_id}");
        }
        true
    }

    /// Ensure the optimizer knows both insertion submaps, seeding new
    /// submap poses from the current local-to-global estimate, and
    /// return their graph ids (front first).
    fn initialize_global_submap_poses(
        &self,
        state: &mut State,
        trajectory_id: TrajectoryId,
        time: Time,
        insertion_submaps: &[Arc<Submap2D>],
    ) -> Vec<SubmapId> {
        assert!(!insertion_submaps.is_empty());
        let mut problem = self.optimization_problem.lock();
        if insertion_submaps.len() == 1 {
            if problem.submap_data().size_of_trajectory_or_zero(trajectory_id) == 0 {
                if let Some(initial) = state.data.initial_trajectory_poses.get(&trajectory_id) {
                    let to_trajectory_id = initial.to_trajectory_id;
                    state
                        .data
                        .connectivity
                        .connect(trajectory_id, to_trajectory_id, time);
                }
                let global_pose =
                    Self::compute_local_to_global_transform(&state.data, trajectory_id)
                        .compose(&insertion_submaps[0].local_pose());
                problem.add_submap(trajectory_id, global_pose);
            }
            assert_eq!(
                1,
                problem.submap_data().size_of_trajectory_or_zero(trajectory_id)
            );
            let submap_id = SubmapId::new(trajectory_id, 0);
            assert!(Arc::ptr_eq(
                &state.data.submap_data.at(submap_id).submap,
                &insertion_submaps[0]
            ));
            return vec![submap_id];
        }
        assert_eq!(2, insertion_submaps.len());
        let (last_submap_id, _) = problem
            .submap_data()
            .last_of_trajectory(trajectory_id)
            .expect("trajectory has submaps");
        if Arc::ptr_eq(
            &state.data.submap_data.at(last_submap_id).submap,
            &insertion_submaps[0],
        ) {
            // `last_submap_id` is the front submap; the back one is new.
            let first_submap_pose = problem.submap_data().at(last_submap_id).global_pose;
            let global_pose = first_submap_pose
                .compose(&insertion_submaps[0].local_pose().inverse())
                .compose(&insertion_submaps[1].local_pose());
            problem.add_submap(trajectory_id, global_pose);
            return vec![
                last_submap_id,
                SubmapId::new(trajectory_id, last_submap_id.submap_index + 1),
            ];
        }
        assert!(Arc::ptr_eq(
            &state.data.submap_data.at(last_submap_id).submap,
            &insertion_submaps[1]
        ));
        let front_submap_id = SubmapId::new(trajectory_id, last_submap_id.submap_index - 1);
        assert!(Arc::ptr_eq(
            &state.data.submap_data.at(front_submap_id).submap,
            &insertion_submaps[0]
        ));
        vec![front_submap_id, last_submap_id]
    }

    fn compute_constraints_for_node(
        self: &Arc<Self>,
        state: &mut State,
        node_id: NodeId,
        insertion_submaps: Vec<Arc<Submap2D>>,
        newly_finished_submap: bool,
    ) {
        let constant_data = Arc::clone(&state.data.trajectory_nodes.at(node_id).constant_data);
        let submap_ids = self.initialize_global_submap_poses(
            state,
            node_id.trajectory_id,
            constant_data.time,
            &insertion_submaps,
        );
        assert_eq!(submap_ids.len(), insertion_submaps.len());
        let matching_id = submap_ids[0];
        let local_pose_2d = constant_data.gravity_aligned_local_pose();
        {
            let mut problem = self.optimization_problem.lock();
            let global_pose_2d = problem
                .submap_data()
                .at(matching_id)
                .global_pose
                .compose(&insertion_submaps[0].local_pose().inverse())
                .compose(&local_pose_2d);
            problem.add_trajectory_node(
                matching_id.trajectory_id,
                NodeSpec {
                    time: constant_data.time,
                    local_pose: local_pose_2d,
                    global_pose: global_pose_2d,
                    gravity_alignment: constant_data.gravity_alignment,
                },
            );
        }

        for (i, submap_id) in submap_ids.iter().copied().enumerate() {
            // The submap may already be full, but it only flips to
            // finished in the graph further below.
            let submap_data = state.data.submap_data.at_mut(submap_id);
            assert_eq!(submap_data.state, SubmapState::Active);
            submap_data.node_ids.insert(node_id);
            let constraint_transform = insertion_submaps[i]
                .local_pose()
                .inverse()
                .compose(&local_pose_2d);
            state.data.constraints.push(Constraint::intra(
                submap_id,
                node_id,
                constraint_transform,
                self.config.matcher_translation_weight,
                self.config.matcher_rotation_weight,
            ));
        }

        let finished_submap_ids: Vec<SubmapId> = state
            .data
            .submap_data
            .iter()
            .filter(|(_, data)| data.state == SubmapState::Finished)
            .map(|(id, _)| id)
            .collect();
        for submap_id in finished_submap_ids {
            debug_assert!(!state.data.submap_data.at(submap_id).node_ids.contains(&node_id));
            self.compute_constraint(state, node_id, submap_id);
        }

        if newly_finished_submap {
            let finished_submap_id = submap_ids[0];
            let finished_submap_data = state.data.submap_data.at_mut(finished_submap_id);
            assert_eq!(finished_submap_data.state, SubmapState::Active);
            finished_submap_data.state = SubmapState::Finished;
            // A new completed submap: look for constraints against old
            // nodes.
            self.compute_constraints_for_old_nodes(state, finished_submap_id);
        }
        self.constraint_builder.notify_end_of_node();
        state.num_nodes_since_last_loop_closure += 1;
        debug_assert!(!state.run_loop_closure);
        if self.config.optimize_every_n_nodes > 0
            && state.num_nodes_since_last_loop_closure > self.config.optimize_every_n_nodes
        {
            self.dispatch_optimization(state);
        }
    }

    /// Schedule a loop-closure search between one node and one finished
    /// submap: a windowed match when they share a trajectory or were
    /// recently connected, otherwise a sampled full-submap match.
    fn compute_constraint(&self, state: &mut State, node_id: NodeId, submap_id: SubmapId) {
        assert_eq!(
            state.data.submap_data.at(submap_id).state,
            SubmapState::Finished
        );
        let node_time = Self::latest_node_time(&state.data, node_id, submap_id);
        let last_connection_time = state
            .data
            .connectivity
            .last_connection_time(node_id.trajectory_id, submap_id.trajectory_id);
        let submap = Arc::clone(&state.data.submap_data.at(submap_id).submap);
        let node_data = Arc::clone(&state.data.trajectory_nodes.at(node_id).constant_data);

        if node_id.trajectory_id == submap_id.trajectory_id
            || node_time
                < last_connection_time.add_seconds(self.config.global_constraint_search_after_secs)
        {
            // Same trajectory, or recently tied to the submap's
            // trajectory: a local search window suffices.
            let initial_relative_pose = {
                let problem = self.optimization_problem.lock();
                problem
                    .submap_data()
                    .at(submap_id)
                    .global_pose
                    .inverse()
                    .compose(&problem.node_data().at(node_id).global_pose)
            };
            self.constraint_builder.maybe_add_constraint(
                submap_id,
                &submap,
                node_id,
                &node_data,
                initial_relative_pose,
            );
        } else if state
            .global_localization_samplers
            .get_mut(&node_id.trajectory_id)
            .expect("sampler exists for known trajectory")
            .pulse()
        {
            self.constraint_builder
                .maybe_add_global_constraint(submap_id, &submap, node_id, &node_data);
        }
    }

    fn compute_constraints_for_old_nodes(
        &self,
        state: &mut State,
        submap_id: SubmapId,
    ) {
        let node_ids: Vec<NodeId> = {
            let problem = self.optimization_problem.lock();
            problem.node_data().iter().map(|(id, _)| id).collect()
        };
        for node_id in node_ids {
            if !state.data.submap_data.at(submap_id).node_ids.contains(&node_id) {
                self.compute_constraint(state, node_id, submap_id);
            }
        }
    }

    fn latest_node_time(data: &PoseGraphData, node_id: NodeId, submap_id: SubmapId) -> Time {
        let mut time = data.trajectory_nodes.at(node_id).constant_data.time;
        let submap_data = data.submap_data.at(submap_id);
        if let Some(last_submap_node_id) = submap_data.node_ids.iter().next_back() {
            time = time.max(
                data.trajectory_nodes
                    .at(*last_submap_node_id)
                    .constant_data
                    .time,
            );
        }
        time
    }

    fn update_trajectory_connectivity(data: &mut PoseGraphData, constraint: &Constraint) {
        assert_eq!(constraint.tag, ConstraintTag::InterSubmap);
        let time = Self::latest_node_time(data, constraint.node_id, constraint.submap_id);
        data.connectivity.connect(
            constraint.node_id.trajectory_id,
            constraint.submap_id.trajectory_id,
            time,
        );
    }

    // ------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------

    fn run_optimization(self: &Arc<Self>) {
        let (constraints, frozen_trajectories, landmark_nodes) = {
            let state = self.state.lock();
            if self.optimization_problem.lock().submap_data().is_empty() {
                return;
            }
            let frozen: BTreeSet<TrajectoryId> = state
                .data
                .trajectories_state
                .iter()
                .filter(|(_, entry)| entry.state == TrajectoryState::Frozen)
                .map(|(&id, _)| id)
                .collect();
            (
                state.data.constraints.clone(),
                frozen,
                state.data.landmark_nodes.clone(),
            )
        };

        // Solve without the state lock so front-end writes keep flowing;
        // queued mode guarantees nobody else touches the problem.
        let mut problem = self.optimization_problem.lock();
        problem.solve(&constraints, &frozen_trajectories, &landmark_nodes);
        let submap_data = problem.submap_data().clone();
        let node_data = problem.node_data().clone();
        let landmark_data = problem.landmark_data().clone();
        drop(problem);

        let mut state = self.state.lock();
        for trajectory_id in node_data.trajectory_ids() {
            for (node_id, spec) in node_data.trajectory(trajectory_id) {
                state.data.trajectory_nodes.at_mut(node_id).global_pose = spec
                    .global_pose
                    .compose(&Pose2D::rotation(spec.gravity_alignment));
            }

            // Extrapolate nodes not yet in the optimization problem
            // through the shift of the local-to-global transform.
            let local_to_new_global =
                Self::local_to_global_from(&state.data, &submap_data, trajectory_id);
            let local_to_old_global = Self::compute_local_to_global_transform(
                &state.data,
                trajectory_id,
            );
            let old_global_to_new_global =
                local_to_new_global.compose(&local_to_old_global.inverse());

            let last_optimized_node_index = node_data
                .last_of_trajectory(trajectory_id)
                .expect("trajectory has nodes")
                .0
                .node_index;
            let tail: Vec<NodeId> = state
                .data
                .trajectory_nodes
                .trajectory(trajectory_id)
                .filter(|(id, _)| id.node_index > last_optimized_node_index)
                .map(|(id, _)| id)
                .collect();
            for node_id in tail {
                let node = state.data.trajectory_nodes.at_mut(node_id);
                node.global_pose = old_global_to_new_global.compose(&node.global_pose);
            }
        }
        for (landmark_id, pose) in landmark_data {
            state
                .data
                .landmark_nodes
                .entry(landmark_id)
                .or_default()
                .global_pose = Some(pose);
        }
        state.data.global_submap_poses = submap_data;
    }

    /// Local-to-global derived from a given set of submap poses.
    fn local_to_global_from(
        data: &PoseGraphData,
        global_submap_poses: &MapById<SubmapId, SubmapSpec>,
        trajectory_id: TrajectoryId,
    ) -> Pose2D {
        match global_submap_poses.last_of_trajectory(trajectory_id) {
            Some((last_id, spec)) => spec
                .global_pose
                .compose(&data.submap_data.at(last_id).submap.local_pose().inverse()),
            None => match data.initial_trajectory_poses.get(&trajectory_id) {
                Some(initial) => Self::interpolated_global_trajectory_pose(
                    data,
                    initial.to_trajectory_id,
                    initial.time,
                )
                .compose(&initial.relative_pose),
                None => Pose2D::identity(),
            },
        }
    }

    fn compute_local_to_global_transform(
        data: &PoseGraphData,
        trajectory_id: TrajectoryId,
    ) -> Pose2D {
        Self::local_to_global_from(data, &data.global_submap_poses, trajectory_id)
    }

    fn interpolated_global_trajectory_pose(
        data: &PoseGraphData,
        trajectory_id: TrajectoryId,
        time: Time,
    ) -> Pose2D {
        assert!(data.trajectory_nodes.size_of_trajectory_or_zero(trajectory_id) > 0);
        let Some((upper_id, upper)) = data.trajectory_nodes.lower_bound(trajectory_id, time)
        else {
            return data
                .trajectory_nodes
                .last_of_trajectory(trajectory_id)
                .expect("non-empty")
                .1
                .global_pose;
        };
        // Predecessor within the trajectory; indices may have gaps after
        // trimming.
        let lower = data
            .trajectory_nodes
            .trajectory(trajectory_id)
            .take_while(|(id, _)| id.node_index < upper_id.node_index)
            .last();
        let Some((_, lower)) = lower else {
            return upper.global_pose;
        };
        interpolate(
            &TimestampedPose {
                time: lower.constant_data.time,
                pose: lower.global_pose,
            },
            &TimestampedPose {
                time: upper.constant_data.time,
                pose: upper.global_pose,
            },
            time.max(lower.constant_data.time),
        )
    }

    // ------------------------------------------------------------------
    // Sensor and landmark data
    // ------------------------------------------------------------------

    fn add_sensor_data(
        self: &Arc<Self>,
        trajectory_id: TrajectoryId,
        apply: impl FnOnce(&mut OptimizationProblem) + Send + 'static,
    ) {
        let mut state = self.state.lock();
        if !Self::can_add_work_item_modifying(&mut state, trajectory_id) {
            return;
        }
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::OptimizationData,
                Box::new(move |graph, _state| {
                    apply(&mut graph.optimization_problem.lock());
                }),
            ),
        );
    }

    fn add_landmark_data(self: &Arc<Self>, trajectory_id: TrajectoryId, landmark_data: LandmarkData) {
        let mut state = self.state.lock();
        if !Self::can_add_work_item_modifying(&mut state, trajectory_id) {
            return;
        }
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::OptimizationData,
                Box::new(move |_graph, state| {
                    for (landmark_id, landmark_to_tracking, translation_weight, rotation_weight) in
                        landmark_data.observations
                    {
                        state
                            .data
                            .landmark_nodes
                            .entry(landmark_id)
                            .or_default()
                            .observations
                            .push(LandmarkObservation {
                                trajectory_id,
                                time: landmark_data.time,
                                landmark_to_tracking,
                                translation_weight,
                                rotation_weight,
                            });
                    }
                }),
            ),
        );
    }

    fn set_landmark_pose(self: &Arc<Self>, landmark_id: &str, global_pose: Pose2D) {
        let landmark_id = landmark_id.to_owned();
        let mut state = self.state.lock();
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::OptimizationData,
                Box::new(move |_graph, state| {
                    state
                        .data
                        .landmark_nodes
                        .entry(landmark_id)
                        .or_default()
                        .global_pose = Some(global_pose);
                }),
            ),
        );
    }

    // ------------------------------------------------------------------
    // Deserialization inputs
    // ------------------------------------------------------------------

    fn add_submap_from_proto(
        self: &Arc<Self>,
        global_pose: Pose2D,
        submap_id: SubmapId,
        submap: Arc<Submap2D>,
    ) {
        let mut state = self.state.lock();
        self.add_trajectory_if_needed(&mut state, submap_id.trajectory_id);
        if !Self::can_add_work_item_modifying(&mut state, submap_id.trajectory_id) {
            return;
        }
        state.data.submap_data.insert(
            submap_id,
            InternalSubmapData {
                submap,
                state: SubmapState::Active,
                node_ids: BTreeSet::new(),
            },
        );
        // Show the submap at its global pose right away.
        state
            .data
            .global_submap_poses
            .insert(submap_id, SubmapSpec { global_pose });
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::DeserializedData,
                Box::new(move |graph, state| {
                    state.data.submap_data.at_mut(submap_id).state = SubmapState::Finished;
                    graph
                        .optimization_problem
                        .lock()
                        .insert_submap(submap_id, global_pose);
                }),
            ),
        );
    }

    fn add_node_from_proto(self: &Arc<Self>, global_pose: Pose2D, node: NodeFromProto) {
        let NodeFromProto {
            node_id,
            constant_data,
        } = node;
        let mut state = self.state.lock();
        self.add_trajectory_if_needed(&mut state, node_id.trajectory_id);
        if !Self::can_add_work_item_modifying(&mut state, node_id.trajectory_id) {
            return;
        }
        state.data.trajectory_nodes.insert(
            node_id,
            TrajectoryNode {
                constant_data: Arc::clone(&constant_data),
                global_pose,
            },
        );
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::DeserializedData,
                Box::new(move |graph, state| {
                    let constant_data = &state.data.trajectory_nodes.at(node_id).constant_data;
                    let gravity_inverse = Pose2D::rotation(-constant_data.gravity_alignment);
                    graph.optimization_problem.lock().insert_trajectory_node(
                        node_id,
                        NodeSpec {
                            time: constant_data.time,
                            local_pose: constant_data.local_pose.compose(&gravity_inverse),
                            global_pose: global_pose.compose(&gravity_inverse),
                            gravity_alignment: constant_data.gravity_alignment,
                        },
                    );
                }),
            ),
        );
    }

    fn add_serialized_constraints(self: &Arc<Self>, constraints: Vec<Constraint>) {
        let mut state = self.state.lock();
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::DeserializedData,
                Box::new(move |_graph, state| {
                    let count = constraints.len();
                    for constraint in constraints {
                        assert!(state.data.trajectory_nodes.contains(constraint.node_id));
                        assert!(state.data.submap_data.contains(constraint.submap_id));
                        match constraint.tag {
                            ConstraintTag::IntraSubmap => {
                                assert!(state
                                    .data
                                    .submap_data
                                    .at_mut(constraint.submap_id)
                                    .node_ids
                                    .insert(constraint.node_id));
                            }
                            ConstraintTag::InterSubmap => {
                                Self::update_trajectory_connectivity(&mut state.data, &constraint);
                            }
                        }
                        let gravity = state
                            .data
                            .trajectory_nodes
                            .at(constraint.node_id)
                            .constant_data
                            .gravity_alignment;
                        state.data.constraints.push(Constraint {
                            pose: ConstraintPose {
                                relative_pose: constraint
                                    .pose
                                    .relative_pose
                                    .compose(&Pose2D::rotation(-gravity)),
                                ..constraint.pose
                            },
                            ..constraint
                        });
                    }
                    log::info!("loaded {count} constraints");
                }),
            ),
        );
    }

    fn add_node_to_submap(self: &Arc<Self>, node_id: NodeId, submap_id: SubmapId) {
        let mut state = self.state.lock();
        if !Self::can_add_work_item_modifying(&mut state, submap_id.trajectory_id) {
            return;
        }
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::DeserializedData,
                Box::new(move |_graph, state| {
                    state
                        .data
                        .submap_data
                        .at_mut(submap_id)
                        .node_ids
                        .insert(node_id);
                }),
            ),
        );
    }

    // ------------------------------------------------------------------
    // Trajectory lifecycle
    // ------------------------------------------------------------------

    fn finish_trajectory(self: &Arc<Self>, trajectory_id: TrajectoryId) {
        let mut state = self.state.lock();
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::ChangeTrajectoryState,
                Box::new(move |graph, state| {
                    assert!(!Self::is_trajectory_finished(state, trajectory_id));
                    state
                        .data
                        .trajectories_state
                        .entry(trajectory_id)
                        .or_default()
                        .state = TrajectoryState::Finished;

                    let submap_ids: Vec<SubmapId> = state
                        .data
                        .submap_data
                        .trajectory(trajectory_id)
                        .map(|(id, _)| id)
                        .collect();
                    for submap_id in submap_ids {
                        state.data.submap_data.at_mut(submap_id).state = SubmapState::Finished;
                    }
                    debug_assert!(!state.run_loop_closure);
                    graph.dispatch_optimization(state);
                }),
            ),
        );
    }

    fn is_trajectory_finished(state: &State, trajectory_id: TrajectoryId) -> bool {
        state
            .data
            .trajectories_state
            .get(&trajectory_id)
            .map_or(false, |entry| entry.state == TrajectoryState::Finished)
    }

    fn freeze_trajectory(self: &Arc<Self>, trajectory_id: TrajectoryId) {
        let mut state = self.state.lock();
        state.data.connectivity.add(trajectory_id);
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::ChangeTrajectoryState,
                Box::new(move |_graph, state| {
                    assert!(!Self::is_trajectory_frozen(state, trajectory_id));
                    state
                        .data
                        .trajectories_state
                        .entry(trajectory_id)
                        .or_default()
                        .state = TrajectoryState::Frozen;
                }),
            ),
        );
    }

    fn is_trajectory_frozen(state: &State, trajectory_id: TrajectoryId) -> bool {
        state
            .data
            .trajectories_state
            .get(&trajectory_id)
            .map_or(false, |entry| entry.state == TrajectoryState::Frozen)
    }

    fn delete_trajectory(self: &Arc<Self>, trajectory_id: TrajectoryId) {
        let mut state = self.state.lock();
        let entry = state
            .data
            .trajectories_state
            .get_mut(&trajectory_id)
            .unwrap_or_else(|| panic!("delete of unknown trajectory {trajectory_id}"));
        entry.deletion_state = DeletionState::ScheduledForDeletion;
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::ChangeTrajectoryState,
                Box::new(move |_graph, state| {
                    let entry = state
                        .data
                        .trajectories_state
                        .get_mut(&trajectory_id)
                        .expect("scheduled trajectory exists");
                    assert!(entry.state != TrajectoryState::Active);
                    assert!(entry.state != TrajectoryState::Deleted);
                    assert_eq!(entry.deletion_state, DeletionState::ScheduledForDeletion);
                    entry.deletion_state = DeletionState::WaitForDeletion;
                }),
            ),
        );
    }

    fn delete_trajectories_if_needed(self: &Arc<Self>, state: &mut State) {
        let waiting: Vec<TrajectoryId> = state
            .data
            .trajectories_state
            .iter()
            .filter(|(_, entry)| entry.deletion_state == DeletionState::WaitForDeletion)
            .map(|(&id, _)| id)
            .collect();
        for trajectory_id in waiting {
            let submap_ids: Vec<SubmapId> = state
                .data
                .submap_data
                .trajectory(trajectory_id)
                .map(|(id, _)| id)
                .collect();
            for submap_id in submap_ids {
                self.trim_submap(state, submap_id);
            }
            let entry = state
                .data
                .trajectories_state
                .get_mut(&trajectory_id)
                .expect("waiting trajectory exists");
            entry.state = TrajectoryState::Deleted;
            entry.deletion_state = DeletionState::Normal;
            log::info!("deleted trajectory {trajectory_id}");
        }
    }

    // ------------------------------------------------------------------
    // Trimming
    // ------------------------------------------------------------------

    fn add_trimmer(self: &Arc<Self>, trimmer: Box<dyn PoseGraphTrimmer>) {
        let mut state = self.state.lock();
        self.add_work_item(
            &mut state,
            WorkItem::new(
                WorkItemKind::Other,
                Box::new(move |_graph, state| {
                    state.trimmers.push(trimmer);
                }),
            ),
        );
    }

    fn run_trimmers(self: &Arc<Self>, state: &mut State) {
        let mut trimmers = std::mem::take(&mut state.trimmers);
        for trimmer in &mut trimmers {
            let mut handle = TrimmingHandle {
                graph: self,
                state: &mut *state,
            };
            trimmer.trim(&mut handle);
        }
        trimmers.retain(|trimmer| !trimmer.is_finished());
        state.trimmers = trimmers;
    }

    /// Remove one finished submap, its constraints, and the nodes left
    /// without an intra-submap constraint. Atomic under the state lock.
    fn trim_submap(self: &Arc<Self>, state: &mut State, submap_id: SubmapId) {
        assert_eq!(
            state.data.submap_data.at(submap_id).state,
            SubmapState::Finished
        );

        // Nodes that stay intra-submap constrained once the submap is
        // gone.
        let mut nodes_to_retain: BTreeSet<NodeId> = BTreeSet::new();
        for constraint in &state.data.constraints {
            if constraint.tag == ConstraintTag::IntraSubmap && constraint.submap_id != submap_id {
                nodes_to_retain.insert(constraint.node_id);
            }
        }

        let mut nodes_to_remove: BTreeSet<NodeId> = BTreeSet::new();
        state.data.constraints.retain(|constraint| {
            if constraint.submap_id == submap_id {
                if constraint.tag == ConstraintTag::IntraSubmap
                    && !nodes_to_retain.contains(&constraint.node_id)
                {
                    nodes_to_remove.insert(constraint.node_id);
                }
                false
            } else {
                true
            }
        });
        state
            .data
            .constraints
            .retain(|constraint| !nodes_to_remove.contains(&constraint.node_id));

        state.data.submap_data.trim(submap_id);
        self.constraint_builder.delete_scan_matcher(submap_id);
        self.optimization_problem.lock().trim_submap(submap_id);
        if state.data.global_submap_poses.contains(submap_id) {
            state.data.global_submap_poses.trim(submap_id);
        }

        for node_id in nodes_to_remove {
            state.data.trajectory_nodes.trim(node_id);
            self.optimization_problem.lock().trim_trajectory_node(node_id);
        }
    }

    // ------------------------------------------------------------------
    // Final optimization
    // ------------------------------------------------------------------

    fn run_final_optimization(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            let final_iterations = self.config.max_num_final_iterations;
            self.add_work_item(
                &mut state,
                WorkItem::new(
                    WorkItemKind::OptimizationData,
                    Box::new(move |graph, state| {
                        graph
                            .optimization_problem
                            .lock()
                            .set_max_num_iterations(final_iterations);
                        graph.dispatch_optimization(state);
                    }),
                ),
            );
            let steady_iterations = self.config.optimization.max_num_iterations;
            self.add_work_item(
                &mut state,
                WorkItem::new(
                    WorkItemKind::OptimizationData,
                    Box::new(move |graph, _state| {
                        graph
                            .optimization_problem
                            .lock()
                            .set_max_num_iterations(steady_iterations);
                    }),
                ),
            );
        }
        self.wait_for_all_computations();
    }

    // ------------------------------------------------------------------
    // Snapshot helpers
    // ------------------------------------------------------------------

    fn submap_data_under_lock(data: &PoseGraphData, submap_id: SubmapId) -> Option<SubmapData> {
        let internal = data.submap_data.get(submap_id)?;
        let pose = match data.global_submap_poses.get(submap_id) {
            // Already optimized.
            Some(spec) => spec.global_pose,
            // Not optimized yet: extrapolate.
            None => Self::compute_local_to_global_transform(data, submap_id.trajectory_id)
                .compose(&internal.submap.local_pose()),
        };
        Some(SubmapData {
            submap: Arc::clone(&internal.submap),
            pose,
        })
    }

    fn all_submap_data_under_lock(data: &PoseGraphData) -> MapById<SubmapId, SubmapData> {
        let mut submaps = MapById::new();
        for (id, _) in data.submap_data.iter() {
            submaps.insert(id, Self::submap_data_under_lock(data, id).expect("iterated id"));
        }
        submaps
    }
}

/// Short-lived trimming capability handed to trimmers; see
/// [`Trimmable`].
struct TrimmingHandle<'a> {
    graph: &'a Arc<Shared>,
    state: &'a mut State,
}

impl Trimmable for TrimmingHandle<'_> {
    fn num_submaps(&self, trajectory_id: TrajectoryId) -> usize {
        self.graph
            .optimization_problem
            .lock()
            .submap_data()
            .size_of_trajectory_or_zero(trajectory_id)
    }

    fn get_submap_ids(&self, trajectory_id: TrajectoryId) -> Vec<SubmapId> {
        self.graph
            .optimization_problem
            .lock()
            .submap_data()
            .trajectory(trajectory_id)
            .map(|(id, _)| id)
            .collect()
    }

    fn get_optimized_submap_data(&self) -> MapById<SubmapId, SubmapData> {
        let mut submaps = MapById::new();
        for (id, internal) in self.state.data.submap_data.iter() {
            if internal.state != SubmapState::Finished {
                continue;
            }
            let Some(spec) = self.state.data.global_submap_poses.get(id) else {
                continue;
            };
            submaps.insert(
                id,
                SubmapData {
                    submap: Arc::clone(&internal.submap),
                    pose: spec.global_pose,
                },
            );
        }
        submaps
    }

    fn get_trajectory_nodes(&self) -> MapById<NodeId, TrajectoryNode> {
        self.state.data.trajectory_nodes.clone()
    }

    fn get_constraints(&self) -> Vec<Constraint> {
        self.state.data.constraints.clone()
    }

    fn is_finished_trajectory(&self, trajectory_id: TrajectoryId) -> bool {
        Shared::is_trajectory_finished(self.state, trajectory_id)
    }

    fn trim_submap(&mut self, submap_id: SubmapId) {
        self.graph.trim_submap(self.state, submap_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Point2D;
    use crate::sensor::PointCloud2D;

    fn test_graph(optimize_every_n_nodes: usize) -> PoseGraph {
        let config = PoseGraphConfig {
            optimize_every_n_nodes,
            ..Default::default()
        };
        PoseGraph::new(config, Arc::new(ThreadPool::new(4)))
    }

    fn node_data(time_micros: i64) -> Arc<NodeData> {
        Arc::new(NodeData {
            time: Time(time_micros),
            local_pose: Pose2D::identity(),
            gravity_alignment: 0.0,
            point_cloud: PointCloud2D::from_points(vec![Point2D::new(1.0, 0.0)]),
        })
    }

    fn fresh_submap() -> Arc<Submap2D> {
        Arc::new(Submap2D::new(
            Pose2D::identity(),
            crate::grid::ProbabilityGrid::centered(0.05, Point2D::new(0.0, 0.0), 50),
        ))
    }

    #[test]
    fn test_add_node_registers_submap_and_constraint() {
        let graph = test_graph(0);
        let submap = fresh_submap();

        let node_id = graph.add_node(node_data(0), 0, &[Arc::clone(&submap)]);
        graph.wait_for_all_computations();

        assert_eq!(node_id, NodeId::new(0, 0));
        assert_eq!(graph.get_trajectory_nodes().len(), 1);
        let submap_data = graph.get_all_submap_data();
        assert_eq!(submap_data.len(), 1);
        // The intra-submap constraint is synchronous.
        let constraints = graph.constraints();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].tag, ConstraintTag::IntraSubmap);
        assert_eq!(constraints[0].node_id, node_id);
    }

    #[test]
    fn test_nodes_appended_in_order() {
        let graph = test_graph(0);
        let submap = fresh_submap();
        for i in 0..5 {
            let id = graph.add_node(node_data(i), 0, &[Arc::clone(&submap)]);
            assert_eq!(id, NodeId::new(0, i as u32));
        }
        graph.wait_for_all_computations();
    }

    #[test]
    fn test_initial_trajectory_pose_seeds_transform() {
        let graph = test_graph(0);
        let submap = fresh_submap();
        graph.add_node(node_data(0), 0, &[Arc::clone(&submap)]);
        graph.wait_for_all_computations();

        graph.set_initial_trajectory_pose(1, 0, Pose2D::new(5.0, 0.0, 0.0), Time(0));
        let transform = graph.get_local_to_global_transform(1);
        approx::assert_relative_eq!(transform.x, 5.0);
    }

    #[test]
    fn test_frozen_trajectory_query() {
        let graph = test_graph(0);
        let submap = fresh_submap();
        graph.add_node(node_data(0), 0, &[submap]);
        assert!(!graph.is_trajectory_frozen(0));
        graph.freeze_trajectory(0);
        graph.wait_for_all_computations();
        assert!(graph.is_trajectory_frozen(0));
    }

    #[test]
    #[should_panic(expected = "not implemented for 2D")]
    fn test_add_fixed_frame_pose_data_is_fatal() {
        let graph = test_graph(0);
        graph.add_fixed_frame_pose_data(0);
    }
}
