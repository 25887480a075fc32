//! Asynchronous loop-closure constraint search.
//!
//! The pose graph submits candidate submap/node pairs; the builder fans
//! scan-match jobs out to the shared thread pool and collects the
//! resulting inter-submap constraints. `notify_end_of_node` closes a
//! node's batch of jobs, and `when_done` registers a one-shot barrier
//! callback that fires once every job of every closed batch has
//! settled.
//!
//! The internal lock covers the pending-result buffer, the per-node job
//! accounting, the scan-matcher cache, and the `when_done` registration.
//! Scan matching itself runs without the lock, and callbacks are
//! dispatched as pool jobs, never invoked with the lock held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::ConstraintBuilderConfig;
use crate::core::{NodeId, Pose2D, SubmapId};
use crate::matching::FastCorrelativeScanMatcher;
use crate::submap::Submap2D;
use crate::utils::{FixedRatioSampler, ThreadPool};

use super::constraint::Constraint;
use super::NodeData;

type WhenDoneCallback = Box<dyn FnOnce(Vec<Constraint>) + Send + 'static>;

/// Lazily built per-submap scan matcher, shared by every job matching
/// against that submap. Building the lookup tables is the expensive
/// part; `OnceLock` makes the first job build while later ones block on
/// the same slot.
struct SubmapScanMatcher {
    submap: Arc<Submap2D>,
    matcher: OnceLock<FastCorrelativeScanMatcher>,
}

impl SubmapScanMatcher {
    fn get(&self, config: &ConstraintBuilderConfig) -> &FastCorrelativeScanMatcher {
        self.matcher
            .get_or_init(|| FastCorrelativeScanMatcher::new(&self.submap.grid(), config.clone()))
    }
}

struct Inner {
    sampler: FixedRatioSampler,
    /// Reserved result slots for in-flight jobs of the current
    /// generation; `None` until the job lands (or forever, on a miss).
    constraints: Vec<Option<Constraint>>,
    /// Bumped whenever the buffer is handed to a callback, so stale job
    /// completions from a drained generation are discarded.
    generation: u64,
    when_done: Option<WhenDoneCallback>,
    /// Batches closed by `notify_end_of_node` so far.
    num_started_nodes: usize,
    /// Closed batches that still have jobs in flight.
    num_pending_closed_batches: usize,
    /// In-flight job count per node ordinal (open or closed).
    pending_jobs: BTreeMap<usize, usize>,
    scan_matchers: HashMap<SubmapId, Arc<SubmapScanMatcher>>,
}

impl Inner {
    fn num_finished_nodes(&self) -> usize {
        self.num_started_nodes - self.num_pending_closed_batches
    }
}

/// Schedules scan-match jobs and coalesces their constraints.
pub struct ConstraintBuilder {
    config: ConstraintBuilderConfig,
    thread_pool: Arc<ThreadPool>,
    inner: Arc<Mutex<Inner>>,
}

impl ConstraintBuilder {
    pub fn new(config: ConstraintBuilderConfig, thread_pool: Arc<ThreadPool>) -> Self {
        let sampler = FixedRatioSampler::new(config.sampling_ratio);
        Self {
            config,
            thread_pool,
            inner: Arc::new(Mutex::new(Inner {
                sampler,
                constraints: Vec::new(),
                generation: 0,
                when_done: None,
                num_started_nodes: 0,
                num_pending_closed_batches: 0,
                pending_jobs: BTreeMap::new(),
                scan_matchers: HashMap::new(),
            })),
        }
    }

    /// Maybe schedule a windowed match of `node_data` against `submap`,
    /// seeded at `initial_relative_pose` (node pose in the submap
    /// frame). Candidates are sampled by the configured ratio.
    pub fn maybe_add_constraint(
        &self,
        submap_id: SubmapId,
        submap: &Arc<Submap2D>,
        node_id: NodeId,
        node_data: &Arc<NodeData>,
        initial_relative_pose: Pose2D,
    ) {
        let mut inner = self.inner.lock();
        if !inner.sampler.pulse() {
            return;
        }
        self.schedule_job(
            &mut inner,
            submap_id,
            submap,
            node_id,
            node_data,
            Some(initial_relative_pose),
        );
    }

    /// Schedule a full-submap match, used across trajectories when no
    /// usable relative pose estimate exists. Never sampled out.
    pub fn maybe_add_global_constraint(
        &self,
        submap_id: SubmapId,
        submap: &Arc<Submap2D>,
        node_id: NodeId,
        node_data: &Arc<NodeData>,
    ) {
        let mut inner = self.inner.lock();
        self.schedule_job(&mut inner, submap_id, submap, node_id, node_data, None);
    }

    fn schedule_job(
        &self,
        inner: &mut Inner,
        submap_id: SubmapId,
        submap: &Arc<Submap2D>,
        node_id: NodeId,
        node_data: &Arc<NodeData>,
        initial_relative_pose: Option<Pose2D>,
    ) {
        let slot = inner.constraints.len();
        inner.constraints.push(None);
        let generation = inner.generation;
        let ordinal = inner.num_started_nodes;
        *inner.pending_jobs.entry(ordinal).or_insert(0) += 1;

        let matcher_slot = inner
            .scan_matchers
            .entry(submap_id)
            .or_insert_with(|| {
                Arc::new(SubmapScanMatcher {
                    submap: Arc::clone(submap),
                    matcher: OnceLock::new(),
                })
            })
            .clone();

        let config = self.config.clone();
        let shared = Arc::clone(&self.inner);
        let pool = Arc::clone(&self.thread_pool);
        let node_data = Arc::clone(node_data);
        self.thread_pool.spawn(move || {
            let constraint = compute_constraint(
                &config,
                &matcher_slot,
                submap_id,
                node_id,
                &node_data,
                initial_relative_pose,
            );
            let mut inner = shared.lock();
            if inner.generation == generation {
                inner.constraints[slot] = constraint;
            }
            complete_job(&mut inner, &pool, ordinal);
        });
    }

    /// Close the current node's batch of jobs.
    pub fn notify_end_of_node(&self) {
        let mut inner = self.inner.lock();
        let ordinal = inner.num_started_nodes;
        inner.num_started_nodes += 1;
        if inner.pending_jobs.contains_key(&ordinal) {
            inner.num_pending_closed_batches += 1;
        }
        maybe_fire_when_done(&mut inner, &self.thread_pool);
    }

    /// Register the one-shot barrier callback. At most one may be
    /// pending; it fires (on a pool thread) once every closed batch has
    /// drained, immediately if that is already the case.
    pub fn when_done(&self, callback: impl FnOnce(Vec<Constraint>) + Send + 'static) {
        let mut inner = self.inner.lock();
        assert!(
            inner.when_done.is_none(),
            "when_done callback already pending"
        );
        inner.when_done = Some(Box::new(callback));
        maybe_fire_when_done(&mut inner, &self.thread_pool);
    }

    /// Number of nodes whose match batch has fully drained. Monotone.
    pub fn get_num_finished_nodes(&self) -> usize {
        self.inner.lock().num_finished_nodes()
    }

    /// Drop the cached scan matcher of a trimmed submap.
    pub fn delete_scan_matcher(&self, submap_id: SubmapId) {
        self.inner.lock().scan_matchers.remove(&submap_id);
    }
}

/// Runs on a pool thread: build/reuse the matcher, match, and gate on
/// the score threshold.
fn compute_constraint(
    config: &ConstraintBuilderConfig,
    matcher_slot: &SubmapScanMatcher,
    submap_id: SubmapId,
    node_id: NodeId,
    node_data: &NodeData,
    initial_relative_pose: Option<Pose2D>,
) -> Option<Constraint> {
    let matcher = matcher_slot.get(config);
    let (result, min_score) = match initial_relative_pose {
        Some(initial) => (
            matcher.match_local(initial, &node_data.point_cloud)?,
            config.min_score,
        ),
        None => (
            matcher.match_full_submap(&node_data.point_cloud)?,
            config.global_localization_min_score,
        ),
    };
    if result.score < min_score {
        return None;
    }
    if initial_relative_pose.is_none() {
        log::info!(
            "global localization: {} matched against {} with score {:.3}",
            node_id,
            submap_id,
            result.score
        );
    }
    Some(Constraint::inter(
        submap_id,
        node_id,
        result.pose,
        config.loop_closure_translation_weight,
        config.loop_closure_rotation_weight,
    ))
}

fn complete_job(inner: &mut Inner, pool: &Arc<ThreadPool>, ordinal: usize) {
    let drained = {
        let count = inner
            .pending_jobs
            .get_mut(&ordinal)
            .expect("completion for unknown batch");
        *count -= 1;
        *count == 0
    };
    if drained {
        inner.pending_jobs.remove(&ordinal);
        if ordinal < inner.num_started_nodes {
            inner.num_pending_closed_batches -= 1;
        }
    }
    maybe_fire_when_done(inner, pool);
}

fn maybe_fire_when_done(inner: &mut Inner, pool: &Arc<ThreadPool>) {
    if inner.when_done.is_none() || inner.num_pending_closed_batches > 0 {
        return;
    }
    let callback = inner.when_done.take().expect("checked above");
    let results: Vec<Constraint> = inner.constraints.drain(..).flatten().collect();
    inner.generation += 1;
    // The callback re-enters the pose graph; run it off-lock on a
    // worker.
    pool.spawn(move || callback(results));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Point2D, Time};
    use crate::grid::inserter::{range_data_from_returns, RangeDataInserter};
    use crate::grid::ProbabilityGrid;
    use crate::sensor::PointCloud2D;
    use std::sync::mpsc;
    use std::time::Duration;

    fn accept_all_config() -> ConstraintBuilderConfig {
        ConstraintBuilderConfig {
            sampling_ratio: 1.0,
            min_score: 0.0,
            global_localization_min_score: 0.0,
            search_window_linear: 0.2,
            search_window_angular: 0.1,
            linear_resolution: 0.05,
            angular_resolution: 0.05,
            ..Default::default()
        }
    }

    fn wall_cloud() -> PointCloud2D {
        PointCloud2D::from_points(
            (0..40)
                .map(|i| Point2D::new(1.0, -1.0 + i as f64 * 0.05))
                .collect(),
        )
    }

    fn finished_submap(cloud: &PointCloud2D) -> Arc<Submap2D> {
        let submap = Submap2D::new(
            Pose2D::identity(),
            ProbabilityGrid::centered(0.05, Point2D::new(0.0, 0.0), 100),
        );
        let inserter = RangeDataInserter::new();
        let data = range_data_from_returns(Point2D::new(0.0, 0.0), cloud.points.clone());
        submap.insert_range_data(&data, &inserter);
        submap.insert_range_data(&data, &inserter);
        let submap = Arc::new(submap);
        submap.finish();
        submap
    }

    fn node(cloud: PointCloud2D) -> Arc<NodeData> {
        Arc::new(NodeData {
            time: Time(0),
            local_pose: Pose2D::identity(),
            gravity_alignment: 0.0,
            point_cloud: cloud,
        })
    }

    // Two local matches plus one global match, then the barrier: the
    // callback fires exactly once with three constraints and the
    // finished-node counter advances by one.
    #[test]
    fn test_barrier_fires_once_with_all_results() {
        let pool = Arc::new(ThreadPool::new(4));
        let builder = ConstraintBuilder::new(accept_all_config(), Arc::clone(&pool));
        let cloud = wall_cloud();
        let submap = finished_submap(&cloud);
        let node_data = node(cloud);

        assert_eq!(builder.get_num_finished_nodes(), 0);
        builder.maybe_add_constraint(
            SubmapId::new(0, 0),
            &submap,
            NodeId::new(0, 0),
            &node_data,
            Pose2D::identity(),
        );
        builder.maybe_add_constraint(
            SubmapId::new(0, 1),
            &submap,
            NodeId::new(0, 0),
            &node_data,
            Pose2D::identity(),
        );
        builder.maybe_add_global_constraint(
            SubmapId::new(1, 0),
            &submap,
            NodeId::new(0, 0),
            &node_data,
        );
        builder.notify_end_of_node();

        let (tx, rx) = mpsc::channel();
        builder.when_done(move |constraints| {
            tx.send(constraints).unwrap();
        });

        let constraints = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(constraints.len(), 3);
        assert!(constraints
            .iter()
            .all(|c| c.tag == crate::graph::ConstraintTag::InterSubmap));
        assert_eq!(builder.get_num_finished_nodes(), 1);
    }

    #[test]
    fn test_when_done_fires_immediately_when_quiescent() {
        let pool = Arc::new(ThreadPool::new(2));
        let builder = ConstraintBuilder::new(accept_all_config(), pool);

        let (tx, rx) = mpsc::channel();
        builder.when_done(move |constraints| {
            tx.send(constraints.len()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 0);
    }

    #[test]
    fn test_sampling_ratio_skips_candidates() {
        let pool = Arc::new(ThreadPool::new(2));
        let config = ConstraintBuilderConfig {
            sampling_ratio: 0.5,
            ..accept_all_config()
        };
        let builder = ConstraintBuilder::new(config, pool);
        let cloud = wall_cloud();
        let submap = finished_submap(&cloud);
        let node_data = node(cloud);

        for i in 0..4 {
            builder.maybe_add_constraint(
                SubmapId::new(0, i),
                &submap,
                NodeId::new(0, 0),
                &node_data,
                Pose2D::identity(),
            );
        }
        builder.notify_end_of_node();

        let (tx, rx) = mpsc::channel();
        builder.when_done(move |constraints| {
            tx.send(constraints.len()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(30)).unwrap(), 2);
    }

    #[test]
    fn test_low_scores_are_dropped() {
        let pool = Arc::new(ThreadPool::new(2));
        let config = ConstraintBuilderConfig {
            min_score: 0.99,
            ..accept_all_config()
        };
        let builder = ConstraintBuilder::new(config, pool);
        let submap = finished_submap(&wall_cloud());
        // A cloud that looks nothing like the submap.
        let node_data = node(PointCloud2D::from_points(vec![Point2D::new(-2.0, -2.0)]));

        builder.maybe_add_constraint(
            SubmapId::new(0, 0),
            &submap,
            NodeId::new(0, 0),
            &node_data,
            Pose2D::identity(),
        );
        builder.notify_end_of_node();

        let (tx, rx) = mpsc::channel();
        builder.when_done(move |constraints| {
            tx.send(constraints.len()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(30)).unwrap(), 0);
        assert_eq!(builder.get_num_finished_nodes(), 1);
    }

    #[test]
    fn test_delete_scan_matcher_clears_cache() {
        let pool = Arc::new(ThreadPool::new(2));
        let builder = ConstraintBuilder::new(accept_all_config(), pool);
        let cloud = wall_cloud();
        let submap = finished_submap(&cloud);
        let node_data = node(cloud);

        builder.maybe_add_constraint(
            SubmapId::new(0, 0),
            &submap,
            NodeId::new(0, 0),
            &node_data,
            Pose2D::identity(),
        );
        builder.notify_end_of_node();
        let (tx, rx) = mpsc::channel();
        builder.when_done(move |_| tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(30)).unwrap();

        assert!(builder.inner.lock().scan_matchers.contains_key(&SubmapId::new(0, 0)));
        builder.delete_scan_matcher(SubmapId::new(0, 0));
        assert!(!builder.inner.lock().scan_matchers.contains_key(&SubmapId::new(0, 0)));
    }
}
