//! End-to-end pose-graph scenarios.
//!
//! These drive the full pipeline: scans through the active-submaps
//! policy, nodes into the pose graph, constraint search on the worker
//! pool, optimization, trimming, and the trajectory lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use setu_slam::config::{ConstraintBuilderConfig, PoseGraphConfig, SubmapConfig};
use setu_slam::core::{NodeId, Point2D, Pose2D, SubmapId, Time};
use setu_slam::graph::pose_graph::DeletionState;
use setu_slam::graph::{ConstraintTag, NodeData, OverlappingSubmapsTrimmer, PoseGraph};
use setu_slam::io::{SerializedConstraint, SerializedGrid, SerializedNode, SerializedSubmap};
use setu_slam::sensor::{PointCloud2D, RangeData};
use setu_slam::submap::ActiveSubmaps2D;
use setu_slam::utils::ThreadPool;
use setu_slam::TrajectoryState;

fn test_config(optimize_every_n_nodes: usize) -> PoseGraphConfig {
    PoseGraphConfig {
        optimize_every_n_nodes,
        global_constraint_search_after_secs: 10.0,
        global_sampling_ratio: 1.0,
        constraint_builder: ConstraintBuilderConfig {
            sampling_ratio: 1.0,
            min_score: 0.3,
            global_localization_min_score: 0.3,
            search_window_linear: 0.3,
            search_window_angular: 0.2,
            linear_resolution: 0.05,
            angular_resolution: 0.05,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn submap_config() -> SubmapConfig {
    SubmapConfig {
        num_range_data: 3,
        resolution: 0.05,
        grid_size: 120,
    }
}

/// The environment: an L-shaped wall, fixed in the trajectory-local
/// frame.
fn wall_points() -> Vec<Point2D> {
    let mut points = Vec::new();
    for i in 0..30 {
        points.push(Point2D::new(1.5, -0.75 + i as f64 * 0.05));
        points.push(Point2D::new(i as f64 * 0.05, 1.2));
    }
    points
}

/// One revolution observed from `pose`, in the trajectory-local frame.
fn scan_at(pose: Pose2D) -> RangeData {
    RangeData {
        origin: pose.position(),
        returns: PointCloud2D::from_points(wall_points()),
        misses: PointCloud2D::new(),
    }
}

fn node_data_at(pose: Pose2D, time_micros: i64) -> Arc<NodeData> {
    // The node's cloud lives in the (gravity-aligned) tracking frame.
    let to_tracking = pose.inverse();
    Arc::new(NodeData {
        time: Time(time_micros),
        local_pose: pose,
        gravity_alignment: 0.0,
        point_cloud: PointCloud2D::from_points(
            wall_points()
                .into_iter()
                .map(|p| to_tracking.transform_point(p))
                .collect(),
        ),
    })
}

/// Feed `count` scans along a slow straight line into one trajectory.
fn drive(
    graph: &PoseGraph,
    active: &mut ActiveSubmaps2D,
    trajectory_id: u32,
    count: usize,
    start_index: usize,
) {
    for i in start_index..start_index + count {
        let pose = Pose2D::new(i as f64 * 0.02, 0.0, 0.0);
        // Snapshot before insertion: the graph must see the pair that
        // existed when this scan was matched.
        let insertion_submaps = active.submaps();
        active.insert_range_data(&scan_at(pose));
        graph.add_node(
            node_data_at(pose, i as i64 * 100_000),
            trajectory_id,
            &insertion_submaps,
        );
    }
}

#[test]
fn test_pipeline_produces_intra_and_inter_constraints() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(4)));
    let mut active = ActiveSubmaps2D::new(submap_config());

    drive(&graph, &mut active, 0, 12, 0);
    graph.wait_for_all_computations();

    let constraints = graph.constraints();
    let num_intra = constraints
        .iter()
        .filter(|c| c.tag == ConstraintTag::IntraSubmap)
        .count();
    let num_inter = constraints
        .iter()
        .filter(|c| c.tag == ConstraintTag::InterSubmap)
        .count();
    // Every node got at least one intra constraint; finished submaps
    // with near-identical scans must produce loop closures.
    assert!(num_intra >= 12, "intra constraints: {num_intra}");
    assert!(num_inter > 0, "inter constraints: {num_inter}");

    // P1: every constraint references live data.
    let nodes = graph.get_trajectory_nodes();
    let submaps = graph.get_all_submap_data();
    for constraint in &constraints {
        assert!(nodes.contains(constraint.node_id));
        assert!(submaps.contains(constraint.submap_id));
    }
}

#[test]
fn test_optimization_triggered_by_node_count() {
    let graph = PoseGraph::new(test_config(3), Arc::new(ThreadPool::new(4)));
    let mut active = ActiveSubmaps2D::new(submap_config());

    let optimizations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&optimizations);
    graph.set_global_slam_optimization_callback(Box::new(move |last_submaps, last_nodes| {
        assert!(!last_nodes.is_empty());
        assert!(!last_submaps.is_empty());
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    drive(&graph, &mut active, 0, 15, 0);
    graph.wait_for_all_computations();

    // Crossing the threshold dispatched at least one optimization, and
    // the counter reset let later crossings dispatch again.
    assert!(optimizations.load(Ordering::SeqCst) >= 2);
}

// Scenario: delete trajectory. After deletion completes, no submap,
// node, or constraint of the trajectory remains and the lifecycle
// states read Deleted/Normal.
#[test]
fn test_delete_trajectory_removes_all_data() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(4)));
    let mut active = ActiveSubmaps2D::new(submap_config());

    drive(&graph, &mut active, 0, 8, 0);
    graph.wait_for_all_computations();
    assert!(!graph.get_trajectory_nodes().is_empty());

    graph.finish_trajectory(0);
    graph.delete_trajectory(0);
    // Deletion is two-phase: it takes effect after the next
    // optimization round.
    graph.run_final_optimization();

    assert_eq!(graph.get_trajectory_nodes().len(), 0);
    assert_eq!(graph.get_all_submap_data().len(), 0);
    assert!(graph.constraints().is_empty());
    assert_eq!(
        graph.get_trajectory_states().get(&0),
        Some(&TrajectoryState::Deleted)
    );
    assert_eq!(graph.get_deletion_state(0), Some(DeletionState::Normal));
}

// Scenario: freeze. A frozen trajectory keeps receiving nodes, but its
// submap poses stay bit-identical across solves.
#[test]
fn test_frozen_trajectory_submap_poses_fixed() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(4)));
    let mut active = ActiveSubmaps2D::new(submap_config());

    graph.freeze_trajectory(0);
    drive(&graph, &mut active, 0, 8, 0);
    graph.run_final_optimization();
    let poses_before: Vec<(SubmapId, Pose2D)> = graph
        .get_all_submap_poses()
        .iter()
        .map(|(id, pose)| (id, pose.pose))
        .collect();

    drive(&graph, &mut active, 0, 4, 8);
    graph.run_final_optimization();
    let poses_after = graph.get_all_submap_poses();

    for (id, before) in poses_before {
        let after = poses_after.at(id).pose;
        assert_eq!(before, after, "submap {id} moved despite frozen trajectory");
    }
}

fn unit_serialized_submap(submap_index: u32) -> SerializedSubmap {
    SerializedSubmap {
        submap_id: SubmapId::new(0, submap_index),
        local_pose: Pose2D::identity(),
        num_range_data: 1,
        finished: true,
        grid: Some(SerializedGrid {
            resolution: 1.0,
            max: Point2D::new(1.0, 1.0),
            num_x_cells: 1,
            num_y_cells: 1,
            cells: vec![70],
            known: vec![true],
        }),
    }
}

fn serialized_node(node_index: u32, time_micros: i64, gravity_alignment: f64) -> SerializedNode {
    SerializedNode {
        node_id: NodeId::new(0, node_index),
        time: Time(time_micros),
        local_pose: Pose2D::identity(),
        gravity_alignment,
        point_cloud: PointCloud2D::from_points(vec![Point2D::new(0.5, 0.5)]),
        global_pose: Pose2D::identity(),
    }
}

// R2: constraints loaded through the serialization path come back
// pose-equal from `constraints()` after the gravity-alignment
// composition and its inverse.
#[test]
fn test_serialized_constraints_roundtrip() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(2)));

    for index in 0..2 {
        let serialized = unit_serialized_submap(index);
        graph.add_submap_from_proto(
            Pose2D::identity(),
            serialized.submap_id,
            serialized.to_submap().unwrap(),
        );
    }
    graph.add_node_from_proto(Pose2D::identity(), serialized_node(0, 1000, 0.2).to_node());
    graph.add_node_from_proto(Pose2D::identity(), serialized_node(1, 2000, -0.4).to_node());

    let input = vec![
        SerializedConstraint {
            submap_id: SubmapId::new(0, 0),
            node_id: NodeId::new(0, 0),
            relative_pose: Pose2D::new(0.3, -0.2, 0.5),
            translation_weight: 100.0,
            rotation_weight: 10.0,
            tag: ConstraintTag::IntraSubmap,
        },
        SerializedConstraint {
            submap_id: SubmapId::new(0, 1),
            node_id: NodeId::new(0, 1),
            relative_pose: Pose2D::new(-1.0, 0.5, -0.7),
            translation_weight: 200.0,
            rotation_weight: 20.0,
            tag: ConstraintTag::InterSubmap,
        },
    ];
    graph.add_serialized_constraints(input.iter().map(|c| c.to_constraint()).collect());
    graph.wait_for_all_computations();

    let output = graph.constraints();
    assert_eq!(output.len(), input.len());
    for (restored, original) in output.iter().zip(&input) {
        assert_eq!(restored.submap_id, original.submap_id);
        assert_eq!(restored.node_id, original.node_id);
        assert_eq!(restored.tag, original.tag);
        assert_relative_eq!(
            restored.pose.relative_pose.x,
            original.relative_pose.x,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            restored.pose.relative_pose.y,
            original.relative_pose.y,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            restored.pose.relative_pose.theta,
            original.relative_pose.theta,
            epsilon = 1e-9
        );
    }
}

// Overlap trimming through the real graph: after the trimmer runs, the
// stale submap is gone, no constraint mentions it, and every surviving
// node keeps an intra-submap constraint (P2).
#[test]
fn test_overlapping_submaps_trimmed_in_graph() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(2)));

    for index in 0..2 {
        let serialized = unit_serialized_submap(index);
        graph.add_submap_from_proto(
            Pose2D::identity(),
            serialized.submap_id,
            serialized.to_submap().unwrap(),
        );
    }
    graph.add_node_from_proto(Pose2D::identity(), serialized_node(0, 1000, 0.0).to_node());
    graph.add_node_from_proto(Pose2D::identity(), serialized_node(1, 2000, 0.0).to_node());
    graph.add_serialized_constraints(vec![
        SerializedConstraint {
            submap_id: SubmapId::new(0, 0),
            node_id: NodeId::new(0, 0),
            relative_pose: Pose2D::identity(),
            translation_weight: 100.0,
            rotation_weight: 10.0,
            tag: ConstraintTag::IntraSubmap,
        }
        .to_constraint(),
        SerializedConstraint {
            submap_id: SubmapId::new(0, 1),
            node_id: NodeId::new(0, 1),
            relative_pose: Pose2D::identity(),
            translation_weight: 100.0,
            rotation_weight: 10.0,
            tag: ConstraintTag::IntraSubmap,
        }
        .to_constraint(),
    ]);
    graph.add_trimmer(Box::new(OverlappingSubmapsTrimmer::new(1, 0)));
    graph.run_final_optimization();

    // The older of the two fully overlapping submaps is retired.
    let submaps = graph.get_all_submap_data();
    assert_eq!(submaps.len(), 1);
    assert!(submaps.contains(SubmapId::new(0, 1)));

    let constraints = graph.constraints();
    assert!(constraints
        .iter()
        .all(|c| c.submap_id != SubmapId::new(0, 0)));

    // Node 0 lost its only intra-submap constraint and went with it.
    let nodes = graph.get_trajectory_nodes();
    assert!(!nodes.contains(NodeId::new(0, 0)));
    assert!(nodes.contains(NodeId::new(0, 1)));
    for node_id in nodes.iter().map(|(id, _)| id) {
        assert!(constraints
            .iter()
            .any(|c| c.tag == ConstraintTag::IntraSubmap && c.node_id == node_id));
    }

    // P3: no stale global pose survives the trim.
    assert_eq!(graph.get_all_submap_poses().len(), 1);
}

#[test]
fn test_landmark_poses_published_after_optimization() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(4)));
    let mut active = ActiveSubmaps2D::new(submap_config());

    drive(&graph, &mut active, 0, 6, 0);
    graph.add_landmark_data(
        0,
        setu_slam::sensor::LandmarkData {
            time: Time(250_000),
            observations: vec![("beacon".to_string(), Pose2D::new(0.0, 2.0, 0.0), 1.0, 1.0)],
        },
    );
    graph.run_final_optimization();

    let poses = graph.get_landmark_poses();
    let beacon = poses.get("beacon").expect("landmark optimized");
    // The trajectory runs along y = 0; the beacon sits 2m to its left.
    assert_relative_eq!(beacon.y, 2.0, epsilon = 0.2);
}

// P1-P4 under randomized interleavings of node insertion, lifecycle
// changes, and trimming.
#[test]
fn test_randomized_interleavings_preserve_invariants() {
    for seed in 0..3u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let graph = PoseGraph::new(test_config(4), Arc::new(ThreadPool::new(4)));
        let mut active = ActiveSubmaps2D::new(submap_config());

        let mut index = 0usize;
        for _ in 0..5 {
            let burst = rng.gen_range(1..6);
            drive(&graph, &mut active, 0, burst, index);
            index += burst;
            if rng.gen_bool(0.3) {
                graph.add_trimmer(Box::new(OverlappingSubmapsTrimmer::new(
                    rng.gen_range(1..4),
                    rng.gen_range(0..3),
                )));
            }
        }
        graph.run_final_optimization();

        let constraints = graph.constraints();
        let nodes = graph.get_trajectory_nodes();
        let submaps = graph.get_all_submap_data();
        for constraint in &constraints {
            assert!(nodes.contains(constraint.node_id), "seed {seed}");
            assert!(submaps.contains(constraint.submap_id), "seed {seed}");
        }
        for node_id in nodes.iter().map(|(id, _)| id) {
            assert!(
                constraints
                    .iter()
                    .any(|c| c.tag == ConstraintTag::IntraSubmap && c.node_id == node_id),
                "seed {seed}: node {node_id} has no intra-submap constraint"
            );
        }
        assert_eq!(
            graph.get_trajectory_states().get(&0),
            Some(&TrajectoryState::Active)
        );
    }
}

#[test]
fn test_multi_trajectory_connectivity_via_initial_pose() {
    let graph = PoseGraph::new(test_config(0), Arc::new(ThreadPool::new(4)));
    let mut active0 = ActiveSubmaps2D::new(submap_config());
    let mut active1 = ActiveSubmaps2D::new(submap_config());

    drive(&graph, &mut active0, 0, 4, 0);
    graph.wait_for_all_computations();

    graph.set_initial_trajectory_pose(1, 0, Pose2D::new(0.1, 0.0, 0.0), Time(0));
    drive(&graph, &mut active1, 1, 4, 0);
    graph.wait_for_all_computations();

    // The initial pose registered a connection between the two.
    let components = graph.get_connected_trajectories();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0], vec![0, 1]);
}
