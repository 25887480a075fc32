//! Correlative scan matcher over a precomputed occupancy lookup.
//!
//! Loop-closure search needs to be robust to large initial pose error,
//! so it trades accuracy for an exhaustive sweep of a discretized pose
//! window: transform the scan by every candidate, count the points that
//! land on occupied cells, keep the best. The occupancy lookup is
//! dilated by one cell so near-misses still score; building it is the
//! expensive part, which is why matchers are cached per submap and
//! shared across all nodes matched against that submap.

use crate::config::ConstraintBuilderConfig;
use crate::core::{Point2D, Pose2D};
use crate::grid::{CellLimits, MapLimits, ProbabilityGrid};
use crate::sensor::PointCloud2D;

use super::ScanMatchResult;

/// Dilated occupancy lookup built once per submap grid.
struct ScoreGrid {
    limits: MapLimits,
    cells: Vec<bool>,
}

impl ScoreGrid {
    fn new(grid: &ProbabilityGrid) -> Self {
        let limits = grid.limits().clone();
        let CellLimits {
            num_x_cells,
            num_y_cells,
        } = limits.cell_limits();
        let mut cells = vec![false; (num_x_cells as usize) * (num_y_cells as usize)];
        for (index, _) in grid.known_cells() {
            if !grid.is_occupied(index) {
                continue;
            }
            for dx in -1..=1 {
                for dy in -1..=1 {
                    let x = index.x + dx;
                    let y = index.y + dy;
                    if x >= 0 && y >= 0 && x < num_x_cells && y < num_y_cells {
                        cells[y as usize * num_x_cells as usize + x as usize] = true;
                    }
                }
            }
        }
        Self { limits, cells }
    }

    #[inline]
    fn is_hit(&self, point: Point2D) -> bool {
        let index = self.limits.cell_index(point);
        self.limits.contains(index)
            && self.cells[index.y as usize * self.limits.cell_limits().num_x_cells as usize
                + index.x as usize]
    }

    fn score(&self, cloud: &PointCloud2D, candidate: &Pose2D) -> f64 {
        if cloud.is_empty() {
            return 0.0;
        }
        let (sin_t, cos_t) = candidate.theta.sin_cos();
        let mut hits = 0usize;
        for point in &cloud.points {
            let transformed = Point2D::new(
                candidate.x + point.x * cos_t - point.y * sin_t,
                candidate.y + point.x * sin_t + point.y * cos_t,
            );
            if self.is_hit(transformed) {
                hits += 1;
            }
        }
        hits as f64 / cloud.len() as f64
    }
}

/// Per-submap scan matcher for loop-closure constraint search.
pub struct FastCorrelativeScanMatcher {
    score_grid: ScoreGrid,
    config: ConstraintBuilderConfig,
}

impl FastCorrelativeScanMatcher {
    /// Build the matcher for a submap grid. Expensive; memoize per submap.
    pub fn new(grid: &ProbabilityGrid, config: ConstraintBuilderConfig) -> Self {
        Self {
            score_grid: ScoreGrid::new(grid),
            config,
        }
    }

    /// Search a bounded window around `initial_pose` (submap frame).
    pub fn match_local(
        &self,
        initial_pose: Pose2D,
        cloud: &PointCloud2D,
    ) -> Option<ScanMatchResult> {
        self.search(
            initial_pose,
            cloud,
            self.config.search_window_linear,
            self.config.search_window_angular,
            self.config.linear_resolution,
            self.config.angular_resolution,
        )
    }

    /// Search the full submap extent and the full angular range, for
    /// cross-trajectory matches without a usable initial estimate.
    pub fn match_full_submap(&self, cloud: &PointCloud2D) -> Option<ScanMatchResult> {
        let limits = &self.score_grid.limits;
        let extent_x = limits.cell_limits().num_x_cells as f64 * limits.resolution();
        let extent_y = limits.cell_limits().num_y_cells as f64 * limits.resolution();
        let center = Pose2D::new(
            limits.max().x - 0.5 * extent_x,
            limits.max().y - 0.5 * extent_y,
            0.0,
        );
        // Coarser linear steps keep the full sweep tractable; the
        // optimizer refines whatever this finds.
        self.search(
            center,
            cloud,
            0.5 * extent_x.max(extent_y),
            std::f64::consts::PI,
            3.0 * self.config.linear_resolution,
            2.0 * self.config.angular_resolution,
        )
    }

    fn search(
        &self,
        center: Pose2D,
        cloud: &PointCloud2D,
        linear_window: f64,
        angular_window: f64,
        linear_step: f64,
        angular_step: f64,
    ) -> Option<ScanMatchResult> {
        if cloud.is_empty() || self.score_grid.cells.is_empty() {
            return None;
        }
        let linear_steps = (linear_window / linear_step).ceil() as i32;
        let angular_steps = (angular_window / angular_step).ceil() as i32;

        let mut best: Option<ScanMatchResult> = None;
        for ti in -angular_steps..=angular_steps {
            let theta = center.theta + ti as f64 * angular_step;
            for xi in -linear_steps..=linear_steps {
                let x = center.x + xi as f64 * linear_step;
                for yi in -linear_steps..=linear_steps {
                    let y = center.y + yi as f64 * linear_step;
                    let candidate = Pose2D::new(x, y, theta);
                    let score = self.score_grid.score(cloud, &candidate);
                    if best.map_or(true, |b| score > b.score) {
                        best = Some(ScanMatchResult {
                            pose: candidate,
                            score,
                        });
                    }
                }
            }
        }
        best
    }
}
