//! Submaps: locally consistent grid fragments shared between the
//! front-end and the pose graph.
//!
//! A submap is written by exactly one front-end while it accumulates
//! range data and becomes immutable when finished; the pose graph, the
//! constraint builder's scan matchers, and the trimmer only ever read
//! finished grids. `Submap2D` enforces that shape with an atomic
//! `finished` flag set exactly once and a grid behind a read-write lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::SubmapConfig;
use crate::core::{Point2D, Pose2D};
use crate::grid::{ProbabilityGrid, RangeDataInserter};
use crate::sensor::RangeData;

/// A locally consistent map fragment.
pub struct Submap2D {
    /// Pose of the submap frame in its trajectory's local frame.
    /// Immutable for the life of the submap.
    local_pose: Pose2D,
    grid: RwLock<ProbabilityGrid>,
    num_range_data: AtomicUsize,
    finished: AtomicBool,
}

impl Submap2D {
    /// Create an empty active submap with its frame at `local_pose`.
    pub fn new(local_pose: Pose2D, grid: ProbabilityGrid) -> Self {
        Self {
            local_pose,
            grid: RwLock::new(grid),
            num_range_data: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Reconstruct a submap from serialized state.
    pub fn from_parts(
        local_pose: Pose2D,
        grid: ProbabilityGrid,
        num_range_data: usize,
        finished: bool,
    ) -> Self {
        Self {
            local_pose,
            grid: RwLock::new(grid),
            num_range_data: AtomicUsize::new(num_range_data),
            finished: AtomicBool::new(finished),
        }
    }

    #[inline]
    pub fn local_pose(&self) -> Pose2D {
        self.local_pose
    }

    #[inline]
    pub fn num_range_data(&self) -> usize {
        self.num_range_data.load(Ordering::Acquire)
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Read access to the grid.
    pub fn grid(&self) -> RwLockReadGuard<'_, ProbabilityGrid> {
        self.grid.read()
    }

    /// Insert range data given in the trajectory's local frame.
    ///
    /// Panics if the submap is already finished.
    pub fn insert_range_data(&self, range_data: &RangeData, inserter: &RangeDataInserter) {
        assert!(!self.finished(), "insert into finished submap");
        let to_submap = self.local_pose.inverse();
        let local = RangeData {
            origin: to_submap.transform_point(range_data.origin),
            returns: range_data.returns.transform(&to_submap),
            misses: range_data.misses.transform(&to_submap),
        };
        let mut grid = self.grid.write();
        inserter.insert(&local, &mut grid);
        self.num_range_data.fetch_add(1, Ordering::AcqRel);
    }

    /// Crop the grid to its observed extent and mark the submap
    /// immutable. Must be called exactly once.
    pub fn finish(&self) {
        let mut grid = self.grid.write();
        *grid = grid.compute_cropped_grid();
        let was_finished = self.finished.swap(true, Ordering::AcqRel);
        assert!(!was_finished, "submap finished twice");
    }
}

impl std::fmt::Debug for Submap2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submap2D")
            .field("local_pose", &self.local_pose)
            .field("num_range_data", &self.num_range_data())
            .field("finished", &self.finished())
            .finish()
    }
}

/// The front-end's pair of live submaps.
///
/// At any time there are one or two live submaps. Every insert goes into
/// all of them; once the newest submap has collected `num_range_data`
/// scans a successor is started, and the oldest is finished and dropped
/// from the live set. Every submap except the very first therefore ends
/// with exactly `2 * num_range_data` scans.
pub struct ActiveSubmaps2D {
    config: SubmapConfig,
    inserter: RangeDataInserter,
    submaps: Vec<Arc<Submap2D>>,
    /// Count of submaps finished so far, used only for logging.
    matching_submap_index: usize,
}

impl ActiveSubmaps2D {
    pub fn new(config: SubmapConfig) -> Self {
        let mut active = Self {
            config,
            inserter: RangeDataInserter::new(),
            submaps: Vec::new(),
            matching_submap_index: 0,
        };
        // Always keep a submap to match against, starting at the origin.
        active.add_submap(Point2D::new(0.0, 0.0));
        active
    }

    /// The live submaps, oldest first.
    pub fn submaps(&self) -> Vec<Arc<Submap2D>> {
        self.submaps.clone()
    }

    /// Insert one revolution of range data (trajectory-local frame) into
    /// every live submap, rotating the set when the newest fills up.
    pub fn insert_range_data(&mut self, range_data: &RangeData) -> Vec<Arc<Submap2D>> {
        for submap in &self.submaps {
            submap.insert_range_data(range_data, &self.inserter);
        }
        if self.submaps.last().expect("live set never empty").num_range_data()
            == self.config.num_range_data
        {
            self.add_submap(range_data.origin);
        }
        self.submaps()
    }

    fn finish_submap(&mut self) {
        let submap = self.submaps.remove(0);
        submap.finish();
        self.matching_submap_index += 1;
    }

    fn add_submap(&mut self, origin: Point2D) {
        if self.submaps.len() > 1 {
            // Finishing crops the grid, bounding peak memory before the
            // new allocation below.
            self.finish_submap();
        }
        // The grid lives in the submap frame, centered on its origin.
        let grid = ProbabilityGrid::centered(
            self.config.resolution,
            Point2D::new(0.0, 0.0),
            self.config.grid_size as i32,
        );
        self.submaps
            .push(Arc::new(Submap2D::new(Pose2D::translation(origin.x, origin.y), grid)));
        log::debug!(
            "added submap {}",
            self.matching_submap_index + self.submaps.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::inserter::range_data_from_returns;

    fn test_config() -> SubmapConfig {
        SubmapConfig {
            num_range_data: 10,
            resolution: 0.05,
            grid_size: 200,
        }
    }

    fn scan() -> RangeData {
        range_data_from_returns(
            Point2D::new(0.0, 0.0),
            (0..20)
                .map(|i| Point2D::new(2.0, -1.0 + i as f64 * 0.1))
                .collect(),
        )
    }

    #[test]
    fn test_submap_accumulates_and_finishes() {
        let submap = Submap2D::new(
            Pose2D::identity(),
            ProbabilityGrid::centered(0.05, Point2D::new(0.0, 0.0), 100),
        );
        let inserter = RangeDataInserter::new();
        submap.insert_range_data(&scan(), &inserter);
        assert_eq!(submap.num_range_data(), 1);
        assert!(!submap.finished());

        submap.finish();
        assert!(submap.finished());
        // Cropped grid keeps the observed cells.
        assert!(submap.grid().known_cells().count() > 0);
    }

    #[test]
    #[should_panic(expected = "insert into finished submap")]
    fn test_insert_after_finish_panics() {
        let submap = Submap2D::new(
            Pose2D::identity(),
            ProbabilityGrid::centered(0.05, Point2D::new(0.0, 0.0), 100),
        );
        submap.finish();
        submap.insert_range_data(&scan(), &RangeDataInserter::new());
    }

    #[test]
    fn test_active_submaps_rotation() {
        let mut active = ActiveSubmaps2D::new(test_config());
        assert_eq!(active.submaps().len(), 1);

        for _ in 0..10 {
            active.insert_range_data(&scan());
        }
        // Newest filled: a successor exists, nothing finished yet.
        assert_eq!(active.submaps().len(), 2);
        assert!(!active.submaps()[0].finished());

        for _ in 0..10 {
            active.insert_range_data(&scan());
        }
        assert_eq!(active.submaps().len(), 2);
    }

    // With k = 10, after N inserts the number of finished submaps is
    // floor((N - 10) / 10), and every finished submap before the current
    // pair holds exactly 2k scans.
    #[test]
    fn test_insertion_policy_counts() {
        let k = 10usize;
        let mut active = ActiveSubmaps2D::new(test_config());
        let mut seen: Vec<Arc<Submap2D>> = active.submaps();

        for n in 1..=1000usize {
            let current = active.insert_range_data(&scan());
            for submap in &current {
                if !seen.iter().any(|s| Arc::ptr_eq(s, submap)) {
                    seen.push(Arc::clone(submap));
                }
            }
            let num_finished = seen.iter().filter(|s| s.finished()).count();
            let expected = if n >= k { (n - k) / k } else { 0 };
            assert_eq!(num_finished, expected, "after {} inserts", n);
        }

        for submap in seen.iter().filter(|s| s.finished()) {
            assert_eq!(submap.num_range_data(), 2 * k);
        }
    }
}
