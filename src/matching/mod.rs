//! Scan matching against finished submap grids.

pub mod correlative;

pub use correlative::FastCorrelativeScanMatcher;

use crate::core::Pose2D;

/// Result of matching a point cloud against a submap grid.
#[derive(Clone, Copy, Debug)]
pub struct ScanMatchResult {
    /// Pose of the scan in the submap frame.
    pub pose: Pose2D,
    /// Fraction of scan points landing on occupied cells (0 to 1).
    pub score: f64,
}
