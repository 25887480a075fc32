//! Range-data rasterization into a probability grid.

use crate::core::Point2D;
use crate::sensor::RangeData;

use super::{CellIndex, ProbabilityGrid};

/// Rasterizes lidar returns into a grid: hits at the returns, misses
/// along the rays from the sensor origin.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeDataInserter;

impl RangeDataInserter {
    pub fn new() -> Self {
        Self
    }

    /// Insert one revolution of range data, already expressed in the
    /// grid's frame.
    pub fn insert(&self, range_data: &RangeData, grid: &mut ProbabilityGrid) {
        let origin = grid.limits().cell_index(range_data.origin);

        // Hits first so a miss ray never clears its own endpoint.
        let ends: Vec<CellIndex> = range_data
            .returns
            .points
            .iter()
            .map(|&p| grid.limits().cell_index(p))
            .collect();
        for &end in &ends {
            grid.apply_hit(end);
        }
        for &end in &ends {
            for cell in bresenham(origin, end) {
                if cell != end {
                    grid.apply_miss(cell);
                }
            }
        }
        for &miss in &range_data.misses.points {
            let end = grid.limits().cell_index(miss);
            for cell in bresenham(origin, end) {
                grid.apply_miss(cell);
            }
        }
    }
}

/// Cells on the segment from `from` to `to`, inclusive.
fn bresenham(from: CellIndex, to: CellIndex) -> Vec<CellIndex> {
    let mut cells = Vec::new();
    let dx = (to.x - from.x).abs();
    let dy = (to.y - from.y).abs();
    let sx = if from.x < to.x { 1 } else { -1 };
    let sy = if from.y < to.y { 1 } else { -1 };
    let mut err = dx - dy;
    let mut x = from.x;
    let mut y = from.y;
    loop {
        cells.push(CellIndex::new(x, y));
        if x == to.x && y == to.y {
            break;
        }
        let e2 = 2 * err;
        if e2 > -dy {
            err -= dy;
            x += sx;
        }
        if e2 < dx {
            err += dx;
            y += sy;
        }
    }
    cells
}

/// Convenience constructor for tests and callers assembling scans.
pub fn range_data_from_returns(origin: Point2D, returns: Vec<Point2D>) -> RangeData {
    RangeData {
        origin,
        returns: crate::sensor::PointCloud2D::from_points(returns),
        misses: crate::sensor::PointCloud2D::new(),
    }
}
