//! Log-odds probability grid backing submaps.
//!
//! Cells are addressed from the grid's `max` corner: cell (0, 0) sits at
//! the corner with the largest x and y, and indices grow towards smaller
//! coordinates. The trimmer and the serialization round-trip both depend
//! on this addressing, so it is part of the grid's contract.

pub mod inserter;

pub use inserter::RangeDataInserter;

use serde::{Deserialize, Serialize};

use crate::core::Point2D;

/// Log-odds applied per hit observation.
pub const LOG_ODDS_HIT: i16 = 70;
/// Log-odds applied per miss observation.
pub const LOG_ODDS_MISS: i16 = -28;
/// Log-odds clamp range.
pub const LOG_ODDS_MIN: i16 = -200;
pub const LOG_ODDS_MAX: i16 = 200;
/// Log-odds above which a cell counts as occupied.
pub const LOG_ODDS_OCCUPIED_THRESHOLD: i16 = 50;

/// Grid extent in cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLimits {
    pub num_x_cells: i32,
    pub num_y_cells: i32,
}

impl CellLimits {
    pub fn new(num_x_cells: i32, num_y_cells: i32) -> Self {
        Self {
            num_x_cells,
            num_y_cells,
        }
    }
}

/// A cell address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CellIndex {
    pub x: i32,
    pub y: i32,
}

impl CellIndex {
    #[inline]
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Maps between world coordinates and cell indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapLimits {
    resolution: f64,
    /// Corner with the largest coordinates; cell (0, 0) touches it.
    max: Point2D,
    cell_limits: CellLimits,
}

impl MapLimits {
    pub fn new(resolution: f64, max: Point2D, cell_limits: CellLimits) -> Self {
        assert!(resolution > 0.0);
        Self {
            resolution,
            max,
            cell_limits,
        }
    }

    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    #[inline]
    pub fn max(&self) -> Point2D {
        self.max
    }

    #[inline]
    pub fn cell_limits(&self) -> CellLimits {
        self.cell_limits
    }

    /// Cell containing `point`.
    #[inline]
    pub fn cell_index(&self, point: Point2D) -> CellIndex {
        CellIndex::new(
            ((self.max.x - point.x) / self.resolution).floor() as i32,
            ((self.max.y - point.y) / self.resolution).floor() as i32,
        )
    }

    /// Center of a cell in world coordinates.
    #[inline]
    pub fn cell_center(&self, index: CellIndex) -> Point2D {
        Point2D::new(
            self.max.x - self.resolution * (index.x as f64 + 0.5),
            self.max.y - self.resolution * (index.y as f64 + 0.5),
        )
    }

    #[inline]
    pub fn contains(&self, index: CellIndex) -> bool {
        index.x >= 0
            && index.y >= 0
            && index.x < self.cell_limits.num_x_cells
            && index.y < self.cell_limits.num_y_cells
    }
}

/// A bounded occupancy grid with log-odds cells.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbabilityGrid {
    limits: MapLimits,
    /// Log-odds per cell; only meaningful where `known` is set.
    log_odds: Vec<i16>,
    known: Vec<bool>,
}

impl ProbabilityGrid {
    pub fn new(limits: MapLimits) -> Self {
        let size =
            (limits.cell_limits.num_x_cells as usize) * (limits.cell_limits.num_y_cells as usize);
        Self {
            limits,
            log_odds: vec![0; size],
            known: vec![false; size],
        }
    }

    /// A grid of `num_cells` x `num_cells` centered on `center`.
    pub fn centered(resolution: f64, center: Point2D, num_cells: i32) -> Self {
        let half = 0.5 * num_cells as f64 * resolution;
        Self::new(MapLimits::new(
            resolution,
            Point2D::new(center.x + half, center.y + half),
            CellLimits::new(num_cells, num_cells),
        ))
    }

    #[inline]
    pub fn limits(&self) -> &MapLimits {
        &self.limits
    }

    #[inline]
    fn flat_index(&self, index: CellIndex) -> usize {
        index.y as usize * self.limits.cell_limits.num_x_cells as usize + index.x as usize
    }

    /// Whether a cell has ever been observed.
    #[inline]
    pub fn is_known(&self, index: CellIndex) -> bool {
        self.limits.contains(index) && self.known[self.flat_index(index)]
    }

    /// Log-odds of a cell; zero for unknown or out-of-bounds cells.
    #[inline]
    pub fn log_odds(&self, index: CellIndex) -> i16 {
        if self.limits.contains(index) {
            self.log_odds[self.flat_index(index)]
        } else {
            0
        }
    }

    /// Occupancy probability of a cell (0.5 when unknown).
    pub fn probability(&self, index: CellIndex) -> f64 {
        let odds = (self.log_odds(index) as f64 / 100.0).exp();
        odds / (1.0 + odds)
    }

    /// Whether the cell is known and above the occupied threshold.
    #[inline]
    pub fn is_occupied(&self, index: CellIndex) -> bool {
        self.is_known(index) && self.log_odds(index) > LOG_ODDS_OCCUPIED_THRESHOLD
    }

    /// Apply a hit observation; out-of-bounds updates are dropped.
    pub fn apply_hit(&mut self, index: CellIndex) {
        self.apply(index, LOG_ODDS_HIT);
    }

    /// Apply a miss observation; out-of-bounds updates are dropped.
    pub fn apply_miss(&mut self, index: CellIndex) {
        self.apply(index, LOG_ODDS_MISS);
    }

    fn apply(&mut self, index: CellIndex, delta: i16) {
        if !self.limits.contains(index) {
            return;
        }
        let flat = self.flat_index(index);
        self.known[flat] = true;
        self.log_odds[flat] = (self.log_odds[flat] + delta).clamp(LOG_ODDS_MIN, LOG_ODDS_MAX);
    }

    /// Bounding box of the known cells: (offset, extent). The extent is
    /// zero when nothing has been observed.
    pub fn compute_cropped_limits(&self) -> (CellIndex, CellLimits) {
        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        for y in 0..self.limits.cell_limits.num_y_cells {
            for x in 0..self.limits.cell_limits.num_x_cells {
                if self.known[y as usize * self.limits.cell_limits.num_x_cells as usize + x as usize]
                {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        if min_x > max_x {
            return (CellIndex::new(0, 0), CellLimits::new(0, 0));
        }
        (
            CellIndex::new(min_x, min_y),
            CellLimits::new(max_x - min_x + 1, max_y - min_y + 1),
        )
    }

    /// A copy reduced to the bounding box of its known cells.
    pub fn compute_cropped_grid(&self) -> ProbabilityGrid {
        let (offset, cell_limits) = self.compute_cropped_limits();
        if cell_limits.num_x_cells == 0 {
            return ProbabilityGrid::new(MapLimits::new(
                self.limits.resolution,
                self.limits.max,
                CellLimits::new(0, 0),
            ));
        }
        let max = Point2D::new(
            self.limits.max.x - self.limits.resolution * offset.x as f64,
            self.limits.max.y - self.limits.resolution * offset.y as f64,
        );
        let mut cropped =
            ProbabilityGrid::new(MapLimits::new(self.limits.resolution, max, cell_limits));
        for y in 0..cell_limits.num_y_cells {
            for x in 0..cell_limits.num_x_cells {
                let source = CellIndex::new(x + offset.x, y + offset.y);
                if self.is_known(source) {
                    let target = CellIndex::new(x, y);
                    let flat = cropped.flat_index(target);
                    cropped.known[flat] = true;
                    cropped.log_odds[flat] = self.log_odds(source);
                }
            }
        }
        cropped
    }

    /// Iterate the known cells as (index, log_odds).
    pub fn known_cells(&self) -> impl Iterator<Item = (CellIndex, i16)> + '_ {
        let num_x = self.limits.cell_limits.num_x_cells;
        self.known.iter().enumerate().filter_map(move |(flat, &k)| {
            if k {
                let index = CellIndex::new(flat as i32 % num_x, flat as i32 / num_x);
                Some((index, self.log_odds[flat]))
            } else {
                None
            }
        })
    }

    /// Raw cell arrays, used by serialization.
    pub fn raw_cells(&self) -> (&[i16], &[bool]) {
        (&self.log_odds, &self.known)
    }

    /// Rebuild a grid from its serialized parts.
    pub fn from_raw_cells(limits: MapLimits, log_odds: Vec<i16>, known: Vec<bool>) -> Self {
        let size =
            (limits.cell_limits.num_x_cells as usize) * (limits.cell_limits.num_y_cells as usize);
        assert_eq!(log_odds.len(), size);
        assert_eq!(known.len(), size);
        Self {
            limits,
            log_odds,
            known,
        }
    }
}
