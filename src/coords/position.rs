//! XY position records and the multi-resolution position arena.
//!
//! All positions live in one growable array. Per-resolution tile coordinates
//! are a pure function of the level-0 grid row/column, so nothing has to be
//! kept consistent between levels when a new resolution is added mid-run:
//! row/col at level `r` is `floor(row0 / 2^r)`.

use std::collections::HashMap;

// =============================================================================
// Constants
// =============================================================================

/// Linear downsample factor between adjacent pyramid levels.
pub const DOWNSAMPLE_FACTOR: i64 = 2;

// =============================================================================
// Affine transform
// =============================================================================

/// 2x2 affine transform mapping pixel displacements to stage displacements.
///
/// Serialized in summary metadata as `"a_b_c_d"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl AffineTransform {
    /// Identity scaled by a pixel size in micrometers.
    pub fn from_pixel_size(pixel_size_um: f64) -> Self {
        Self {
            a: pixel_size_um,
            b: 0.0,
            c: 0.0,
            d: pixel_size_um,
        }
    }

    /// Apply the transform to a pixel displacement.
    pub fn apply(&self, px: f64, py: f64) -> (f64, f64) {
        (self.a * px + self.b * py, self.c * px + self.d * py)
    }

    /// Apply the inverse transform to a stage displacement.
    ///
    /// Returns `None` when the transform is singular.
    pub fn apply_inverse(&self, sx: f64, sy: f64) -> Option<(f64, f64)> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < f64::EPSILON {
            return None;
        }
        Some((
            (self.d * sx - self.b * sy) / det,
            (self.a * sy - self.c * sx) / det,
        ))
    }

    /// Serialize as the underscore-separated metadata string.
    pub fn to_metadata_string(&self) -> String {
        format!("{}_{}_{}_{}", self.a, self.b, self.c, self.d)
    }

    /// Parse the underscore-separated metadata string.
    pub fn from_metadata_string(s: &str) -> Option<Self> {
        let mut parts = s.split('_').map(|p| p.parse::<f64>());
        let a = parts.next()?.ok()?;
        let b = parts.next()?.ok()?;
        let c = parts.next()?.ok()?;
        let d = parts.next()?.ok()?;
        Some(Self { a, b, c, d })
    }
}

// =============================================================================
// XyPosition
// =============================================================================

/// One XY stage position: a grid cell plus its physical center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyPosition {
    /// Grid row at full resolution (may be negative in explore mode)
    pub grid_row: i64,

    /// Grid column at full resolution
    pub grid_col: i64,

    /// Stage X coordinate of the tile center, micrometers
    pub stage_x: f64,

    /// Stage Y coordinate of the tile center, micrometers
    pub stage_y: f64,
}

impl XyPosition {
    pub fn new(grid_row: i64, grid_col: i64, stage_x: f64, stage_y: f64) -> Self {
        Self {
            grid_row,
            grid_col,
            stage_x,
            stage_y,
        }
    }

    /// Position name used in image metadata, e.g. `Grid_2_5`.
    pub fn name(&self) -> String {
        format!("Grid_{}_{}", self.grid_row, self.grid_col)
    }
}

// =============================================================================
// Floor division
// =============================================================================

/// Floor division, correct for negative operands.
///
/// Explore acquisitions can grow the grid in any direction, so rows and
/// columns may be negative; `-1 / 2` must be `-1`, not `0`.
#[inline]
pub fn floor_div(v: i64, d: i64) -> i64 {
    let q = v / d;
    if v % d != 0 && (v < 0) != (d < 0) {
        q - 1
    } else {
        q
    }
}

// =============================================================================
// PositionIndex
// =============================================================================

/// Per-level lookup table: tile coordinates to a stable per-level index.
#[derive(Debug, Default, Clone)]
struct LevelTable {
    /// (row, col) at this level -> per-level position index
    by_tile: HashMap<(i64, i64), usize>,

    /// per-level index -> representative full-resolution position index
    representative: Vec<usize>,
}

/// The position arena.
///
/// Holds every XY position of an acquisition and derives, for any pyramid
/// level, the tile each position belongs to and a stable per-level index
/// for that tile. Level 0 indices are the arena indices themselves; deeper
/// levels assign indices in order of first appearance, which stays stable
/// as positions and levels are added.
#[derive(Debug)]
pub struct PositionIndex {
    positions: Vec<XyPosition>,

    /// Tables for levels 1..=levels.len(); level 0 needs none
    levels: Vec<LevelTable>,

    affine: AffineTransform,

    /// Tile dimensions with overlap trimmed (constant across levels)
    tile_width: u32,
    tile_height: u32,

    min_row: i64,
    max_row: i64,
    min_col: i64,
    max_col: i64,
}

impl PositionIndex {
    /// Create an index over an initial position list.
    pub fn new(
        affine: AffineTransform,
        tile_width: u32,
        tile_height: u32,
        initial: Vec<XyPosition>,
    ) -> Self {
        let mut index = Self {
            positions: Vec::new(),
            levels: Vec::new(),
            affine,
            tile_width,
            tile_height,
            min_row: 0,
            max_row: 0,
            min_col: 0,
            max_col: 0,
        };
        for pos in initial {
            index.push_position(pos);
        }
        index
    }

    /// Number of full-resolution positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&XyPosition> {
        self.positions.get(index)
    }

    pub fn positions(&self) -> &[XyPosition] {
        &self.positions
    }

    /// Rows spanned by the grid, including empty cells between extremes.
    pub fn num_rows(&self) -> i64 {
        if self.positions.is_empty() {
            0
        } else {
            1 + self.max_row - self.min_row
        }
    }

    /// Columns spanned by the grid.
    pub fn num_cols(&self) -> i64 {
        if self.positions.is_empty() {
            0
        } else {
            1 + self.max_col - self.min_col
        }
    }

    pub fn min_row(&self) -> i64 {
        self.min_row
    }

    pub fn min_col(&self) -> i64 {
        self.min_col
    }

    /// Tile coordinates of a level-0 cell at resolution level `level`.
    ///
    /// Pure function of the grid coordinates: `floor(v / 2^level)`.
    pub fn tile_at_level(row: i64, col: i64, level: usize) -> (i64, i64) {
        let factor = DOWNSAMPLE_FACTOR.pow(level as u32);
        (floor_div(row, factor), floor_div(col, factor))
    }

    /// Grid row of a full-resolution position at the given level.
    pub fn grid_row(&self, full_index: usize, level: usize) -> i64 {
        Self::tile_at_level(self.positions[full_index].grid_row, 0, level).0
    }

    /// Grid column of a full-resolution position at the given level.
    pub fn grid_col(&self, full_index: usize, level: usize) -> i64 {
        Self::tile_at_level(0, self.positions[full_index].grid_col, level).1
    }

    /// Highest level for which tables have been built.
    pub fn max_level(&self) -> usize {
        self.levels.len()
    }

    /// Extend the per-level tables up to `level`, registering every known
    /// position. Idempotent; called when a new resolution level appears.
    pub fn ensure_levels(&mut self, level: usize) {
        while self.levels.len() < level {
            let r = self.levels.len() + 1;
            let mut table = LevelTable::default();
            let LevelTable {
                by_tile,
                representative,
            } = &mut table;
            for (full_index, pos) in self.positions.iter().enumerate() {
                let tile = Self::tile_at_level(pos.grid_row, pos.grid_col, r);
                by_tile.entry(tile).or_insert_with(|| {
                    representative.push(full_index);
                    representative.len() - 1
                });
            }
            self.levels.push(table);
        }
    }

    /// Stable per-level position index of a full-resolution position.
    ///
    /// Level 0 indices are arena indices. Deeper levels must have been
    /// created with [`ensure_levels`](Self::ensure_levels) first.
    pub fn level_index(&self, full_index: usize, level: usize) -> usize {
        if level == 0 {
            return full_index;
        }
        let pos = &self.positions[full_index];
        let tile = Self::tile_at_level(pos.grid_row, pos.grid_col, level);
        self.levels[level - 1].by_tile[&tile]
    }

    /// A full-resolution position index that downsamples into the given
    /// per-level position. Any descendant qualifies; the first registered
    /// one is returned.
    pub fn full_res_index(&self, level_index: usize, level: usize) -> Option<usize> {
        if level == 0 {
            return (level_index < self.positions.len()).then_some(level_index);
        }
        self.levels
            .get(level - 1)?
            .representative
            .get(level_index)
            .copied()
    }

    /// Per-level position index of the tile at (row, col) on `level`, if
    /// any position maps there.
    pub fn index_at_tile(&self, level: usize, row: i64, col: i64) -> Option<usize> {
        if level == 0 {
            return self
                .positions
                .iter()
                .position(|p| p.grid_row == row && p.grid_col == col);
        }
        self.levels
            .get(level - 1)?
            .by_tile
            .get(&(row, col))
            .copied()
    }

    /// Indices for the given grid cells, creating positions that do not
    /// exist yet. Stage coordinates of new cells are derived from the
    /// first known position through the affine transform.
    pub fn get_or_create(&mut self, cells: &[(i64, i64)]) -> Vec<usize> {
        let mut out = Vec::with_capacity(cells.len());
        for &(row, col) in cells {
            let existing = self
                .positions
                .iter()
                .position(|p| p.grid_row == row && p.grid_col == col);
            let index = match existing {
                Some(i) => i,
                None => {
                    let (sx, sy) = self.stage_coords_for_cell(row, col);
                    self.push_position(XyPosition::new(row, col, sx, sy))
                }
            };
            out.push(index);
        }
        out
    }

    /// Absolute full-resolution pixel coordinates of a stage position.
    pub fn pixel_from_stage(&self, stage_x: f64, stage_y: f64) -> Option<(i64, i64)> {
        let anchor = self.positions.first()?;
        let (dx, dy) = self
            .affine
            .apply_inverse(stage_x - anchor.stage_x, stage_y - anchor.stage_y)?;
        let x = (anchor.grid_col as f64 + 0.5) * self.tile_width as f64 + dx;
        let y = (anchor.grid_row as f64 + 0.5) * self.tile_height as f64 + dy;
        Some((x as i64, y as i64))
    }

    /// Stage coordinates of an absolute full-resolution pixel position.
    pub fn stage_from_pixel(&self, x: i64, y: i64) -> Option<(f64, f64)> {
        let anchor = self.positions.first()?;
        let dx = x as f64 - (anchor.grid_col as f64 + 0.5) * self.tile_width as f64;
        let dy = y as f64 - (anchor.grid_row as f64 + 0.5) * self.tile_height as f64;
        let (sx, sy) = self.affine.apply(dx, dy);
        Some((anchor.stage_x + sx, anchor.stage_y + sy))
    }

    /// Full-resolution position index of the tile containing the given
    /// stage coordinates, creating the position when absent.
    pub fn index_from_stage_coords(&mut self, stage_x: f64, stage_y: f64) -> Option<usize> {
        let (px, py) = self.pixel_from_stage(stage_x, stage_y)?;
        let row = px_to_cell(py, self.tile_height);
        let col = px_to_cell(px, self.tile_width);
        Some(self.get_or_create(&[(row, col)])[0])
    }

    fn stage_coords_for_cell(&self, row: i64, col: i64) -> (f64, f64) {
        match self.positions.first() {
            Some(anchor) => {
                let dx = (col - anchor.grid_col) as f64 * self.tile_width as f64;
                let dy = (row - anchor.grid_row) as f64 * self.tile_height as f64;
                let (sx, sy) = self.affine.apply(dx, dy);
                (anchor.stage_x + sx, anchor.stage_y + sy)
            }
            // First position anchors the grid at stage origin
            None => (0.0, 0.0),
        }
    }

    fn push_position(&mut self, pos: XyPosition) -> usize {
        if self.positions.is_empty() {
            self.min_row = pos.grid_row;
            self.max_row = pos.grid_row;
            self.min_col = pos.grid_col;
            self.max_col = pos.grid_col;
        } else {
            self.min_row = self.min_row.min(pos.grid_row);
            self.max_row = self.max_row.max(pos.grid_row);
            self.min_col = self.min_col.min(pos.grid_col);
            self.max_col = self.max_col.max(pos.grid_col);
        }
        self.positions.push(pos);
        let full_index = self.positions.len() - 1;

        // Register the newcomer in existing level tables so indices stay
        // stable for everything registered before it.
        let pos = self.positions[full_index];
        for (i, table) in self.levels.iter_mut().enumerate() {
            let tile = Self::tile_at_level(pos.grid_row, pos.grid_col, i + 1);
            let LevelTable {
                by_tile,
                representative,
            } = table;
            by_tile.entry(tile).or_insert_with(|| {
                representative.push(full_index);
                representative.len() - 1
            });
        }
        full_index
    }
}

/// Nearest grid cell for an absolute pixel coordinate.
fn px_to_cell(px: i64, tile_dim: u32) -> i64 {
    let centered = px as f64 - tile_dim as f64 / 2.0;
    (centered / tile_dim as f64).round() as i64
}

// =============================================================================
// Tests
// =============================================================================
