//! Uniform spatial hash grid for viewport queries
//!
//! Divides the world into fixed-size cells and stores one entry per object.
//! Rect queries only touch the cells overlapping the rect, then filter the
//! survivors with an exact bounding-circle test.

use rustc_hash::FxHashMap;

use crate::util::vec2::Vec2;
use crate::world::object::{ObjectId, ObjectKind, Viewport};

/// Default cell size in world units
pub const DEFAULT_CELL_SIZE: f32 = 100.0;

/// Initial capacity for the cell map (expected non-empty cells)
const GRID_INITIAL_CAPACITY: usize = 256;

/// Initial capacity for entry vectors within cells
const CELL_INITIAL_CAPACITY: usize = 8;

/// Grid cell key - (col, row) cell coordinates
pub type CellKey = (i32, i32);

/// Entry stored in the grid: enough to filter without touching the snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialEntry {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub position: Vec2,
    pub radius: f32,
}

/// Uniform grid over a bounded world.
///
/// An object lives in exactly one cell at a time; relocation on re-insert is
/// enforced through an id-to-cell back-index, so query results never need a
/// dedup pass.
pub struct SpatialIndex {
    /// Cell size in world units
    cell_size: f32,
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f32,
    /// World extent; positions are clamped to this before hashing
    world_width: f32,
    world_height: f32,
    /// Grid dimensions: ceil(world / cell)
    cols: i32,
    rows: i32,
    /// Map from cell key to entries in that cell
    cells: FxHashMap<CellKey, Vec<SpatialEntry>>,
    /// Which cell each object currently occupies
    locations: FxHashMap<ObjectId, CellKey>,
}

impl SpatialIndex {
    pub fn new(cell_size: f32, world_width: f32, world_height: f32) -> Self {
        let cols = (world_width / cell_size).ceil() as i32;
        let rows = (world_height / cell_size).ceil() as i32;
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            world_width,
            world_height,
            cols,
            rows,
            cells: FxHashMap::with_capacity_and_hasher(GRID_INITIAL_CAPACITY, Default::default()),
            locations: FxHashMap::default(),
        }
    }

    pub fn cols(&self) -> i32 {
        self.cols
    }

    pub fn rows(&self) -> i32 {
        self.rows
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn object_count(&self) -> usize {
        self.locations.len()
    }

    /// Clear all objects, keeping allocated cell storage
    pub fn clear(&mut self) {
        for cell in self.cells.values_mut() {
            cell.clear();
        }
        self.locations.clear();
    }

    /// Convert a world position to its cell key.
    ///
    /// Coordinates are clamped to world bounds first so off-world objects
    /// hash into a valid edge cell instead of growing the map unboundedly.
    #[inline]
    fn position_to_cell(&self, position: Vec2) -> CellKey {
        let x = position.x.clamp(0.0, self.world_width);
        let y = position.y.clamp(0.0, self.world_height);
        let col = ((x * self.inv_cell_size).floor() as i32).clamp(0, self.cols - 1);
        let row = ((y * self.inv_cell_size).floor() as i32).clamp(0, self.rows - 1);
        (col, row)
    }

    /// Insert an object, or relocate it if already present.
    ///
    /// The stored position is the true (unclamped) one; only the cell key is
    /// clamped. O(1) amortized.
    pub fn insert(&mut self, id: ObjectId, kind: ObjectKind, position: Vec2, radius: f32) {
        let new_key = self.position_to_cell(position);

        if let Some(&old_key) = self.locations.get(&id) {
            if old_key == new_key {
                // Same cell: update the entry in place
                if let Some(cell) = self.cells.get_mut(&old_key) {
                    if let Some(entry) = cell.iter_mut().find(|e| e.id == id) {
                        entry.position = position;
                        entry.radius = radius;
                        entry.kind = kind;
                        return;
                    }
                }
            } else {
                self.detach(id, old_key);
            }
        }

        self.cells
            .entry(new_key)
            .or_insert_with(|| Vec::with_capacity(CELL_INITIAL_CAPACITY))
            .push(SpatialEntry {
                id,
                kind,
                position,
                radius,
            });
        self.locations.insert(id, new_key);
    }

    /// Remove an object. Returns false (no-op) if it was never inserted.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        match self.locations.remove(&id) {
            Some(key) => {
                self.detach(id, key);
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, id: ObjectId, key: CellKey) {
        if let Some(cell) = self.cells.get_mut(&key) {
            if let Some(idx) = cell.iter().position(|e| e.id == id) {
                cell.swap_remove(idx);
            }
        }
    }

    /// All objects whose bounding circle intersects the viewport rect,
    /// optionally restricted to the given kinds.
    ///
    /// Cells are coarser than queries, so every candidate goes through the
    /// exact circle/rect check before it is returned.
    pub fn query_rect(&self, viewport: &Viewport, kinds: Option<&[ObjectKind]>) -> Vec<SpatialEntry> {
        let mut results = Vec::new();
        self.for_each_in_rect(viewport, kinds, |entry| results.push(entry));
        results
    }

    /// Visitor form of `query_rect` for callers reusing their own buffers
    pub fn for_each_in_rect<F>(&self, viewport: &Viewport, kinds: Option<&[ObjectKind]>, mut f: F)
    where
        F: FnMut(SpatialEntry),
    {
        let (min_col, min_row) = self.position_to_cell(Vec2::new(viewport.x, viewport.y));
        let (max_col, max_row) = self.position_to_cell(Vec2::new(
            viewport.x + viewport.width,
            viewport.y + viewport.height,
        ));

        for col in min_col..=max_col {
            for row in min_row..=max_row {
                let Some(cell) = self.cells.get(&(col, row)) else {
                    continue;
                };
                for entry in cell {
                    if let Some(wanted) = kinds {
                        if !wanted.contains(&entry.kind) {
                            continue;
                        }
                    }
                    if viewport.contains_circle(entry.position, entry.radius) {
                        f(*entry);
                    }
                }
            }
        }
    }

    /// Rebuild from scratch; run once per tick before the query phase
    pub fn rebuild(&mut self, entries: impl Iterator<Item = SpatialEntry>) {
        self.clear();
        for entry in entries {
            self.insert(entry.id, entry.kind, entry.position, entry.radius);
        }
    }

    pub fn stats(&self) -> SpatialIndexStats {
        let non_empty_cells = self.cells.values().filter(|c| !c.is_empty()).count();
        let max_per_cell = self.cells.values().map(|c| c.len()).max().unwrap_or(0);

        SpatialIndexStats {
            non_empty_cells,
            total_objects: self.locations.len(),
            max_per_cell,
        }
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE, 4000.0, 4000.0)
    }
}

/// Occupancy statistics, logged by the maintenance path
#[derive(Debug, Clone)]
pub struct SpatialIndexStats {
    pub non_empty_cells: usize,
    pub total_objects: usize,
    pub max_per_cell: usize,
}
