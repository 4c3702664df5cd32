//! Spatial hashing of bonding sites for proximity queries.
//!
//! Sites are bucketed into a uniform 3D grid. A neighbour query visits the
//! 3×3×3 block of cells around a point, so with a cell size of at least the
//! query radius no site within range is missed, and the cost is O(k) in the
//! number of nearby sites rather than O(n) over all sites.

use crate::bonding::{EntityId, SiteId};
use glam::{IVec3, Vec3};
use std::collections::HashMap;

const AXIS_BITS: u32 = 21;
const AXIS_MASK: i64 = (1 << AXIS_BITS) - 1;

/// Grid-based spatial hash keyed by packed cell coordinates.
#[derive(Debug, Clone)]
pub struct SiteSpatialHash {
    /// Cell size in world units.
    cell_size: f32,
    /// Map from packed cell key to the sites in that cell.
    cells: HashMap<i64, Vec<SiteEntry>>,
    len: usize,
}

/// A bonding site stored in the hash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteEntry {
    pub entity: EntityId,
    pub site: SiteId,
    pub position: Vec3,
}

impl Default for SiteSpatialHash {
    fn default() -> Self {
        Self::new(5.0)
    }
}

impl SiteSpatialHash {
    /// Create an empty hash. Non-positive sizes fall back to 1.0.
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: if cell_size > 0.0 { cell_size } else { 1.0 },
            cells: HashMap::new(),
            len: 0,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Change the cell size. Clears the hash.
    pub fn set_cell_size(&mut self, cell_size: f32) {
        *self = Self::new(cell_size);
    }

    /// Convert a world position to integer cell coordinates.
    #[inline]
    pub fn world_to_cell(&self, position: Vec3) -> IVec3 {
        (position / self.cell_size).floor().as_ivec3()
    }

    /// Pack cell coordinates into one key, 21 bits per axis.
    #[inline]
    pub fn pack_key(cell: IVec3) -> i64 {
        (cell.x as i64 & AXIS_MASK)
            | ((cell.y as i64 & AXIS_MASK) << AXIS_BITS)
            | ((cell.z as i64 & AXIS_MASK) << (2 * AXIS_BITS))
    }

    #[inline]
    pub fn key_for(&self, position: Vec3) -> i64 {
        Self::pack_key(self.world_to_cell(position))
    }

    /// Keys of the 27 cells around a position, sorted and deduplicated.
    pub fn neighbor_keys(&self, position: Vec3) -> Vec<i64> {
        let center = self.world_to_cell(position);
        let mut keys = Vec::with_capacity(27);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    keys.push(Self::pack_key(center + IVec3::new(dx, dy, dz)));
                }
            }
        }
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Clear all entries (called before each rebuild).
    pub fn clear(&mut self) {
        self.cells.clear();
        self.len = 0;
    }

    pub fn insert(&mut self, entity: EntityId, site: SiteId, position: Vec3) {
        let key = self.key_for(position);
        self.cells.entry(key).or_default().push(SiteEntry {
            entity,
            site,
            position,
        });
        self.len += 1;
    }

    /// All entries in the 27-cell neighbourhood of a position.
    pub fn neighbors(&self, position: Vec3) -> impl Iterator<Item = &SiteEntry> + '_ {
        self.neighbor_keys(position)
            .into_iter()
            .filter_map(move |key| self.cells.get(&key))
            .flatten()
    }

    /// Entries within `radius` of a point, closest first.
    ///
    /// Only the 27-cell neighbourhood is searched, so `radius` should not
    /// exceed the cell size.
    pub fn query_radius(&self, position: Vec3, radius: f32) -> Vec<SiteEntry> {
        let radius_sq = radius * radius;
        let mut results: Vec<SiteEntry> = self
            .neighbors(position)
            .filter(|e| e.position.distance_squared(position) <= radius_sq)
            .copied()
            .collect();

        results.sort_by(|a, b| {
            a.position
                .distance_squared(position)
                .total_cmp(&b.position.distance_squared(position))
                .then_with(|| (a.entity, a.site).cmp(&(b.entity, b.site)))
        });
        results
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Total number of stored sites.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
