//! # Cell Indexer
//!
//! Maps sample points to the spatial-index cells the remote service expects
//! in a map query. The service partitions the globe with the S2 cube-face
//! Hilbert curve, so ids produced here are bit-compatible S2 cell ids.
//!
//! A query names the cell containing the point plus a window of neighbours
//! along the curve; a point close to a cell boundary would otherwise miss
//! objects stored in the adjacent cell.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigResult, ConfigurationError};
use crate::geometry::SamplePoint;

/// Deepest level of the hierarchy (leaf cells).
pub const MAX_LEVEL: u8 = 30;
/// Level used for map queries.
pub const DEFAULT_QUERY_LEVEL: u8 = 15;
/// Neighbours taken on each side of the primary cell.
pub const DEFAULT_WINDOW: usize = 10;

const POS_BITS: u32 = 2 * MAX_LEVEL as u32 + 1;
const LOOKUP_BITS: u32 = 4;
const SWAP_MASK: usize = 0x01;
const INVERT_MASK: usize = 0x02;
const MAX_SIZE: i64 = 1 << MAX_LEVEL;

const POS_TO_IJ: [[usize; 4]; 4] = [[0, 1, 3, 2], [0, 2, 3, 1], [3, 2, 0, 1], [3, 1, 0, 2]];
const POS_TO_ORIENTATION: [usize; 4] = [SWAP_MASK, 0, 0, INVERT_MASK | SWAP_MASK];

/// `(i, j, orientation)` chunk to `(pos, orientation)` chunk of the Hilbert curve.
static LOOKUP_POS: Lazy<[u16; 1 << (2 * LOOKUP_BITS + 2)]> = Lazy::new(|| {
    let mut table = [0u16; 1 << (2 * LOOKUP_BITS + 2)];
    for orientation in [0, SWAP_MASK, INVERT_MASK, SWAP_MASK | INVERT_MASK] {
        init_lookup_cell(&mut table, 0, 0, 0, orientation, 0, orientation);
    }
    table
});

fn init_lookup_cell(
    table: &mut [u16],
    level: u32,
    i: usize,
    j: usize,
    orig_orientation: usize,
    pos: usize,
    orientation: usize,
) {
    if level == LOOKUP_BITS {
        let ij = (i << LOOKUP_BITS) + j;
        table[(ij << 2) + orig_orientation] = ((pos << 2) + orientation) as u16;
        return;
    }
    let r = POS_TO_IJ[orientation];
    for (index, &child) in r.iter().enumerate() {
        init_lookup_cell(
            table,
            level + 1,
            (i << 1) + (child >> 1),
            (j << 1) + (child & 1),
            orig_orientation,
            (pos << 2) + index,
            orientation ^ POS_TO_ORIENTATION[index],
        );
    }
}

/// A 64-bit hierarchical cell identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl CellId {
    /// The leaf cell containing a position given in degrees.
    pub fn from_lat_lng(latitude: f64, longitude: f64) -> Self {
        let (lat, lng) = (latitude.to_radians(), longitude.to_radians());
        let x = lat.cos() * lng.cos();
        let y = lat.cos() * lng.sin();
        let z = lat.sin();

        let (face, u, v) = face_uv(x, y, z);
        let i = st_to_ij(uv_to_st(u));
        let j = st_to_ij(uv_to_st(v));
        Self::from_face_ij(face, i, j)
    }

    fn from_face_ij(face: u64, i: i64, j: i64) -> Self {
        let mut n = face << (POS_BITS - 1);
        let mut bits = (face as usize) & SWAP_MASK;
        let mask = (1i64 << LOOKUP_BITS) - 1;
        for k in (0..8u32).rev() {
            bits += (((i >> (k * LOOKUP_BITS)) & mask) as usize) << (LOOKUP_BITS + 2);
            bits += (((j >> (k * LOOKUP_BITS)) & mask) as usize) << 2;
            bits = LOOKUP_POS[bits] as usize;
            n |= ((bits >> 2) as u64) << (k * 2 * LOOKUP_BITS);
            bits &= SWAP_MASK | INVERT_MASK;
        }
        CellId(n * 2 + 1)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn face(&self) -> u8 {
        (self.0 >> POS_BITS) as u8
    }

    fn lsb(&self) -> u64 {
        self.0 & self.0.wrapping_neg()
    }

    pub fn level(&self) -> u8 {
        MAX_LEVEL - (self.0.trailing_zeros().min(2 * MAX_LEVEL as u32) / 2) as u8
    }

    pub fn is_valid(&self) -> bool {
        self.face() < 6 && (self.lsb() & 0x1555_5555_5555_5555) != 0
    }

    /// Ancestor at `level`; `level` must not exceed this cell's level.
    pub fn parent(&self, level: u8) -> Self {
        let lsb = lsb_for_level(level);
        CellId((self.0 & lsb.wrapping_neg()) | lsb)
    }

    /// Next cell at the same level along the curve.
    pub fn next(&self) -> Self {
        CellId(self.0.wrapping_add(self.lsb() << 1))
    }

    /// Previous cell at the same level along the curve.
    pub fn prev(&self) -> Self {
        CellId(self.0.wrapping_sub(self.lsb() << 1))
    }

    /// False whenever `self` is not a valid cell id.
    pub fn contains(&self, other: CellId) -> bool {
        if !self.is_valid() {
            return false;
        }
        let span = self.lsb() - 1;
        other.0 >= self.0 - span && other.0 <= self.0 + span
    }

    /// Compact hex form with trailing zero nibbles removed.
    pub fn to_token(&self) -> String {
        if self.0 == 0 {
            return "X".to_string();
        }
        format!("{:016x}", self.0).trim_end_matches('0').to_string()
    }
}

fn lsb_for_level(level: u8) -> u64 {
    1u64 << (2 * u32::from(MAX_LEVEL - level.min(MAX_LEVEL)))
}

fn face_uv(x: f64, y: f64, z: f64) -> (u64, f64, f64) {
    let (ax, ay, az) = (x.abs(), y.abs(), z.abs());
    let axis = if ax > ay {
        if ax > az { 0 } else { 2 }
    } else if ay > az {
        1
    } else {
        2
    };
    let component = [x, y, z][axis];
    let face = if component < 0.0 { axis + 3 } else { axis };
    let (u, v) = match face {
        0 => (y / x, z / x),
        1 => (-x / y, z / y),
        2 => (-x / z, -y / z),
        3 => (z / x, y / x),
        4 => (z / y, -x / y),
        _ => (-y / z, -x / z),
    };
    (face as u64, u, v)
}

fn uv_to_st(u: f64) -> f64 {
    if u >= 0.0 {
        0.5 * (1.0 + 3.0 * u).sqrt()
    } else {
        1.0 - 0.5 * (1.0 - 3.0 * u).sqrt()
    }
}

fn st_to_ij(s: f64) -> i64 {
    ((MAX_SIZE as f64 * s).floor() as i64).clamp(0, MAX_SIZE - 1)
}

/// The spatial partition capability the indexer relies on.
pub trait SpatialIndex: Send + Sync {
    fn cell_id_of(&self, latitude: f64, longitude: f64, level: u8) -> CellId;
    fn sibling_before(&self, cell: CellId) -> CellId;
    fn sibling_after(&self, cell: CellId) -> CellId;
}

/// S2 cube-face Hilbert curve partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct S2Index;

impl SpatialIndex for S2Index {
    fn cell_id_of(&self, latitude: f64, longitude: f64, level: u8) -> CellId {
        CellId::from_lat_lng(latitude, longitude).parent(level)
    }

    fn sibling_before(&self, cell: CellId) -> CellId {
        cell.prev()
    }

    fn sibling_after(&self, cell: CellId) -> CellId {
        cell.next()
    }
}

/// Ascending, duplicate-free cell ids for one sample point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryCellSet(Vec<u64>);

impl QueryCellSet {
    fn from_ids(mut ids: Vec<u64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Expands sample points into query cell sets.
#[derive(Debug, Clone)]
pub struct CellIndexer<I = S2Index> {
    index: I,
    level: u8,
    window: usize,
}

impl CellIndexer<S2Index> {
    pub fn new(level: u8, window: usize) -> ConfigResult<Self> {
        Self::with_index(S2Index, level, window)
    }
}

impl<I: SpatialIndex> CellIndexer<I> {
    pub fn with_index(index: I, level: u8, window: usize) -> ConfigResult<Self> {
        if level > MAX_LEVEL {
            return Err(ConfigurationError::InvalidSetting(format!(
                "cell level {level} exceeds the maximum of {MAX_LEVEL}"
            )));
        }
        Ok(Self { index, level, window })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Primary cell plus `window` neighbours before and after it, ascending.
    pub fn cells_for(&self, point: &SamplePoint) -> QueryCellSet {
        let origin = self.index.cell_id_of(point.latitude, point.longitude, self.level);
        let mut ids = Vec::with_capacity(2 * self.window + 1);
        ids.push(origin.id());

        let (mut before, mut after) = (origin, origin);
        for _ in 0..self.window {
            before = self.index.sibling_before(before);
            after = self.index.sibling_after(after);
            ids.push(before.id());
            ids.push(after.id());
        }
        QueryCellSet::from_ids(ids)
    }
}
