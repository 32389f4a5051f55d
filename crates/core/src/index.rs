//! Spatial index adapters: `(lon, lat) -> CellId` and `CellId -> ShardKey`.

use h3o::{CellIndex, LatLng, Resolution};
use tracing::debug;

use crate::{CellId, CoreError, ShardKey};

/// Fine resolution used across the system unless configured otherwise.
pub const DEFAULT_RESOLUTION: u8 = 11;

/// Maps coordinates onto fine cells and fine cells onto their coarse shard partition.
pub trait SpatialIndex: Send + Sync {
    fn cell_of(&self, lon: f64, lat: f64) -> Result<CellId, CoreError>;
    fn shard_key_of(&self, cell: CellId) -> ShardKey;
}

fn check_coordinate(lon: f64, lat: f64) -> Result<(), CoreError> {
    if !lon.is_finite() || !lat.is_finite() || !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(CoreError::InvalidCoordinate { lon, lat });
    }
    Ok(())
}

/// H3 hexagonal index. Shard key is the base cell (resolution 0 ancestor).
#[derive(Debug, Clone, Copy)]
pub struct H3Index {
    resolution: Resolution,
}

impl H3Index {
    pub fn new(resolution: u8) -> Result<Self, CoreError> {
        let resolution = Resolution::try_from(resolution).map_err(|_| CoreError::InvalidResolution(resolution))?;
        Ok(Self { resolution })
    }
}

impl Default for H3Index {
    fn default() -> Self {
        Self { resolution: Resolution::Eleven }
    }
}

impl SpatialIndex for H3Index {
    fn cell_of(&self, lon: f64, lat: f64) -> Result<CellId, CoreError> {
        check_coordinate(lon, lat)?;
        let ll = LatLng::new(lat, lon).map_err(|_| CoreError::InvalidCoordinate { lon, lat })?;
        Ok(CellId(u64::from(ll.to_cell(self.resolution))))
    }

    fn shard_key_of(&self, cell: CellId) -> ShardKey {
        match CellIndex::try_from(cell.0) {
            Ok(idx) => ShardKey(u32::from(u8::from(idx.base_cell()))),
            Err(_) => {
                // base cell lives in bits 45..52 of every H3 index
                debug!(cell = %cell, "not a valid h3 cell; reading base cell bits");
                ShardKey(((cell.0 >> 45) & 0x7f) as u32)
            }
        }
    }
}

/// Plain equirectangular grid. Cells are `1 / cells_per_degree` degrees wide;
/// shards are square blocks of `shard_span` degrees.
#[derive(Debug, Clone, Copy)]
pub struct GridIndex {
    cells_per_degree: u32,
    shard_span: u32,
}

impl GridIndex {
    pub fn new(cells_per_degree: u32, shard_span: u32) -> Self {
        Self { cells_per_degree: cells_per_degree.max(1), shard_span: shard_span.clamp(1, 180) }
    }

    fn rows(&self) -> u64 {
        (180 + self.shard_span as u64 - 1) / self.shard_span as u64
    }
}

impl SpatialIndex for GridIndex {
    fn cell_of(&self, lon: f64, lat: f64) -> Result<CellId, CoreError> {
        check_coordinate(lon, lat)?;
        let cpd = self.cells_per_degree as f64;
        let max_x = 360 * self.cells_per_degree as u64 - 1;
        let max_y = 180 * self.cells_per_degree as u64 - 1;
        let x = (((lon + 180.0) * cpd).floor() as u64).min(max_x);
        let y = (((lat + 90.0) * cpd).floor() as u64).min(max_y);
        Ok(CellId((x << 32) | y))
    }

    fn shard_key_of(&self, cell: CellId) -> ShardKey {
        let block = self.cells_per_degree as u64 * self.shard_span as u64;
        let col = (cell.0 >> 32) / block;
        let row = (cell.0 & 0xffff_ffff) / block;
        ShardKey((col * self.rows() + row) as u32)
    }
}
