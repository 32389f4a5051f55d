//! Heatgrid core types: samples, cells, shard keys and signed occupancy deltas.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod index;

pub use index::{GridIndex, H3Index, SpatialIndex, DEFAULT_RESOLUTION};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid health category: {0}")]
    InvalidCategory(u8),
    #[error("invalid coordinate: lon={lon} lat={lat}")]
    InvalidCoordinate { lon: f64, lat: f64 },
    #[error("invalid spatial resolution: {0}")]
    InvalidResolution(u8),
    #[error("invalid action code: {0}")]
    InvalidAction(u8),
}

/// Fine-resolution grid cell. Opaque outside the spatial index that produced it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Coarse ancestor partition of a cell; used only to pick a destination shard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ShardKey(pub u32);

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HealthCategory {
    Healthy,
    Infected,
}

impl TryFrom<u8> for HealthCategory {
    type Error = CoreError;

    /// Ingress encoding: 0 = healthy, 1 = infected.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(HealthCategory::Healthy),
            1 => Ok(HealthCategory::Infected),
            other => Err(CoreError::InvalidCategory(other)),
        }
    }
}

/// Signed, category-scoped occupancy change. Wire codes are shared with the aggregators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Action {
    IncInfected = 0,
    DecInfected = 1,
    IncHealthy = 2,
    DecHealthy = 3,
}

impl Action {
    pub fn increment(category: HealthCategory) -> Self {
        match category {
            HealthCategory::Healthy => Action::IncHealthy,
            HealthCategory::Infected => Action::IncInfected,
        }
    }

    pub fn decrement(category: HealthCategory) -> Self {
        match category {
            HealthCategory::Healthy => Action::DecHealthy,
            HealthCategory::Infected => Action::DecInfected,
        }
    }

    pub fn category(self) -> HealthCategory {
        match self {
            Action::IncHealthy | Action::DecHealthy => HealthCategory::Healthy,
            Action::IncInfected | Action::DecInfected => HealthCategory::Infected,
        }
    }

    pub fn is_increment(self) -> bool {
        matches!(self, Action::IncHealthy | Action::IncInfected)
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<Action> for u8 {
    fn from(a: Action) -> u8 {
        a.code()
    }
}

impl TryFrom<u8> for Action {
    type Error = CoreError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Action::IncInfected),
            1 => Ok(Action::DecInfected),
            2 => Ok(Action::IncHealthy),
            3 => Ok(Action::DecHealthy),
            other => Err(CoreError::InvalidAction(other)),
        }
    }
}

/// One raw location report as submitted by a client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    #[serde(rename = "lg")]
    pub longitude: f64,
    #[serde(rename = "lt")]
    pub latitude: f64,
    /// 0 - healthy, 1 - infected
    #[serde(rename = "us")]
    pub health: u8,
    /// unix seconds
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

impl Sample {
    pub fn new(longitude: f64, latitude: f64, category: HealthCategory, timestamp: i64) -> Self {
        let health = match category {
            HealthCategory::Healthy => 0,
            HealthCategory::Infected => 1,
        };
        Self { longitude, latitude, health, timestamp }
    }

    pub fn category(&self) -> Result<HealthCategory, CoreError> {
        HealthCategory::try_from(self.health)
    }
}

/// Ingress payload: `{"geo_data": [{"lg":..,"lt":..,"us":..,"ts":..}, ...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub geo_data: Vec<Sample>,
}

impl SubmitRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// The unit of work sent to a shard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaOp {
    #[serde(rename = "index")]
    pub cell: CellId,
    pub ts: i64,
    pub action: Action,
}

/// The single not-yet-compensated Inc recorded for a user.
///
/// Holding the category instead of an [`Action`] keeps the row an Inc by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserLastState {
    pub user_id: String,
    pub cell: CellId,
    pub category: HealthCategory,
}

impl UserLastState {
    pub fn action(&self) -> Action {
        Action::increment(self.category)
    }

    /// Dec closing this open state at `ts`.
    pub fn compensation(&self, ts: i64) -> DeltaOp {
        DeltaOp { cell: self.cell, ts, action: Action::decrement(self.category) }
    }
}

pub mod prelude {
    pub use super::{
        Action, CellId, CoreError, DeltaOp, HealthCategory, Sample, ShardKey, SpatialIndex,
        SubmitRequest, UserLastState,
    };
}
