//! Service configuration, read from a JSON file with env overrides.

use std::path::Path;

use anyhow::{bail, Context, Result};
use heatgrid_core::{H3Index, ShardKey, DEFAULT_RESOLUTION};
use heatgrid_dispatch::{DispatchConfig, Transport};
use heatgrid_route::{ShardTable, DEFAULT_CHANNEL};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Fine H3 resolution for cells.
    pub resolution: u8,
    /// Shard ids with a dedicated `SHARD_<id>` channel.
    pub shards: Vec<u32>,
    pub default_channel: String,
    /// SQLite file for last user state; `HEATGRID_DB_PATH` wins when set.
    pub db_path: Option<String>,
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            shards: Vec::new(),
            default_channel: DEFAULT_CHANNEL.to_string(),
            db_path: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Defaults when `path` is `None`; a named file must exist and parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            Some(p) => {
                let body = std::fs::read_to_string(p).with_context(|| format!("reading config {}", p.display()))?;
                Self::from_json(&body).with_context(|| format!("parsing config {}", p.display()))?
            }
            None => Self::default(),
        };
        let cfg = cfg.with_db_path_override(std::env::var("HEATGRID_DB_PATH").ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn with_db_path_override(mut self, db_path: Option<String>) -> Self {
        if let Some(p) = db_path.filter(|p| !p.is_empty()) {
            self.db_path = Some(p);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution > 15 {
            bail!("resolution must be in 0..=15, got {}", self.resolution);
        }
        if self.default_channel.is_empty() {
            bail!("default_channel must not be empty");
        }
        let mut ids = self.shards.clone();
        ids.sort_unstable();
        if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
            bail!("shard {} is listed more than once", dup[0]);
        }
        let table = self.shard_table();
        if let Some(id) = self.shards.iter().find(|id| table.channel_for(ShardKey(**id)) == self.default_channel) {
            bail!("default_channel {} is also the channel of shard {}", self.default_channel, id);
        }
        if self.dispatch.timeout_ms == 0 {
            bail!("dispatch.timeout_ms must be positive");
        }
        if self.dispatch.transport == Transport::Http && self.dispatch.endpoint.as_deref().map_or(true, str::is_empty) {
            bail!("dispatch.endpoint is required for the http transport");
        }
        Ok(())
    }

    pub fn shard_table(&self) -> ShardTable {
        ShardTable::new(self.shards.iter().copied(), self.default_channel.clone())
    }

    pub fn spatial_index(&self) -> Result<H3Index> {
        Ok(H3Index::new(self.resolution)?)
    }
}
