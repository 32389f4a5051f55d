//! Heatgrid shard routing: shard key -> channel table and per-shard partitioning.

#![forbid(unsafe_code)]

use std::sync::Arc;

use heatgrid_core::{CellId, DeltaOp, ShardKey, SpatialIndex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

pub const CHANNEL_PREFIX: &str = "SHARD_";
pub const DEFAULT_CHANNEL: &str = "SHARD_DEFAULT";

/// Immutable shard id -> channel mapping, built once at startup.
#[derive(Debug, Clone)]
pub struct ShardTable {
    channels: FxHashMap<ShardKey, String>,
    default_channel: String,
}

impl ShardTable {
    pub fn new<I>(shard_ids: I, default_channel: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let channels = shard_ids
            .into_iter()
            .map(|id| (ShardKey(id), format!("{}{}", CHANNEL_PREFIX, id)))
            .collect();
        Self { channels, default_channel: default_channel.into() }
    }

    /// Unmapped keys go to the default channel.
    pub fn channel_for(&self, key: ShardKey) -> &str {
        self.channels.get(&key).map(String::as_str).unwrap_or(&self.default_channel)
    }

    pub fn is_mapped(&self, key: ShardKey) -> bool { self.channels.contains_key(&key) }
    pub fn default_channel(&self) -> &str { &self.default_channel }
}

impl Default for ShardTable {
    fn default() -> Self { Self::new(std::iter::empty(), DEFAULT_CHANNEL) }
}

/// All operations bound for one shard, in construction order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardBatch {
    pub shard: ShardKey,
    pub channel: String,
    pub ops: Vec<DeltaOp>,
}

#[derive(Clone)]
pub struct Router {
    index: Arc<dyn SpatialIndex>,
    table: Arc<ShardTable>,
}

impl Router {
    pub fn new(index: Arc<dyn SpatialIndex>, table: Arc<ShardTable>) -> Self {
        Self { index, table }
    }

    pub fn route_key_for(&self, cell: CellId) -> ShardKey {
        self.index.shard_key_of(cell)
    }

    pub fn channel_for(&self, key: ShardKey) -> &str {
        self.table.channel_for(key)
    }

    /// Group `ops` by the shard owning each op's own cell.
    ///
    /// Batches come out in order of first appearance; ops inside a batch keep their
    /// relative order. A Dec for a vacated cell therefore lands on the vacated cell's shard.
    pub fn partition(&self, ops: &[DeltaOp]) -> Vec<ShardBatch> {
        let mut slots: FxHashMap<ShardKey, usize> = FxHashMap::default();
        let mut batches: Vec<ShardBatch> = Vec::new();
        for op in ops {
            let shard = self.route_key_for(op.cell);
            let slot = *slots.entry(shard).or_insert_with(|| {
                batches.push(ShardBatch { shard, channel: self.channel_for(shard).to_string(), ops: Vec::new() });
                batches.len() - 1
            });
            batches[slot].ops.push(*op);
        }
        debug!(ops = ops.len(), shards = batches.len(), "partitioned ops by shard");
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatgrid_core::{Action, GridIndex};

    fn router(ids: &[u32]) -> (Router, GridIndex) {
        let grid = GridIndex::new(1, 10);
        let table = ShardTable::new(ids.iter().copied(), DEFAULT_CHANNEL);
        (Router::new(Arc::new(grid), Arc::new(table)), grid)
    }

    #[test]
    fn table_maps_configured_ids_and_falls_back() {
        let t = ShardTable::new([3, 17], "FALLBACK");
        assert_eq!(t.channel_for(ShardKey(3)), "SHARD_3");
        assert_eq!(t.channel_for(ShardKey(17)), "SHARD_17");
        assert_eq!(t.channel_for(ShardKey(4)), "FALLBACK");
        assert!(!t.is_mapped(ShardKey(4)));
        assert_eq!(ShardTable::default().channel_for(ShardKey(0)), DEFAULT_CHANNEL);
    }

    #[test]
    fn partition_routes_each_op_by_its_own_cell() {
        let grid = GridIndex::new(1, 10);
        let a = grid.cell_of(1.5, 0.5).unwrap();
        let b = grid.cell_of(45.5, 0.5).unwrap();
        let ka = grid.shard_key_of(a);
        let kb = grid.shard_key_of(b);
        let (r, _) = router(&[ka.0]);
        let ops = vec![
            DeltaOp { cell: a, ts: 1, action: Action::IncHealthy },
            DeltaOp { cell: a, ts: 3, action: Action::DecHealthy },
            DeltaOp { cell: b, ts: 3, action: Action::IncInfected },
        ];
        let batches = r.partition(&ops);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].shard, ka);
        assert_eq!(batches[0].channel, format!("SHARD_{}", ka.0));
        assert_eq!(batches[0].ops, ops[..2].to_vec());
        assert_eq!(batches[1].shard, kb);
        assert_eq!(batches[1].channel, DEFAULT_CHANNEL);
        assert_eq!(batches[1].ops, vec![ops[2]]);
    }

    #[test]
    fn partition_keeps_insertion_order_within_shard() {
        let (r, grid) = router(&[]);
        let a = grid.cell_of(1.5, 0.5).unwrap();
        let b = grid.cell_of(2.5, 0.5).unwrap();
        let ops = vec![
            DeltaOp { cell: b, ts: 9, action: Action::IncHealthy },
            DeltaOp { cell: a, ts: 1, action: Action::IncHealthy },
        ];
        let batches = r.partition(&ops);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ops, ops);
        assert!(r.partition(&[]).is_empty());
    }
}
