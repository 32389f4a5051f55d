//! Heatgrid pipeline coordinator.
//!
//! One [`Pipeline::submit`] call turns a user's sample batch into shard batches,
//! delivers every batch, and only then advances the user's last-known state.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use heatgrid_core::{CoreError, DeltaOp, Sample, ShardKey, SpatialIndex, UserLastState};
use heatgrid_dispatch::{build_dispatcher, DispatchError, Dispatcher, RequestReply, DEFAULT_MAX_IN_FLIGHT};
use heatgrid_persist::LastStateStore;
use heatgrid_route::{Router, ShardBatch, ShardTable};
use heatgrid_sequence::{sequence, SequenceError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod config;

pub use config::Config;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid health category: {0}")]
    InvalidCategory(u8),
    #[error("invalid coordinate: lon={lon} lat={lat}")]
    InvalidCoordinate { lon: f64, lat: f64 },
    #[error("last-state store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("dispatch to shard {shard} on {channel} failed: {source}")]
    DispatchFailed {
        shard: ShardKey,
        channel: String,
        #[source]
        source: DispatchError,
    },
    #[error("internal: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Bad input rejected before any I/O.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::InvalidCategory(_) | PipelineError::InvalidCoordinate { .. })
    }

    /// Ingress mapping: input errors are 400, everything else 500.
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() { 400 } else { 500 }
    }

    fn store(e: anyhow::Error) -> Self {
        PipelineError::StoreUnavailable(format!("{e:#}"))
    }
}

impl From<CoreError> for PipelineError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidCategory(c) => PipelineError::InvalidCategory(c),
            CoreError::InvalidCoordinate { lon, lat } => PipelineError::InvalidCoordinate { lon, lat },
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<SequenceError> for PipelineError {
    fn from(e: SequenceError) -> Self {
        match e {
            SequenceError::Core(c) => c.into(),
            SequenceError::EmptyBatch => PipelineError::Internal("sequencer got an empty batch".into()),
        }
    }
}

/// Name space for [`submission_id`].
const SUBMISSION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1e_2c5a_9d3b_4e8f_a1c7_52b0_d94e_3a61);

/// Content-derived submission id (UUID v5).
///
/// Until the last state advances, retrying the same samples reproduces the same ops and
/// so the same id; a shard that already applied them can recognise the replay.
pub fn submission_id(user_id: &str, prior: Option<&UserLastState>, ops: &[DeltaOp]) -> Uuid {
    let mut key = Vec::with_capacity(user_id.len() + 11 + ops.len() * 17);
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    match prior {
        Some(p) => {
            key.push(1);
            key.extend_from_slice(&p.cell.0.to_be_bytes());
            key.push(p.action().code());
        }
        None => key.push(0),
    }
    for op in ops {
        key.extend_from_slice(&op.cell.0.to_be_bytes());
        key.extend_from_slice(&op.ts.to_be_bytes());
        key.push(op.action.code());
    }
    Uuid::new_v5(&SUBMISSION_NAMESPACE, &key)
}

/// What one accepted submission produced. Empty submissions report zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub submission: Uuid,
    pub ops: usize,
    pub shards: usize,
}

impl Receipt {
    pub fn empty() -> Self {
        Self { submission: Uuid::nil(), ops: 0, shards: 0 }
    }
}

pub struct Pipeline {
    index: Arc<dyn SpatialIndex>,
    router: Router,
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<dyn LastStateStore>,
    max_in_flight: usize,
}

impl Pipeline {
    pub fn new(
        index: Arc<dyn SpatialIndex>,
        table: Arc<ShardTable>,
        dispatcher: Arc<dyn Dispatcher>,
        store: Arc<dyn LastStateStore>,
    ) -> Self {
        let router = Router::new(index.clone(), table);
        Self { index, router, dispatcher, store, max_in_flight: DEFAULT_MAX_IN_FLIGHT }
    }

    /// Cap on concurrent shard requests per submission; 1 dispatches shards one by one.
    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    /// H3 index, shard table and transport as configured. `bus` backs the bus transport.
    pub fn from_config(cfg: &Config, store: Arc<dyn LastStateStore>, bus: Arc<dyn RequestReply>) -> anyhow::Result<Self> {
        cfg.validate()?;
        let index: Arc<dyn SpatialIndex> = Arc::new(cfg.spatial_index()?);
        let dispatcher = build_dispatcher(&cfg.dispatch, bus)?;
        info!(
            resolution = cfg.resolution,
            shards = cfg.shards.len(),
            transport = ?cfg.dispatch.transport,
            timeout_ms = cfg.dispatch.timeout_ms,
            "pipeline configured"
        );
        Ok(Self::new(index, Arc::new(cfg.shard_table()), dispatcher, store).with_max_in_flight(cfg.dispatch.max_in_flight))
    }

    /// Sequence, dispatch to every shard, then record the user's new open state.
    ///
    /// The store is written only after every shard acknowledged. A failed write after
    /// that point still reports `StoreUnavailable`, although the shards already applied.
    pub async fn submit(&self, user_id: &str, samples: &[Sample]) -> Result<Receipt, PipelineError> {
        if samples.is_empty() {
            debug!(user = %user_id, "empty submission; nothing to do");
            return Ok(Receipt::empty());
        }
        let t0 = Instant::now();
        counter!("pipeline_submit_total", 1u64);
        for s in samples {
            s.category()?;
        }

        let prior = self.store.get(user_id).map_err(PipelineError::store)?;
        let seq = sequence(self.index.as_ref(), user_id, samples, prior.as_ref())?;
        let batches = self.router.partition(&seq.ops);
        let submission = submission_id(user_id, prior.as_ref(), &seq.ops);
        debug!(user = %user_id, %submission, ops = seq.ops.len(), shards = batches.len(), "dispatching");

        self.dispatch_all(user_id, submission, &batches).await?;

        if let Err(e) = self.store.set(&seq.next_state) {
            error!(user = %user_id, %submission, error = %e, "shards applied but last state not recorded");
            return Err(PipelineError::store(e));
        }

        counter!("pipeline_ops_total", seq.ops.len() as u64);
        histogram!("pipeline_submit_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(user = %user_id, %submission, ops = seq.ops.len(), shards = batches.len(), took_ms = %t0.elapsed().as_millis(), "submission committed");
        Ok(Receipt { submission, ops: seq.ops.len(), shards: batches.len() })
    }

    /// All batches must be acknowledged. The first failure returns at once and drops
    /// the requests still in flight.
    async fn dispatch_all(&self, user_id: &str, submission: Uuid, batches: &[ShardBatch]) -> Result<(), PipelineError> {
        let dispatcher = self.dispatcher.as_ref();
        let mut inflight = futures::stream::iter(batches.iter().map(|batch| async move {
            dispatcher.dispatch(submission, batch).await.map_err(|source| PipelineError::DispatchFailed {
                shard: batch.shard,
                channel: batch.channel.clone(),
                source,
            })
        }))
        .buffer_unordered(self.max_in_flight)
        .boxed();

        let mut acked = 0usize;
        while let Some(res) = inflight.next().await {
            if let Err(e) = res {
                if acked > 0 {
                    // acknowledged shards keep their deltas; a blind retry double-counts them
                    counter!("pipeline_partial_commit_total", 1u64);
                    warn!(user = %user_id, %submission, acked, total = batches.len(), "partial shard commit");
                }
                return Err(e);
            }
            acked += 1;
        }
        Ok(())
    }
}
