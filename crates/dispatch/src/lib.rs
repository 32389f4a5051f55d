//! Heatgrid shard dispatcher.
//!
//! One shard batch is one message: it is encoded as a single envelope and either sent
//! as a bus request (blocking for the shard's reply) or POSTed to the shard endpoint.
//! No retries happen here; callers own retry policy.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use heatgrid_core::{DeltaOp, ShardKey};
use heatgrid_route::ShardBatch;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod bus;

pub use bus::{BusError, BusMessage, LocalBus, RequestReply};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("config: {0}")]
    Config(String),
}

/// Wire envelope for one shard batch. `submission` lets aggregators drop replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEnvelope {
    pub submission: Uuid,
    pub shard: ShardKey,
    pub ops: Vec<DeltaOp>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    submission: Uuid,
    shard: ShardKey,
    ops: &'a [DeltaOp],
}

impl ShardEnvelope {
    pub fn encode(submission: Uuid, batch: &ShardBatch) -> Result<Vec<u8>, DispatchError> {
        serde_json::to_vec(&EnvelopeRef { submission, shard: batch.shard, ops: &batch.ops }).map_err(DispatchError::Encode)
    }

    pub fn decode(body: &[u8]) -> Result<Self, DispatchError> {
        serde_json::from_slice(body).map_err(DispatchError::Decode)
    }
}

/// Shard acknowledgment. An empty reply body counts as accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn accepted() -> Self { Self { accepted: true, reason: None } }

    pub fn from_reply(body: &[u8]) -> Result<Self, DispatchError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::accepted());
        }
        serde_json::from_slice(body).map_err(DispatchError::Decode)
    }

    /// Turn a negative ack into [`DispatchError::Rejected`].
    pub fn into_result(self) -> Result<Self, DispatchError> {
        if self.accepted {
            Ok(self)
        } else {
            Err(DispatchError::Rejected(self.reason.unwrap_or_else(|| "no reason given".to_string())))
        }
    }
}

/// Delivers one shard batch and waits for its positive acknowledgment.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, submission: Uuid, batch: &ShardBatch) -> Result<Ack, DispatchError>;
}

fn observe(channel: &str, started: Instant, res: &Result<Ack, DispatchError>) {
    histogram!("dispatch_ms", started.elapsed().as_secs_f64() * 1000.0);
    if let Err(e) = res {
        counter!("dispatch_failures_total", 1u64, "channel" => channel.to_string());
        warn!(channel = %channel, error = %e, "shard dispatch failed");
    }
}

/// Request/reply transport: one bus request per batch on the batch's channel.
pub struct BusDispatcher {
    bus: Arc<dyn RequestReply>,
    timeout: Duration,
}

impl BusDispatcher {
    pub fn new(bus: Arc<dyn RequestReply>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }
}

#[async_trait::async_trait]
impl Dispatcher for BusDispatcher {
    async fn dispatch(&self, submission: Uuid, batch: &ShardBatch) -> Result<Ack, DispatchError> {
        let started = Instant::now();
        let res: Result<Ack, DispatchError> = async {
            let payload = ShardEnvelope::encode(submission, batch)?;
            let reply = self.bus.request(&batch.channel, payload, self.timeout).await.map_err(|e| match e {
                BusError::Timeout(t) => DispatchError::Timeout(t),
                other => DispatchError::Bus(other),
            })?;
            Ack::from_reply(&reply)?.into_result()
        }
        .await;
        debug!(channel = %batch.channel, ops = batch.ops.len(), ok = res.is_ok(), "bus dispatch");
        observe(&batch.channel, started, &res);
        res
    }
}

/// Direct network transport: `POST <endpoint>/shards/<channel>`, any 2xx is an ack.
pub struct HttpDispatcher {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Config(format!("building http client: {e}")))?;
        Ok(Self { endpoint: endpoint.into(), client, timeout })
    }

    fn url(&self, channel: &str) -> String {
        format!("{}/shards/{}", self.endpoint.trim_end_matches('/'), channel)
    }
}

#[async_trait::async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, submission: Uuid, batch: &ShardBatch) -> Result<Ack, DispatchError> {
        let started = Instant::now();
        let res: Result<Ack, DispatchError> = async {
            let payload = ShardEnvelope::encode(submission, batch)?;
            let response = self
                .client
                .post(self.url(&batch.channel))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("x-submission-id", submission.to_string())
                .body(payload)
                .send()
                .await
                .map_err(|e| if e.is_timeout() { DispatchError::Timeout(self.timeout) } else { DispatchError::Transport(e.to_string()) })?;
            let status = response.status();
            if status.is_success() { Ok(Ack::accepted()) } else { Err(DispatchError::Status(status.as_u16())) }
        }
        .await;
        debug!(channel = %batch.channel, ops = batch.ops.len(), ok = res.is_ok(), "http dispatch");
        observe(&batch.channel, started, &res);
        res
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Bus,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub transport: Transport,
    /// Per-shard request timeout.
    pub timeout_ms: u64,
    /// Shard service base URL; required for the http transport.
    pub endpoint: Option<String>,
    /// Upper bound on concurrent shard requests per submission.
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { transport: Transport::Bus, timeout_ms: DEFAULT_TIMEOUT_MS, endpoint: None, max_in_flight: DEFAULT_MAX_IN_FLIGHT }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

/// Pick the transport named by `cfg`. `bus` is only used by the bus transport.
pub fn build_dispatcher(cfg: &DispatchConfig, bus: Arc<dyn RequestReply>) -> Result<Arc<dyn Dispatcher>, DispatchError> {
    match cfg.transport {
        Transport::Bus => Ok(Arc::new(BusDispatcher::new(bus, cfg.timeout()))),
        Transport::Http => {
            let endpoint = cfg.endpoint.clone().ok_or_else(|| DispatchError::Config("http transport needs an endpoint".into()))?;
            Ok(Arc::new(HttpDispatcher::new(endpoint, cfg.timeout())?))
        }
    }
}

// ----------------- Recording implementation -----------------

/// In-memory dispatcher for tests: records delivered envelopes, fails chosen channels.
#[derive(Default)]
pub struct RecordingDispatcher {
    delivered: Mutex<Vec<(String, ShardEnvelope)>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingDispatcher {
    pub fn new() -> Self { Self::default() }

    pub fn failing_on(mut self, channel: impl Into<String>) -> Self {
        self.failing.insert(channel.into());
        self
    }

    /// Sleep before answering, to make concurrent dispatch observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn delivered(&self) -> Vec<(String, ShardEnvelope)> {
        self.delivered.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, submission: Uuid, batch: &ShardBatch) -> Result<Ack, DispatchError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.failing.contains(&batch.channel) {
            return Err(DispatchError::Transport(format!("{} unreachable", batch.channel)));
        }
        let env = ShardEnvelope { submission, shard: batch.shard, ops: batch.ops.clone() };
        self.delivered
            .lock()
            .map_err(|_| DispatchError::Transport("recorder poisoned".into()))?
            .push((batch.channel.clone(), env));
        Ok(Ack::accepted())
    }
}
