#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use heatgrid_api::{submission_id, Pipeline, PipelineError};
use heatgrid_core::{Action, CellId, DeltaOp, GridIndex, HealthCategory, Sample, ShardKey, SpatialIndex, UserLastState};
use heatgrid_dispatch::{Ack, DispatchError, Dispatcher, RecordingDispatcher};
use heatgrid_persist::{LastStateStore, MemoryStore};
use heatgrid_route::{ShardBatch, ShardTable};
use uuid::Uuid;

const LAT: f64 = 0.5;
const A: f64 = 1.5;
const B: f64 = 45.5;
const X: f64 = 90.5;

fn grid() -> GridIndex { GridIndex::new(1, 10) }
fn cell(lon: f64) -> CellId { grid().cell_of(lon, LAT).unwrap() }
fn shard(lon: f64) -> ShardKey { grid().shard_key_of(cell(lon)) }
fn channel(lon: f64) -> String { format!("SHARD_{}", shard(lon)) }

fn healthy(lon: f64, ts: i64) -> Sample { Sample::new(lon, LAT, HealthCategory::Healthy, ts) }
fn infected(lon: f64, ts: i64) -> Sample { Sample::new(lon, LAT, HealthCategory::Infected, ts) }

fn op(lon: f64, ts: i64, action: Action) -> DeltaOp { DeltaOp { cell: cell(lon), ts, action } }

/// Store wrapper counting calls, optionally failing writes.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    gets: AtomicUsize,
    sets: AtomicUsize,
    fail_reads: bool,
    fail_writes: bool,
}

impl LastStateStore for CountingStore {
    fn get(&self, user_id: &str) -> anyhow::Result<Option<UserLastState>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            anyhow::bail!("connection refused");
        }
        self.inner.get(user_id)
    }

    fn set(&self, state: &UserLastState) -> anyhow::Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            anyhow::bail!("disk full");
        }
        self.inner.set(state)
    }
}

fn pipeline(dispatcher: Arc<dyn Dispatcher>, store: Arc<dyn LastStateStore>) -> Pipeline {
    let table = ShardTable::new([shard(A).0, shard(B).0, shard(X).0], "SHARD_DEFAULT");
    Pipeline::new(Arc::new(grid()), Arc::new(table), dispatcher, store)
}

#[tokio::test]
async fn empty_submission_is_a_noop() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(CountingStore::default());
    let p = pipeline(d.clone(), store.clone());
    let receipt = p.submit("u1", &[]).await.unwrap();
    assert_eq!(receipt.ops, 0);
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
    assert_eq!(store.sets.load(Ordering::SeqCst), 0);
    assert!(d.delivered().is_empty());
}

#[tokio::test]
async fn new_user_single_sample() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(d.clone(), store.clone());
    let receipt = p.submit("u1", &[healthy(A, 100)]).await.unwrap();
    assert_eq!((receipt.ops, receipt.shards), (1, 1));

    let delivered = d.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, channel(A));
    assert_eq!(delivered[0].1.ops, vec![op(A, 100, Action::IncHealthy)]);
    assert_eq!(delivered[0].1.submission, receipt.submission);
    assert_eq!(
        store.get("u1").unwrap(),
        Some(UserLastState { user_id: "u1".into(), cell: cell(A), category: HealthCategory::Healthy })
    );
}

#[tokio::test]
async fn existing_user_compensation_goes_to_vacated_shard() {
    let d = Arc::new(RecordingDispatcher::new());
    let prior = UserLastState { user_id: "u1".into(), cell: cell(X), category: HealthCategory::Infected };
    let store = Arc::new(MemoryStore::with_state(prior));
    let p = pipeline(d.clone(), store.clone());
    p.submit("u1", &[healthy(A, 200)]).await.unwrap();

    let mut delivered = d.delivered();
    delivered.sort_by(|a, b| a.0.cmp(&b.0));
    let mut expected = vec![
        (channel(X), vec![op(X, 200, Action::DecInfected)]),
        (channel(A), vec![op(A, 200, Action::IncHealthy)]),
    ];
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    let got: Vec<(String, Vec<DeltaOp>)> = delivered.into_iter().map(|(c, e)| (c, e.ops)).collect();
    assert_eq!(got, expected);
    assert_eq!(store.get("u1").unwrap().map(|s| (s.cell, s.category)), Some((cell(A), HealthCategory::Healthy)));
}

#[tokio::test]
async fn multi_sample_sequencing_and_routing() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(d.clone(), store.clone());
    p.submit("u1", &[healthy(A, 1), infected(B, 3)]).await.unwrap();

    let delivered = d.delivered();
    let on = |ch: String| delivered.iter().find(|(c, _)| *c == ch).map(|(_, e)| e.ops.clone()).unwrap_or_default();
    assert_eq!(on(channel(A)), vec![op(A, 1, Action::IncHealthy), op(A, 3, Action::DecHealthy)]);
    assert_eq!(on(channel(B)), vec![op(B, 3, Action::IncInfected)]);
    assert_eq!(store.get("u1").unwrap().map(|s| (s.cell, s.category)), Some((cell(B), HealthCategory::Infected)));
}

#[tokio::test]
async fn out_of_order_input_matches_in_order() {
    let run = |samples: Vec<Sample>| async move {
        let d = Arc::new(RecordingDispatcher::new());
        let p = pipeline(d.clone(), Arc::new(MemoryStore::new())).with_max_in_flight(1);
        p.submit("u1", &samples).await.unwrap();
        d.delivered().into_iter().map(|(c, e)| (c, e.ops)).collect::<Vec<_>>()
    };
    let fwd = run(vec![healthy(A, 1), infected(B, 3)]).await;
    let rev = run(vec![infected(B, 3), healthy(A, 1)]).await;
    assert_eq!(fwd, rev);
}

#[tokio::test]
async fn partial_shard_failure_keeps_last_state() {
    let prior = UserLastState { user_id: "u1".into(), cell: cell(X), category: HealthCategory::Healthy };
    let store = Arc::new(MemoryStore::with_state(prior.clone()));
    let d = Arc::new(RecordingDispatcher::new().failing_on(channel(B)));
    let p = pipeline(d.clone(), store.clone()).with_max_in_flight(1);

    let err = p.submit("u1", &[healthy(A, 1), infected(B, 3)]).await.unwrap_err();
    match &err {
        PipelineError::DispatchFailed { shard: s, channel: c, .. } => {
            assert_eq!(*s, shard(B));
            assert_eq!(*c, channel(B));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.status_code(), 500);
    assert_eq!(store.get("u1").unwrap(), Some(prior));
}

#[tokio::test]
async fn retry_after_partial_failure_reuses_submission_id() {
    let store = Arc::new(MemoryStore::new());
    let samples = [healthy(A, 1), infected(B, 3)];

    let first = Arc::new(RecordingDispatcher::new().failing_on(channel(B)));
    let err = pipeline(first.clone(), store.clone()).with_max_in_flight(1).submit("u1", &samples).await.unwrap_err();
    assert!(matches!(err, PipelineError::DispatchFailed { .. }));
    assert!(store.is_empty());

    let retry = Arc::new(RecordingDispatcher::new());
    let receipt = pipeline(retry.clone(), store.clone()).with_max_in_flight(1).submit("u1", &samples).await.unwrap();

    let on_a = |d: &RecordingDispatcher| d.delivered().into_iter().find(|(c, _)| *c == channel(A)).map(|(_, e)| e).unwrap();
    let (a1, a2) = (on_a(first.as_ref()), on_a(retry.as_ref()));
    assert_eq!(a1.ops, a2.ops);
    assert_eq!(a1.submission, a2.submission);
    assert_eq!(a2.submission, receipt.submission);
}

#[tokio::test]
async fn submission_id_tracks_user_and_content() {
    let d = Arc::new(RecordingDispatcher::new());
    let p = pipeline(d.clone(), Arc::new(MemoryStore::new()));
    let u1 = p.submit("u1", &[healthy(A, 1)]).await.unwrap().submission;
    let u2 = p.submit("u2", &[healthy(A, 1)]).await.unwrap().submission;
    let u3 = p.submit("u3", &[healthy(A, 2)]).await.unwrap().submission;
    assert_ne!(u1, u2);
    assert_ne!(u1, submission_id("u1", None, &[op(A, 2, Action::IncHealthy)]));
    assert_eq!(u1, submission_id("u1", None, &[op(A, 1, Action::IncHealthy)]));
    assert_eq!(u3, submission_id("u3", None, &[op(A, 2, Action::IncHealthy)]));

    // once the state advanced, the same samples are a new submission
    let again = p.submit("u1", &[healthy(A, 1)]).await.unwrap().submission;
    assert_ne!(again, u1);
}

#[tokio::test]
async fn invalid_category_dispatches_nothing() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(CountingStore::default());
    let p = pipeline(d.clone(), store.clone());
    let mut bad = healthy(A, 2);
    bad.health = 2;
    let err = p.submit("u1", &[healthy(A, 1), bad]).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidCategory(2)));
    assert_eq!(err.status_code(), 400);
    assert!(d.delivered().is_empty());
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
    assert_eq!(store.sets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_coordinate_is_a_client_error() {
    let d = Arc::new(RecordingDispatcher::new());
    let p = pipeline(d.clone(), Arc::new(MemoryStore::new()));
    let err = p.submit("u1", &[healthy(200.0, 1)]).await.unwrap_err();
    assert!(err.is_client_error());
    assert!(d.delivered().is_empty());
}

#[tokio::test]
async fn store_read_failure_aborts_before_dispatch() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(CountingStore { fail_reads: true, ..Default::default() });
    let p = pipeline(d.clone(), store.clone());
    let err = p.submit("u1", &[healthy(A, 1)]).await.unwrap_err();
    assert!(matches!(err, PipelineError::StoreUnavailable(ref m) if m.contains("connection refused")));
    assert!(d.delivered().is_empty());
    assert_eq!(store.sets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_write_failure_after_dispatch_is_surfaced() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(CountingStore { fail_writes: true, ..Default::default() });
    let p = pipeline(d.clone(), store.clone());
    let err = p.submit("u1", &[healthy(A, 1)]).await.unwrap_err();
    assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    assert_eq!(d.delivered().len(), 1);
}

#[tokio::test]
async fn consecutive_submissions_chain_through_last_state() {
    let d = Arc::new(RecordingDispatcher::new());
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(d.clone(), store.clone());
    p.submit("u1", &[healthy(A, 10)]).await.unwrap();
    p.submit("u1", &[healthy(A, 20)]).await.unwrap();
    let second: Vec<DeltaOp> = d.delivered().into_iter().skip(1).flat_map(|(_, e)| e.ops).collect();
    assert_eq!(second, vec![op(A, 20, Action::DecHealthy), op(A, 20, Action::IncHealthy)]);
}

/// Fails one channel immediately and stalls every other channel.
struct StallingDispatcher {
    failing: String,
}

#[async_trait::async_trait]
impl Dispatcher for StallingDispatcher {
    async fn dispatch(&self, _submission: Uuid, batch: &ShardBatch) -> Result<Ack, DispatchError> {
        if batch.channel == self.failing {
            return Err(DispatchError::Rejected("nope".into()));
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Ack::accepted())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_failure_cancels_outstanding_dispatches() {
    let store = Arc::new(MemoryStore::new());
    let d = Arc::new(StallingDispatcher { failing: channel(B) });
    let p = pipeline(d, store.clone()).with_max_in_flight(4);
    let started = Instant::now();
    let err = p.submit("u1", &[healthy(A, 1), infected(B, 3), healthy(X, 5)]).await.unwrap_err();
    assert!(matches!(err, PipelineError::DispatchFailed { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shards_are_dispatched_concurrently() {
    let d = Arc::new(RecordingDispatcher::new().with_delay(Duration::from_millis(200)));
    let p = pipeline(d.clone(), Arc::new(MemoryStore::new())).with_max_in_flight(8);
    let started = Instant::now();
    let receipt = p.submit("u1", &[healthy(A, 1), infected(B, 3), healthy(X, 5)]).await.unwrap();
    assert_eq!(receipt.shards, 3);
    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(d.delivered().len(), 3);
}
