//! Pipeline Integration Tests
//!
//! Drives the orchestrator with a scripted transport and an in-memory store
//! to cover streaming, stall recovery, reconnect retry and shutdown.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use events_core::config::WatchdogSpec;
use events_core::{Component, ConnectionState, EventsError, LifecycleState, Result};
use events_server::{
    ActivityClock, Collaborators, LinkState, LivenessWatchdog, MemoryQueue, Orchestrator,
    PipelineMetrics, PipelineSettings, Queue, Transport,
};
use events_storage::{Record, Storage, StorageError};

// What a single `start` call does after emitting its lines
enum After {
    Eof,
    Hold,
}

struct Script {
    lines: Vec<String>,
    after: After,
}

fn event(ts: i64) -> String {
    format!(r#"{{"type":"comment-added","eventCreatedOn":{}}}"#, ts)
}

struct ScriptedTransport {
    clock: ActivityClock,
    scripts: Mutex<VecDeque<Script>>,
    failures_left: AtomicU32,
    starts: AtomicU32,
    reconnects: AtomicU32,
    deinits: AtomicU32,
    state: Mutex<ConnectionState>,
}

impl ScriptedTransport {
    fn new(clock: ActivityClock, scripts: Vec<Script>) -> Self {
        Self {
            clock,
            scripts: Mutex::new(scripts.into()),
            failures_left: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            deinits: AtomicU32::new(0),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    fn failing_reconnects(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Component for ScriptedTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn init(&self) -> Result<()> {
        self.clock.touch();
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        self.deinits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn start(
        &self,
        _command: &str,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Streaming;

        let script = self.scripts.lock().pop_front().unwrap_or(Script {
            lines: vec![],
            after: After::Hold,
        });

        for line in script.lines {
            self.clock.touch();
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = sink.send(line) => {
                    sent.map_err(|_| EventsError::Queue("sink closed".to_string()))?;
                }
            }
        }

        if let After::Hold = script.after {
            cancel.cancelled().await;
        }

        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EventsError::Connection("connection refused".to_string()));
        }
        self.clock.touch();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

#[derive(Default)]
struct MemoryStorage {
    records: Mutex<Vec<Record>>,
    fail_init: bool,
    deinits: AtomicU32,
}

impl MemoryStorage {
    fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Default::default()
        }
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl Component for MemoryStorage {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn init(&self) -> Result<()> {
        if self.fail_init {
            return Err(EventsError::Storage("disk full".to_string()));
        }
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        self.deinits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create(&self, records: Vec<Record>) -> events_storage::Result<()> {
        self.records.lock().extend(records);
        Ok(())
    }

    async fn read(&self, since: i64, until: i64) -> events_storage::Result<Vec<Record>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.event_created_on >= since && r.event_created_on < until)
            .cloned()
            .collect())
    }

    async fn delete(&self, since: i64, until: i64) -> events_storage::Result<usize> {
        if since < 0 || until < 0 {
            return Err(StorageError::InvalidRange { since, until });
        }
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.event_created_on < since || r.event_created_on >= until);
        Ok(before - records.len())
    }

    async fn update(&self, record: Record) -> events_storage::Result<usize> {
        let mut records = self.records.lock();
        let mut updated = 0;
        for r in records.iter_mut().filter(|r| r.event_created_on == record.event_created_on) {
            r.event_base64 = record.event_base64.clone();
            updated += 1;
        }
        Ok(updated)
    }
}

#[derive(Default)]
struct RecordingSurface {
    inits: AtomicU32,
    deinits: AtomicU32,
}

#[async_trait]
impl Component for RecordingSurface {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn init(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        self.deinits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    pipeline: Arc<Orchestrator>,
    transport: Arc<ScriptedTransport>,
    storage: Arc<MemoryStorage>,
    surface: Arc<RecordingSurface>,
    queue: Arc<MemoryQueue>,
}

fn harness(scripts: Vec<Script>, failing_reconnects: u32, storage: MemoryStorage) -> Harness {
    let clock = ActivityClock::new();
    let transport =
        Arc::new(ScriptedTransport::new(clock.clone(), scripts).failing_reconnects(failing_reconnects));
    let storage = Arc::new(storage);
    let surface = Arc::new(RecordingSurface::default());
    let queue = Arc::new(MemoryQueue::new(16));
    let watchdog = Arc::new(LivenessWatchdog::new(
        WatchdogSpec {
            period_seconds: 1,
            timeout_seconds: 2,
        },
        clock,
    ));

    let parts = Collaborators {
        surface: surface.clone(),
        queue: queue.clone(),
        transport: transport.clone(),
        storage: storage.clone(),
        watchdog,
    };
    let settings = PipelineSettings {
        fetch_buffer: 4,
        backoff_initial: Duration::from_millis(100),
        backoff_max: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(1),
    };

    Harness {
        pipeline: Arc::new(Orchestrator::new(parts, PipelineMetrics::new()).with_settings(settings)),
        transport,
        storage,
        surface,
        queue,
    }
}

fn spawn_run(pipeline: &Arc<Orchestrator>) -> tokio::task::JoinHandle<Result<()>> {
    let pipeline = pipeline.clone();
    tokio::spawn(async move { pipeline.run().await })
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_events_persist_in_order() {
    let lines = vec![event(100), event(101), event(102)];
    let h = harness(
        vec![Script {
            lines: lines.clone(),
            after: After::Hold,
        }],
        0,
        MemoryStorage::default(),
    );

    h.pipeline.init().await.unwrap();
    assert_eq!(h.pipeline.state(), LifecycleState::Initialized);
    let runner = spawn_run(&h.pipeline);

    eventually(|| h.storage.len() == 3).await;

    let stored = h.storage.records.lock().clone();
    for (record, line) in stored.iter().zip(&lines) {
        assert_eq!(STANDARD.decode(&record.event_base64).unwrap(), line.as_bytes());
    }
    assert_eq!(
        stored.iter().map(|r| r.event_created_on).collect::<Vec<_>>(),
        vec![100, 101, 102]
    );
    assert_eq!(h.pipeline.metrics().received.get(), 3);
    assert_eq!(h.pipeline.metrics().persisted.get(), 3);

    h.pipeline.deinit().await.unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(h.pipeline.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stream_reconnects_and_resumes() {
    let h = harness(
        vec![
            Script {
                lines: vec![event(1)],
                after: After::Eof,
            },
            Script {
                lines: vec![event(2)],
                after: After::Hold,
            },
        ],
        0,
        MemoryStorage::default(),
    );

    h.pipeline.init().await.unwrap();
    let runner = spawn_run(&h.pipeline);

    eventually(|| h.storage.len() == 2).await;

    assert_eq!(h.transport.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.starts.load(Ordering::SeqCst), 2);
    assert_eq!(h.pipeline.metrics().reconnects.get(), 1);
    assert_eq!(h.pipeline.link().state(), LinkState::Streaming);

    h.pipeline.deinit().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_is_retried() {
    let h = harness(
        vec![
            Script {
                lines: vec![event(1)],
                after: After::Eof,
            },
            Script {
                lines: vec![event(2)],
                after: After::Hold,
            },
        ],
        2,
        MemoryStorage::default(),
    );

    h.pipeline.init().await.unwrap();
    let runner = spawn_run(&h.pipeline);

    eventually(|| h.storage.len() == 2).await;

    assert_eq!(h.transport.reconnects.load(Ordering::SeqCst), 3);
    assert_eq!(h.pipeline.metrics().reconnects.get(), 1);

    h.pipeline.deinit().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_event_stops_persisting() {
    let h = harness(
        vec![Script {
            lines: vec![event(1), "not json".to_string(), event(3)],
            after: After::Hold,
        }],
        0,
        MemoryStorage::default(),
    );

    h.pipeline.init().await.unwrap();
    let runner = spawn_run(&h.pipeline);

    eventually(|| h.pipeline.metrics().decode_failures.get() == 1).await;
    assert_eq!(h.storage.len(), 1);

    h.pipeline.deinit().await.unwrap();
    let result = runner.await.unwrap();
    assert!(matches!(result, Err(EventsError::Internal(_))));
    assert_eq!(h.storage.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_persist_stops_fetching() {
    let mut scripts = vec![Script {
        lines: vec!["not json".to_string()],
        after: After::Hold,
    }];
    scripts.extend((0..50).map(|ts| Script {
        lines: vec![event(ts)],
        after: After::Hold,
    }));
    let h = harness(scripts, 0, MemoryStorage::default());

    h.pipeline.init().await.unwrap();
    let runner = spawn_run(&h.pipeline);

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(EventsError::Internal(_))));
    eventually(|| h.transport.state() == ConnectionState::Disconnected).await;

    // Well past many watchdog timeouts: nothing reconnects to feed a dead sink.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.reconnects.load(Ordering::SeqCst), 0);
    assert_eq!(h.pipeline.metrics().reconnects.get(), 0);
    assert_eq!(h.storage.len(), 0);

    h.pipeline.deinit().await.unwrap();
    assert_eq!(h.pipeline.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_failed_init_rolls_back() {
    let h = harness(vec![], 0, MemoryStorage::failing_init());

    let err = h.pipeline.init().await.unwrap_err();
    assert!(err.to_string().contains("failed to init storage"));
    assert!(matches!(err, EventsError::Init { component: "storage", .. }));

    assert_eq!(h.surface.inits.load(Ordering::SeqCst), 1);
    assert_eq!(h.surface.deinits.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.deinits.load(Ordering::SeqCst), 1);
    assert_eq!(h.storage.deinits.load(Ordering::SeqCst), 0);
    assert!(h.queue.put(event(1)).await.is_err());
    assert_eq!(h.pipeline.state(), LifecycleState::Uninitialized);
}

#[tokio::test]
async fn test_lifecycle_guards() {
    let h = harness(vec![], 0, MemoryStorage::default());

    assert!(h.pipeline.run().await.is_err());

    h.pipeline.init().await.unwrap();
    assert!(h.pipeline.init().await.is_err());

    h.pipeline.deinit().await.unwrap();
    assert_eq!(h.pipeline.state(), LifecycleState::Stopped);
    assert_eq!(h.surface.deinits.load(Ordering::SeqCst), 1);
    assert_eq!(h.storage.deinits.load(Ordering::SeqCst), 1);

    h.pipeline.deinit().await.unwrap();
    assert_eq!(h.surface.deinits.load(Ordering::SeqCst), 1);
    assert!(h.pipeline.run().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_deinit_stops_a_live_stream() {
    let h = harness(
        vec![Script {
            lines: vec![event(7)],
            after: After::Hold,
        }],
        0,
        MemoryStorage::default(),
    );

    h.pipeline.init().await.unwrap();
    let runner = spawn_run(&h.pipeline);
    eventually(|| h.storage.len() == 1).await;
    assert_eq!(h.transport.state(), ConnectionState::Streaming);

    tokio::time::timeout(Duration::from_secs(5), h.pipeline.deinit())
        .await
        .unwrap()
        .unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(h.transport.state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.deinits.load(Ordering::SeqCst), 1);
}
