//! Pipeline orchestrator
//!
//! Owns the collaborators and the three pipeline tasks:
//!
//! - fetch: runs the remote stream command and follows the reconnect
//!   handshake driven by the watchdog
//! - forward: moves lines from the fetch channel into the queue
//! - persist: decodes queued lines and writes them to storage
//!
//! Collaborators initialize in a fixed order and tear down in reverse.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use events_core::{Component, Config, EventsError, LifecycleState, Result};
use events_storage::{SqliteStorage, Storage, StoreConfig};
use events_telemetry::{Counter, Gauge};

use crate::connect::{AppState, ConnectionStatus, HttpSurface, SshTransport, Transport, STREAM_COMMAND};
use crate::events::encode_record;
use crate::queue::{MemoryQueue, Queue};
use crate::reconnect::{Backoff, LinkHandshake, LinkState};
use crate::watchdog::{ActivityClock, LivenessWatchdog, Watchdog};

/// Counters shared by the pipeline tasks and the stats endpoint
#[derive(Clone)]
pub struct PipelineMetrics {
    pub received: Counter,
    pub persisted: Counter,
    pub reconnects: Counter,
    pub decode_failures: Counter,
    pub queue_depth: Gauge,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            received: Counter::new("events_received"),
            persisted: Counter::new("events_persisted"),
            reconnects: Counter::new("stream_reconnects"),
            decode_failures: Counter::new("event_decode_failures"),
            queue_depth: Gauge::new("queue_depth"),
        }
    }

    /// One-line `name=value` rendering for logs
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.received, self.persisted, self.reconnects, self.decode_failures, self.queue_depth
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Capacity of the channel between the fetch and forward tasks
    pub fetch_buffer: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Upper bound on waiting for the fetch and watchdog tasks in `deinit`
    pub shutdown_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_buffer: 64,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// The collaborators wired by the orchestrator
pub struct Collaborators {
    pub surface: Arc<dyn Component>,
    pub queue: Arc<dyn Queue>,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub watchdog: Arc<dyn Watchdog>,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Surface,
    Queue,
    Transport,
    Storage,
    Watchdog,
}

const INIT_ORDER: [Stage; 5] = [
    Stage::Surface,
    Stage::Queue,
    Stage::Transport,
    Stage::Storage,
    Stage::Watchdog,
];

pub struct Orchestrator {
    parts: Collaborators,
    metrics: PipelineMetrics,
    settings: PipelineSettings,
    link: LinkHandshake,
    cancel: CancellationToken,
    /// Fires when `run` has collected the forward and persist tasks
    drained: CancellationToken,
    state: Mutex<LifecycleState>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(parts: Collaborators, metrics: PipelineMetrics) -> Self {
        Self {
            parts,
            metrics,
            settings: PipelineSettings::default(),
            link: LinkHandshake::new(),
            cancel: CancellationToken::new(),
            drained: CancellationToken::new(),
            state: Mutex::new(LifecycleState::Uninitialized),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wire the production collaborators from a config file
    pub fn from_config(config: &Config, listen_port: u16) -> Self {
        let spec = &config.spec;
        let clock = ActivityClock::new();
        let connection = ConnectionStatus::default();
        let metrics = PipelineMetrics::new();

        let storage: Arc<dyn Storage> =
            Arc::new(SqliteStorage::new(StoreConfig::from_spec(&spec.storage)));
        let surface = Arc::new(HttpSurface::new(
            listen_port,
            AppState::new(storage.clone(), metrics.clone(), connection.clone()),
        ));

        let parts = Collaborators {
            surface,
            queue: Arc::new(MemoryQueue::new(spec.queue.capacity)),
            transport: Arc::new(SshTransport::new(
                spec.connect.clone(),
                clock.clone(),
                connection,
            )),
            storage,
            watchdog: Arc::new(LivenessWatchdog::new(spec.watchdog.clone(), clock)),
        };

        Self::new(parts, metrics)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn link(&self) -> &LinkHandshake {
        &self.link
    }

    fn stage_name(&self, stage: Stage) -> &'static str {
        match stage {
            Stage::Surface => self.parts.surface.name(),
            Stage::Queue => self.parts.queue.name(),
            Stage::Transport => self.parts.transport.name(),
            Stage::Storage => self.parts.storage.name(),
            Stage::Watchdog => self.parts.watchdog.name(),
        }
    }

    async fn init_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Surface => self.parts.surface.init().await,
            Stage::Queue => self.parts.queue.init().await,
            Stage::Transport => self.parts.transport.init().await,
            Stage::Storage => self.parts.storage.init().await,
            Stage::Watchdog => self.parts.watchdog.init().await,
        }
    }

    async fn deinit_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Surface => self.parts.surface.deinit().await,
            Stage::Queue => self.parts.queue.deinit().await,
            Stage::Transport => self.parts.transport.deinit().await,
            Stage::Storage => self.parts.storage.deinit().await,
            Stage::Watchdog => self.parts.watchdog.deinit().await,
        }
    }

    async fn deinit_stages(&self, stages: &[Stage]) {
        for &stage in stages.iter().rev() {
            if let Err(e) = self.deinit_stage(stage).await {
                warn!(component = self.stage_name(stage), error = %e, "Deinit failed");
            }
        }
    }

    /// Initialize every collaborator. On failure the ones already
    /// initialized are torn down again before the error is returned.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        debug!("pipeline: init");

        if self.state() != LifecycleState::Uninitialized {
            return Err(EventsError::Internal(format!(
                "cannot init pipeline in state {:?}",
                self.state()
            )));
        }

        for (ready, &stage) in INIT_ORDER.iter().enumerate() {
            if let Err(e) = self.init_stage(stage).await {
                let component = self.stage_name(stage);
                error!(component, error = %e, "Collaborator failed to initialize");
                self.deinit_stages(&INIT_ORDER[..ready]).await;
                return Err(EventsError::init(component, e));
            }
        }

        *self.state.lock() = LifecycleState::Initialized;
        info!("Pipeline initialized");
        Ok(())
    }

    /// Start the pipeline tasks and wait for the forward and persist tasks.
    ///
    /// The first error raised by either task is returned.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        debug!("pipeline: run");

        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Initialized {
                return Err(EventsError::Internal(format!(
                    "cannot run pipeline in state {:?}",
                    *state
                )));
            }
            *state = LifecycleState::Running;
        }

        let (tx, rx) = mpsc::channel(self.settings.fetch_buffer);

        let fetch = tokio::spawn(fetch_events(
            self.parts.transport.clone(),
            self.link.clone(),
            tx,
            self.cancel.clone(),
            self.metrics.clone(),
            Backoff::new(self.settings.backoff_initial, self.settings.backoff_max),
        ));

        let watchdog = {
            let watchdog = self.parts.watchdog.clone();
            let link = self.link.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = watchdog.run(link, cancel).await {
                    error!(error = %e, "Watchdog stopped");
                }
            })
        };

        self.background.lock().extend([fetch, watchdog]);

        // Halting forward drops the fetch channel, which stops fetching.
        let halt = self.cancel.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(forward_events(
            rx,
            self.parts.queue.clone(),
            halt.clone(),
            self.metrics.clone(),
        ));
        tasks.spawn(persist_events(
            self.parts.queue.clone(),
            self.parts.storage.clone(),
            self.cancel.clone(),
            self.metrics.clone(),
        ));

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| EventsError::Internal(format!("task panicked: {}", e)));
            if let Err(e) = result.and_then(|r| r) {
                halt.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        self.drained.cancel();

        match first_error {
            Some(e) => {
                error!(error = %e, "Pipeline stopped with error");
                Err(e)
            }
            None => {
                info!("Pipeline stopped");
                Ok(())
            }
        }
    }

    /// Stop every task and release the collaborators. Best-effort and
    /// idempotent: failures are logged, never returned.
    #[instrument(skip(self))]
    pub async fn deinit(&self) -> Result<()> {
        debug!("pipeline: deinit");

        if self.state() == LifecycleState::Stopped {
            return Ok(());
        }

        self.cancel.cancel();

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            match tokio::time::timeout(self.settings.shutdown_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task failed"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        self.parts.queue.close();

        let state = self.state();
        if state == LifecycleState::Running
            && tokio::time::timeout(self.settings.shutdown_timeout, self.drained.cancelled())
                .await
                .is_err()
        {
            warn!("Pipeline tasks did not drain in time");
        }

        if state != LifecycleState::Uninitialized {
            self.deinit_stages(&INIT_ORDER).await;
        }

        *self.state.lock() = LifecycleState::Stopped;
        info!(metrics = %self.metrics.summary(), "Pipeline deinitialized");
        Ok(())
    }
}

fn sink_lost() {
    error!("Event sink closed, fetch task stopping; pipeline is degraded");
}

/// Stream until the watchdog asks for a reconnect, reconnect with backoff,
/// resume, repeat. Cancellation or a closed sink ends the loop.
async fn fetch_events(
    transport: Arc<dyn Transport>,
    link: LinkHandshake,
    sink: mpsc::Sender<String>,
    cancel: CancellationToken,
    metrics: PipelineMetrics,
    mut backoff: Backoff,
) {
    debug!("pipeline: fetch");

    loop {
        let stream = cancel.child_token();
        let run = async {
            let result = transport.start(STREAM_COMMAND, sink.clone(), stream.clone()).await;
            stream.cancel();
            result
        };
        let stop = async {
            tokio::select! {
                _ = link.wait_for(LinkState::AwaitingReconnect) => stream.cancel(),
                _ = sink.closed() => stream.cancel(),
                _ = stream.cancelled() => {}
            }
        };
        let (result, ()) = tokio::join!(run, stop);

        if cancel.is_cancelled() {
            break;
        }
        if sink.is_closed() {
            sink_lost();
            break;
        }
        match result {
            Ok(()) => debug!("Event stream returned"),
            Err(e) => warn!(error = %e, "Event stream failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sink.closed() => {
                sink_lost();
                break;
            }
            _ = link.wait_for(LinkState::AwaitingReconnect) => {}
        }

        while link.begin_reconnect() {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                attempt = transport.reconnect() => attempt,
            };
            match attempt {
                Ok(()) => {
                    link.reconnected();
                    metrics.reconnects.inc();
                    backoff.reset();
                    break;
                }
                Err(e) => {
                    link.reconnect_failed();
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Reconnect failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        link.resume();
        info!("Event stream resuming");
    }

    debug!("Fetch task stopped");
}

/// Drain the fetch channel into the queue; closes the queue on exit
async fn forward_events(
    mut rx: mpsc::Receiver<String>,
    queue: Arc<dyn Queue>,
    cancel: CancellationToken,
    metrics: PipelineMetrics,
) -> Result<()> {
    debug!("pipeline: forward");

    let result = loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            break Ok(());
        };
        metrics.received.inc();

        let put = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            put = queue.put(item) => put,
        };
        if let Err(e) = put {
            break Err(e);
        }
        metrics.queue_depth.set(queue.depth() as u64);
    };

    queue.close();
    debug!("Forward task stopped");
    result
}

/// Persist queued lines. A line that does not decode stops the task.
async fn persist_events(
    queue: Arc<dyn Queue>,
    storage: Arc<dyn Storage>,
    cancel: CancellationToken,
    metrics: PipelineMetrics,
) -> Result<()> {
    debug!("pipeline: persist");

    let mut items = queue.get()?;

    loop {
        let item = tokio::select! {
            biased;
            item = items.next() => item,
            _ = cancel.cancelled() => None,
        };
        let Some(item) = item else {
            break;
        };
        metrics.queue_depth.set(queue.depth() as u64);

        let record = match encode_record(&item) {
            Ok(record) => record,
            Err(e) => {
                metrics.decode_failures.inc();
                error!(error = %e, "Undecodable event, persist task stopping");
                return Err(e);
            }
        };

        storage.create(vec![record]).await.map_err(|e| {
            error!(error = %e, "Failed to persist event, persist task stopping");
            EventsError::from(e)
        })?;
        metrics.persisted.inc();
    }

    debug!("Persist task stopped");
    Ok(())
}
