// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the whole pipeline.
//!
//! The supervisor owns every long-running task and the map from task
//! identity to its cancellation handle:
//!
//! ```text
//!   sources ──> fan-in queue ──> Dispatcher ──> sink queue ──> SinkService
//!                                           └─> sink queue ──> SinkService
//!   Watchdog: every report_interval, re-spawn dead sources and log a report
//! ```
//!
//! Shutdown runs front to back. Sources are cancelled first, the dispatcher
//! forwards what is still queued, and each sink makes one final flush bounded
//! by the shutdown timeout. Tasks that miss their deadline are aborted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BufferConfig, Config, ConfigError, OutputConfig, RestartConfig};
use crate::dispatch::Dispatcher;
use crate::hostname::resolve_hostname;
use crate::queue::{channel, QueueGauges, RecordReceiver, RecordSender, FAN_IN_QUEUE};
use crate::sink::file::FileShipper;
use crate::sink::loki::LokiShipper;
use crate::sink::{ShipError, Shipper, SinkConfig, SinkHandle, SinkService, SinkStats};
use crate::source::{build_sources, Source, TaskExit, TaskId};

/// Extra time granted to sinks on top of their own final flush deadline.
const SINK_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("source task {0} is already registered")]
    DuplicateTask(TaskId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up sink {name}: {source}")]
    Sink { name: String, source: ShipError },
    #[error("supervisor already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// [`SupervisorHandle::shutdown`] was called.
    Requested,
    /// Ctrl+C / SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Installing a signal handler failed.
    SignalError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub queue_capacity: usize,
    pub report_interval: Duration,
    pub shutdown_timeout: Duration,
    pub restart: RestartConfig,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        SupervisorSettings {
            queue_capacity: config.queue_capacity,
            report_interval: config.report_interval,
            shutdown_timeout: config.shutdown_timeout,
            restart: config.restart.clone(),
        }
    }
}

/// Snapshot of one supervised source task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub id: TaskId,
    pub live: bool,
    pub restarts: u32,
    pub abandoned: bool,
}

struct SupervisedTask {
    source: Arc<Source>,
    handle: Option<JoinHandle<TaskExit>>,
    started_at: Instant,
    restarts: u32,
    retry_at: Option<Instant>,
    abandoned: bool,
}

impl SupervisedTask {
    fn is_live(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn spawn(&mut self, tx: &RecordSender, parent: &CancellationToken) {
        let source = Arc::clone(&self.source);
        let tx = tx.clone();
        let cancel = parent.child_token();
        self.handle = Some(tokio::spawn(async move { source.produce(tx, cancel).await }));
        self.started_at = Instant::now();
        self.retry_at = None;
    }
}

type TaskMap = Arc<Mutex<BTreeMap<TaskId, SupervisedTask>>>;

fn task_statuses(tasks: &TaskMap) -> Vec<TaskStatus> {
    tasks.lock().map_or_else(
        |_| Vec::new(),
        |tasks| {
            tasks
                .iter()
                .map(|(id, task)| TaskStatus {
                    id: id.clone(),
                    live: task.is_live(),
                    restarts: task.restarts,
                    abandoned: task.abandoned,
                })
                .collect()
        },
    )
}

/// Delay before the n-th consecutive restart: `base_delay * 2^(n-1)`,
/// capped at `max_delay`.
fn restart_delay(policy: &RestartConfig, restart: u32) -> Duration {
    let factor = 2u32.saturating_pow(restart.saturating_sub(1));
    policy
        .base_delay
        .checked_mul(factor)
        .map_or(policy.max_delay, |d| d.min(policy.max_delay))
}

struct PendingSink {
    service: SinkService,
    sender: RecordSender,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    gauges: QueueGauges,
    fan_in: RecordSender,
    fan_in_rx: Option<RecordReceiver>,
    pending_sinks: Vec<PendingSink>,
    sink_handles: Vec<SinkHandle>,
    sink_tasks: Vec<(String, JoinHandle<()>)>,
    tasks: TaskMap,
    dispatched: Arc<AtomicU64>,
    pushed: Arc<AtomicU64>,
    shutdown_token: CancellationToken,
    sources_cancel: CancellationToken,
    dispatcher_cancel: CancellationToken,
    dispatcher_task: Option<JoinHandle<()>>,
    watchdog_task: Option<JoinHandle<()>>,
    started: bool,
}

impl Supervisor {
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        let gauges = QueueGauges::new();
        let (fan_in, fan_in_rx) = channel(FAN_IN_QUEUE, settings.queue_capacity, &gauges);
        Supervisor {
            settings,
            gauges,
            fan_in,
            fan_in_rx: Some(fan_in_rx),
            pending_sinks: Vec::new(),
            sink_handles: Vec::new(),
            sink_tasks: Vec::new(),
            tasks: Arc::new(Mutex::new(BTreeMap::new())),
            dispatched: Arc::new(AtomicU64::new(0)),
            pushed: Arc::new(AtomicU64::new(0)),
            shutdown_token: CancellationToken::new(),
            sources_cancel: CancellationToken::new(),
            dispatcher_cancel: CancellationToken::new(),
            dispatcher_task: None,
            watchdog_task: None,
            started: false,
        }
    }

    /// Wires every configured input and output. Nothing runs until
    /// [`Supervisor::start`].
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        let report_node = resolve_hostname(config.hostname.as_deref());
        let mut supervisor = Supervisor::new(SupervisorSettings::from(config));
        for output in &config.outputs {
            supervisor.add_output(output)?;
        }
        for source in build_sources(&config.inputs, &report_node)? {
            supervisor.register_source(source)?;
        }
        info!(
            "SUPERVISOR | configured {} sources and {} sinks, reporting as {}",
            supervisor.task_count(),
            supervisor.sink_handles.len(),
            report_node
        );
        Ok(supervisor)
    }

    pub fn add_output(&mut self, output: &OutputConfig) -> Result<SinkHandle, SupervisorError> {
        let shipper: Arc<dyn Shipper> = match output {
            OutputConfig::Loki(loki) => Arc::new(LokiShipper::new(loki).map_err(|source| {
                SupervisorError::Sink {
                    name: output.name(),
                    source,
                }
            })?),
            OutputConfig::File(file) => Arc::new(FileShipper::new(file)),
        };
        Ok(self.add_sink(output.name(), shipper, output.buffer().clone()))
    }

    /// Adds a sink with its own bounded queue. Every record reaching the
    /// fan-in queue is delivered to every sink.
    pub fn add_sink(
        &mut self,
        name: String,
        shipper: Arc<dyn Shipper>,
        buffer: BufferConfig,
    ) -> SinkHandle {
        let (sender, rx) = channel(
            format!("{name}.queue"),
            self.settings.queue_capacity,
            &self.gauges,
        );
        let (service, handle) = SinkService::new(
            SinkConfig {
                name,
                shipper,
                buffer,
                shutdown_timeout: self.settings.shutdown_timeout,
                stats: SinkStats::with_total(Arc::clone(&self.pushed)),
            },
            rx,
            &self.gauges,
        );
        self.sink_handles.push(handle.clone());
        self.pending_sinks.push(PendingSink { service, sender });
        handle
    }

    /// Registers a source task under its identity. A second task with the
    /// same identity is rejected. Registered after start, it runs at once.
    pub fn register_source(&mut self, source: Source) -> Result<(), SupervisorError> {
        let id = source.id().clone();
        let mut tasks = self.lock_tasks();
        if tasks.contains_key(&id) {
            return Err(SupervisorError::DuplicateTask(id));
        }
        let mut task = SupervisedTask {
            source: Arc::new(source),
            handle: None,
            started_at: Instant::now(),
            restarts: 0,
            retry_at: None,
            abandoned: false,
        };
        if self.started {
            task.spawn(&self.fan_in, &self.sources_cancel);
        }
        debug!("SUPERVISOR | registered {}", id);
        tasks.insert(id, task);
        Ok(())
    }

    /// Sender into the fan-in queue, for producers living outside the
    /// supervisor such as the log forwarder.
    #[must_use]
    pub fn fan_in(&self) -> RecordSender {
        self.fan_in.clone()
    }

    #[must_use]
    pub fn gauges(&self) -> &QueueGauges {
        &self.gauges
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.lock_tasks().len()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, BTreeMap<TaskId, SupervisedTask>> {
        // a poisoned map still holds valid handles
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawns sinks, the dispatcher, every source and the watchdog.
    pub fn start(&mut self) -> Result<SupervisorHandle, SupervisorError> {
        let Some(fan_in_rx) = self.fan_in_rx.take() else {
            return Err(SupervisorError::AlreadyStarted);
        };

        let mut sink_senders = Vec::with_capacity(self.pending_sinks.len());
        for PendingSink { service, sender } in self.pending_sinks.drain(..) {
            let name = service_name(&self.sink_handles, sink_senders.len());
            sink_senders.push((name.clone(), sender));
            self.sink_tasks.push((name, tokio::spawn(service.run())));
        }

        let dispatcher = Dispatcher::new(
            fan_in_rx,
            sink_senders,
            Arc::clone(&self.dispatched),
            self.dispatcher_cancel.clone(),
        );
        self.dispatcher_task = Some(tokio::spawn(dispatcher.run()));

        {
            let mut tasks = self.lock_tasks();
            for task in tasks.values_mut() {
                task.spawn(&self.fan_in, &self.sources_cancel);
            }
        }
        self.started = true;

        let watchdog = Watchdog {
            tasks: Arc::clone(&self.tasks),
            fan_in: self.fan_in.clone(),
            sources_cancel: self.sources_cancel.clone(),
            restart: self.settings.restart.clone(),
            gauges: self.gauges.clone(),
            sinks: self.sink_handles.clone(),
            dispatched: Arc::clone(&self.dispatched),
            last_dispatched: 0,
            started: Instant::now(),
        };
        let report_interval = self.settings.report_interval;
        let cancel = self.shutdown_token.child_token();
        self.watchdog_task = Some(tokio::spawn(watchdog.run(report_interval, cancel)));

        info!(
            "SUPERVISOR | started {} sources and {} sinks",
            self.task_count(),
            self.sink_tasks.len()
        );
        Ok(self.handle())
    }

    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shutdown_token: self.shutdown_token.clone(),
            tasks: Arc::clone(&self.tasks),
            sinks: self.sink_handles.clone(),
            dispatched: Arc::clone(&self.dispatched),
            pushed: Arc::clone(&self.pushed),
            gauges: self.gauges.clone(),
        }
    }

    /// Stops everything in pipeline order. Each stage gets the shutdown
    /// timeout before it is aborted.
    pub async fn shutdown(&mut self) {
        info!("SUPERVISOR | shutting down");
        self.shutdown_token.cancel();
        if let Some(watchdog) = self.watchdog_task.take() {
            watchdog.abort();
        }

        self.sources_cancel.cancel();
        let handles: Vec<(TaskId, JoinHandle<TaskExit>)> = self
            .lock_tasks()
            .iter_mut()
            .filter_map(|(id, task)| task.handle.take().map(|h| (id.clone(), h)))
            .collect();
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        for (id, handle) in handles {
            if let Some(exit) = join_until(deadline, id.as_str(), handle).await {
                debug!("SUPERVISOR | {} stopped: {:?}", id, exit);
            }
        }

        self.dispatcher_cancel.cancel();
        if let Some(dispatcher) = self.dispatcher_task.take() {
            let deadline = Instant::now() + self.settings.shutdown_timeout;
            join_until(deadline, "dispatcher", dispatcher).await;
        }

        let deadline = Instant::now() + self.settings.shutdown_timeout + SINK_GRACE;
        for (name, task) in self.sink_tasks.drain(..) {
            join_until(deadline, &name, task).await;
        }

        info!(
            "SUPERVISOR | shutdown complete, dispatched {} records, pushed {}",
            self.dispatched.load(Ordering::Relaxed),
            self.pushed.load(Ordering::Relaxed)
        );
    }
}

fn service_name(handles: &[SinkHandle], index: usize) -> String {
    handles
        .get(index)
        .map_or_else(|| format!("sink-{index}"), |h| h.name().to_string())
}

/// Awaits `handle` until `deadline`, aborting it when the deadline passes.
async fn join_until<T>(deadline: Instant, name: &str, mut handle: JoinHandle<T>) -> Option<T> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match timeout(remaining, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            if !e.is_cancelled() {
                error!("SUPERVISOR | {} failed: {}", name, e);
            }
            None
        }
        Err(_) => {
            warn!("SUPERVISOR | {} did not stop in time, aborting", name);
            handle.abort();
            None
        }
    }
}

struct Watchdog {
    tasks: TaskMap,
    fan_in: RecordSender,
    sources_cancel: CancellationToken,
    restart: RestartConfig,
    gauges: QueueGauges,
    sinks: Vec<SinkHandle>,
    dispatched: Arc<AtomicU64>,
    last_dispatched: u64,
    started: Instant,
}

impl Watchdog {
    async fn run(mut self, report_interval: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + report_interval, report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_tasks(Instant::now());
                    self.report();
                }
            }
        }
    }

    /// Re-spawns every source found dead, unless its restart budget is spent.
    fn check_tasks(&self, now: Instant) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        for (id, task) in tasks.iter_mut() {
            if task.abandoned || task.is_live() {
                continue;
            }

            if let Some(handle) = task.handle.take() {
                let ran = now.saturating_duration_since(task.started_at);
                match handle.now_or_never() {
                    Some(Ok(exit)) => warn!(
                        "SUPERVISOR | {} exited after {:.1}s: {:?}",
                        id,
                        ran.as_secs_f64(),
                        exit
                    ),
                    Some(Err(e)) => error!("SUPERVISOR | {} crashed: {}", id, e),
                    None => {}
                }
                if ran >= self.restart.stable_after {
                    task.restarts = 0;
                }
                if task.restarts >= self.restart.max_restarts {
                    task.abandoned = true;
                    error!(
                        "SUPERVISOR | {} gave up after {} restarts",
                        id, task.restarts
                    );
                    continue;
                }
                task.restarts += 1;
                task.retry_at = Some(now + restart_delay(&self.restart, task.restarts));
            }

            if task.retry_at.is_some_and(|at| now >= at) {
                task.spawn(&self.fan_in, &self.sources_cancel);
                info!(
                    "SUPERVISOR | restarted {} ({}/{})",
                    id, task.restarts, self.restart.max_restarts
                );
            }
        }
    }

    fn report(&mut self) {
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        let interval_dispatched = dispatched.saturating_sub(self.last_dispatched);
        self.last_dispatched = dispatched;

        let statuses = task_statuses(&self.tasks);
        let live = statuses.iter().filter(|s| s.live).count();
        let pushed = self
            .sinks
            .iter()
            .map(|s| format!("{}={}", s.name(), s.stats().pushed()))
            .collect::<Vec<_>>()
            .join(" ");
        let queues = self
            .gauges
            .snapshot()
            .into_iter()
            .map(|(name, depth)| format!("{name}={depth}"))
            .collect::<Vec<_>>()
            .join(" ");

        info!(
            "SUPERVISOR | uptime {}s, {}/{} sources live, dispatched {} (+{}), pushed [{}], queues [{}]",
            self.started.elapsed().as_secs(),
            live,
            statuses.len(),
            dispatched,
            interval_dispatched,
            pushed,
            queues
        );
    }
}

/// Cheap, cloneable view of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    shutdown_token: CancellationToken,
    tasks: TaskMap,
    sinks: Vec<SinkHandle>,
    dispatched: Arc<AtomicU64>,
    pushed: Arc<AtomicU64>,
    gauges: QueueGauges,
}

impl SupervisorHandle {
    /// Requests a shutdown; whoever waits in
    /// [`SupervisorHandle::wait_for_shutdown`] wakes up.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Records taken off the fan-in queue so far.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Records accepted by any sink so far.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sinks(&self) -> &[SinkHandle] {
        &self.sinks
    }

    #[must_use]
    pub fn tasks(&self) -> Vec<TaskStatus> {
        task_statuses(&self.tasks)
    }

    #[must_use]
    pub fn live_tasks(&self) -> Vec<TaskId> {
        self.tasks()
            .into_iter()
            .filter(|s| s.live)
            .map(|s| s.id)
            .collect()
    }

    #[must_use]
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.gauges.snapshot()
    }

    /// Blocks until Ctrl+C, SIGTERM or [`SupervisorHandle::shutdown`].
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        tokio::select! {
            () = self.shutdown_token.cancelled() => {
                info!("SUPERVISOR | shutdown requested");
                ShutdownReason::Requested
            }
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("SUPERVISOR | received Ctrl+C, shutting down");
                    ShutdownReason::Interrupt
                }
                Err(e) => {
                    error!("SUPERVISOR | failed to listen for Ctrl+C: {}", e);
                    ShutdownReason::SignalError
                }
            },
            reason = terminate_signal() => reason,
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            info!("SUPERVISOR | received SIGTERM, shutting down");
            ShutdownReason::Terminate
        }
        Err(e) => {
            error!("SUPERVISOR | failed to listen for SIGTERM: {}", e);
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() -> ShutdownReason {
    std::future::pending().await
}
