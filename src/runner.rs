//! Sequential queue runner.
//!
//! [`QueueRunner`] is an actor task that owns the waiting list and the
//! executor. Clients talk to it through a cloneable [`QueueHandle`]:
//!
//! ```text
//! QueueHandle ──RunnerCommand──> QueueRunner ──spawn──> sweep task
//!      ^                             │                      │
//!      └────── oneshot reply ────────┘<──── JoinHandle ─────┘
//!                                    │
//!                                    └──broadcast──> report subscribers
//! ```
//!
//! Only one sweep task exists at a time. The next entry is started when the
//! previous task has returned its report, which happens after ramp-back. A
//! sweep task that dies without a report is ramped back by the runner.

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, DaqError};
use crate::executor::{AbortSignal, SweepExecutor, SweepProgress, SweepReport};
use crate::queue::{EntryTiming, MeasurementQueue, QueueEntry};
use crate::settings::MeasurementSettings;

const COMMAND_CAPACITY: usize = 32;
const REPORT_CAPACITY: usize = 64;

/// Commands accepted by the [`QueueRunner`].
#[derive(Debug)]
pub enum RunnerCommand {
    /// Append a measurement; starts it at once when nothing is running.
    Enqueue {
        settings: Box<MeasurementSettings>,
        response: oneshot::Sender<AppResult<u64>>,
    },
    /// Delete the pending entry at `position` (0 = next to run).
    Remove {
        position: usize,
        response: oneshot::Sender<AppResult<QueueEntry>>,
    },
    /// Snapshot of the running and pending measurements.
    List {
        response: oneshot::Sender<QueueSnapshot>,
    },
    /// Stop the running sweep. Replies whether one was running.
    Abort { response: oneshot::Sender<bool> },
    /// Reply once nothing is running and nothing is pending.
    WaitIdle { response: oneshot::Sender<()> },
    /// Abort, wait for ramp-back, drop pending entries and stop the actor.
    Shutdown { response: oneshot::Sender<()> },
}

impl RunnerCommand {
    /// Helper to create an Enqueue command
    pub fn enqueue(settings: MeasurementSettings) -> (Self, oneshot::Receiver<AppResult<u64>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Enqueue {
                settings: Box::new(settings),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Remove command
    pub fn remove(position: usize) -> (Self, oneshot::Receiver<AppResult<QueueEntry>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Remove { position, response: tx }, rx)
    }

    /// Helper to create a List command
    pub fn list() -> (Self, oneshot::Receiver<QueueSnapshot>) {
        let (tx, rx) = oneshot::channel();
        (Self::List { response: tx }, rx)
    }

    /// Helper to create an Abort command
    pub fn abort() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    /// Helper to create a WaitIdle command
    pub fn wait_idle() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::WaitIdle { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// The sweep currently executing.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInfo {
    pub id: u64,
    pub name: String,
    pub points_done: usize,
    pub points_total: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    #[serde(with = "humantime_serde")]
    pub remaining: Duration,
}

/// State of the waiting list as seen by clients.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub running: Option<RunningInfo>,
    /// Pending entries with their expected start and finish
    pub pending: Vec<EntryTiming>,
    /// Time until everything queued has finished
    #[serde(with = "humantime_serde")]
    pub total_remaining: Duration,
}

struct CurrentSweep {
    id: u64,
    name: String,
    settings: MeasurementSettings,
    estimated: Duration,
    started: Instant,
    progress: watch::Receiver<SweepProgress>,
    task: JoinHandle<SweepReport>,
}

/// Actor owning the queue and executing its entries one by one.
pub struct QueueRunner {
    queue: MeasurementQueue,
    executor: SweepExecutor,
    abort: AbortSignal,
    reports: broadcast::Sender<SweepReport>,
    current: Option<CurrentSweep>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    stopping: bool,
}

impl QueueRunner {
    /// Spawn the actor and return its handle.
    pub fn spawn(executor: SweepExecutor, max_entries: usize) -> (QueueHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);

        let runner = Self {
            queue: MeasurementQueue::new(max_entries),
            executor,
            abort: AbortSignal::new(),
            reports: reports.clone(),
            current: None,
            idle_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
            stopping: false,
        };
        let task = tokio::spawn(runner.run(command_rx));
        (
            QueueHandle {
                command_tx,
                reports,
            },
            task,
        )
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<RunnerCommand>) {
        info!(capacity = self.queue.capacity(), "Queue runner started");
        let mut handles_open = true;
        loop {
            tokio::select! {
                command = command_rx.recv(), if handles_open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All queue handles dropped");
                        handles_open = false;
                        self.begin_shutdown(None);
                    }
                },
                joined = join_sweep(&mut self.current) => self.finish_current(joined).await,
            }

            if self.stopping && self.current.is_none() {
                for response in self.shutdown_waiters.drain(..) {
                    let _ = response.send(());
                }
                break;
            }
        }
        self.notify_idle();
        info!("Queue runner stopped");
    }

    fn handle(&mut self, command: RunnerCommand) {
        match command {
            RunnerCommand::Enqueue { settings, response } => {
                let result = self.enqueue(*settings);
                let _ = response.send(result);
            }
            RunnerCommand::Remove { position, response } => {
                let result = self.queue.remove_at(position);
                if let Ok(entry) = &result {
                    info!(id = entry.id, position, name = %entry.settings.name, "Removed from queue");
                }
                let _ = response.send(result);
                self.notify_idle();
            }
            RunnerCommand::List { response } => {
                let _ = response.send(self.snapshot());
            }
            RunnerCommand::Abort { response } => {
                let running = self.current.is_some();
                if running {
                    info!("Abort requested");
                    self.abort.abort();
                }
                let _ = response.send(running);
            }
            RunnerCommand::WaitIdle { response } => {
                self.idle_waiters.push(response);
                self.notify_idle();
            }
            RunnerCommand::Shutdown { response } => self.begin_shutdown(Some(response)),
        }
    }

    fn enqueue(&mut self, settings: MeasurementSettings) -> AppResult<u64> {
        if self.stopping {
            return Err(DaqError::RunnerStopped);
        }
        let estimated = self.executor.estimate(&settings)?;
        let name = settings.name.clone();
        let (id, _) = self.queue.push(settings, estimated)?;
        info!(id, name = %name, estimated = ?estimated, pending = self.queue.len(), "Queued");
        self.start_next();
        Ok(id)
    }

    fn begin_shutdown(&mut self, response: Option<oneshot::Sender<()>>) {
        let dropped = self.queue.len();
        while self.queue.pop_front().is_some() {}
        if dropped > 0 {
            warn!(dropped, "Dropping pending measurements on shutdown");
        }
        if self.current.is_some() {
            info!("Shutdown: aborting running sweep");
            self.abort.abort();
        }
        self.shutdown_waiters.extend(response);
        self.stopping = true;
    }

    /// Start the head entry if nothing is running.
    fn start_next(&mut self) {
        if self.current.is_some() || self.stopping {
            return;
        }
        let Some(entry) = self.queue.pop_front() else {
            return;
        };

        self.abort.reset();
        let (progress_tx, progress_rx) = watch::channel(SweepProgress::default());
        let executor = self.executor.clone();
        let abort = self.abort.clone();
        let settings = entry.settings;
        let name = settings.name.clone();
        info!(id = entry.id, name = %name, "Starting queued measurement");

        let task_settings = settings.clone();
        let task = tokio::spawn(async move {
            match executor
                .execute(&task_settings, &abort, Some(&progress_tx))
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    error!(name = %task_settings.name, error = %e, "Measurement rejected");
                    SweepReport::rejected(&task_settings, &e)
                }
            }
        });

        self.current = Some(CurrentSweep {
            id: entry.id,
            name,
            settings,
            estimated: entry.estimated,
            started: Instant::now(),
            progress: progress_rx,
            task,
        });
    }

    async fn finish_current(&mut self, joined: Result<SweepReport, JoinError>) {
        let Some(current) = self.current.take() else {
            return;
        };
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                error!(id = current.id, name = %current.name, error = %e, "Sweep task failed, ramping back");
                self.executor
                    .recover(&current.settings, format!("sweep task failed: {e}"))
                    .await
            }
        };
        info!(
            name = %report.name,
            state = %report.state,
            points = report.points_done,
            "Measurement finished"
        );
        // No subscribers is fine
        let _ = self.reports.send(report);
        self.start_next();
        self.notify_idle();
    }

    fn snapshot(&self) -> QueueSnapshot {
        let running = self.current.as_ref().map(|current| {
            let progress = current.progress.borrow();
            let elapsed = current.started.elapsed();
            RunningInfo {
                id: current.id,
                name: current.name.clone(),
                points_done: progress.points_done,
                points_total: progress.points_total,
                elapsed,
                remaining: current.estimated.saturating_sub(elapsed),
            }
        });
        let remaining_current = running.as_ref().map_or(Duration::ZERO, |r| r.remaining);
        let pending = self.queue.completion_times(remaining_current);
        let total_remaining = pending
            .last()
            .map_or(remaining_current, |timing| timing.finishes_in);
        QueueSnapshot {
            running,
            pending,
            total_remaining,
        }
    }

    fn notify_idle(&mut self) {
        if self.current.is_none() && self.queue.is_empty() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

/// Resolves when the running sweep task ends; pending while idle.
async fn join_sweep(current: &mut Option<CurrentSweep>) -> Result<SweepReport, JoinError> {
    match current {
        Some(current) => (&mut current.task).await,
        None => std::future::pending().await,
    }
}

/// Cloneable client of a [`QueueRunner`].
#[derive(Clone)]
pub struct QueueHandle {
    command_tx: mpsc::Sender<RunnerCommand>,
    reports: broadcast::Sender<SweepReport>,
}

impl QueueHandle {
    async fn request<T>(
        &self,
        (command, rx): (RunnerCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DaqError::RunnerStopped)?;
        rx.await.map_err(|_| DaqError::RunnerStopped)
    }

    /// Queue a measurement and return its id.
    pub async fn enqueue(&self, settings: MeasurementSettings) -> AppResult<u64> {
        self.request(RunnerCommand::enqueue(settings)).await?
    }

    /// Delete the pending entry at `position`.
    pub async fn remove(&self, position: usize) -> AppResult<QueueEntry> {
        self.request(RunnerCommand::remove(position)).await?
    }

    pub async fn list(&self) -> AppResult<QueueSnapshot> {
        self.request(RunnerCommand::list()).await
    }

    /// Abort the running sweep; `false` when nothing was running.
    pub async fn abort(&self) -> AppResult<bool> {
        self.request(RunnerCommand::abort()).await
    }

    /// Wait until the queue has drained.
    pub async fn wait_idle(&self) -> AppResult<()> {
        self.request(RunnerCommand::wait_idle()).await
    }

    /// Stop the runner after the running sweep has ramped back.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(RunnerCommand::shutdown()).await
    }

    /// Receive every finished [`SweepReport`].
    pub fn subscribe(&self) -> broadcast::Receiver<SweepReport> {
        self.reports.subscribe()
    }
}
