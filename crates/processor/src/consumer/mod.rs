//! Checkpointing consumer
//!
//! Reads one partition in offset order, applies every message concurrently
//! through a [`Materializer`] and periodically records how far the view is
//! guaranteed to be materialized.
//!
//! # Checkpoint cycles
//!
//! Messages are dispatched into the current task generation. A cycle starts
//! when the generation holds `flush_capacity` messages or when
//! `flush_interval` elapses, whichever comes first. Starting a cycle seals the
//! generation and swaps in a fresh one so intake continues; the cycle waits
//! for every task of the sealed generation and only then commits its highest
//! offset. At most one cycle is outstanding; a trigger firing meanwhile is
//! deferred until the cycle finishes, and intake pauses while the current
//! generation is full.
//!
//! # Failures
//!
//! A source error, a failed apply or a panicking apply task terminates the
//! consumer without committing anything further. The [`FatalHandler`] decides
//! what terminating means; [`ExitProcess`] exits the process so the
//! supervisor restarts it from the last checkpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use viewsync_processor::checkpoint::{CheckpointGuard, InMemoryCheckpointStore};
//! use viewsync_processor::consumer::CheckpointingConsumer;
//! use viewsync_processor::materializer::RawPassthrough;
//! use viewsync_processor::source::ChannelSource;
//! use viewsync_processor::state::MemoryViewStore;
//! use viewsync_processor::ConsumerConfig;
//! use viewsync_types::{CheckpointScope, Message};
//!
//! # async fn example() -> viewsync_processor::Result<()> {
//! let scope = CheckpointScope::new("details", "products", 0);
//! let (source, feed) = ChannelSource::new();
//! let guard = Arc::new(CheckpointGuard::new(
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     scope.clone(),
//! ));
//!
//! let handle = CheckpointingConsumer::new(
//!     scope,
//!     Box::new(source),
//!     Arc::new(RawPassthrough::new(MemoryViewStore::new())),
//!     guard,
//!     ConsumerConfig::default(),
//! )?
//! .start();
//!
//! feed.push(Message::upsert("p-1", "red", 1));
//! let report = handle.stop().await?;
//! assert_eq!(report.final_checkpoint, Some(1));
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use viewsync_types::CheckpointScope;

use crate::checkpoint::CheckpointGuard;
use crate::config::ConsumerConfig;
use crate::error::{ProcessorError, Result, SourceError};
use crate::materializer::Materializer;
use crate::source::{OrderedSource, SourceEvent};

mod apply;
mod generation;

use apply::ApplyPolicy;
use generation::{DrainSummary, SealedGeneration, TaskGeneration};

/// Lifecycle state of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created, not yet reading
    Init,
    /// Reading and applying messages
    Running,
    /// Draining in-flight work before the final commit
    Stopping,
    /// Stopped gracefully; terminal
    Stopped,
    /// Terminated by a fatal error; terminal
    Failed,
}

impl ConsumerState {
    /// Whether the consumer can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Failed)
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConsumerState::Init => "init",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What triggered a checkpoint cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The generation reached `flush_capacity`
    Count,
    /// `flush_interval` elapsed
    Timer,
}

/// Running counters published while the consumer runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerProgress {
    /// Highest offset read from the source
    pub highest_seen: Option<i64>,
    /// Last checkpoint committed by this consumer or loaded at start
    pub last_committed: Option<i64>,
    /// Messages dispatched and not yet completed in the current generation
    pub in_flight: usize,
    /// Whether a checkpoint cycle is outstanding
    pub cycle_outstanding: bool,
    /// Messages dispatched to apply tasks
    pub messages_dispatched: u64,
    /// Cycles started by the count trigger
    pub cycles_by_count: u64,
    /// Cycles started by the timer
    pub cycles_by_timer: u64,
    /// Successful checkpoint commits
    pub commits: u64,
}

/// Summary returned by a graceful stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Checkpoint written by the final commit
    pub final_checkpoint: Option<i64>,
    /// Cycles started by the count trigger
    pub cycles_by_count: u64,
    /// Cycles started by the timer
    pub cycles_by_timer: u64,
    /// Successful checkpoint commits, the final one included
    pub commits: u64,
    /// Commits that failed and were retried by a later cycle
    pub commit_failures: u64,
    /// Messages dispatched to apply tasks
    pub messages_dispatched: u64,
    /// Messages applied
    pub messages_applied: u64,
    /// Malformed messages dropped by the decode policy
    pub messages_skipped: u64,
}

/// Invoked once when the consumer hits a fatal error
pub trait FatalHandler: Send + Sync {
    /// Handle `error`; may not return
    fn on_fatal(&self, scope: &CheckpointScope, error: &ProcessorError);
}

/// Exits the process with status 1
///
/// The supervisor restarts the process, which resumes from the last
/// committed checkpoint and re-applies everything after it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn on_fatal(&self, scope: &CheckpointScope, error: &ProcessorError) {
        error!(scope = %scope, class = %error.class(), "Exiting on fatal error: {}", error);
        std::process::exit(1);
    }
}

/// Leaves termination to the caller
///
/// The consumer stops in [`ConsumerState::Failed`] and the error is returned
/// from [`ConsumerHandle::stop`] or [`ConsumerHandle::terminated`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagateError;

impl FatalHandler for PropagateError {
    fn on_fatal(&self, _scope: &CheckpointScope, _error: &ProcessorError) {}
}

/// Consumer materializing one partition into a view
pub struct CheckpointingConsumer {
    scope: CheckpointScope,
    source: Box<dyn OrderedSource>,
    materializer: Arc<dyn Materializer>,
    checkpoints: Arc<CheckpointGuard>,
    config: ConsumerConfig,
    fatal: Arc<dyn FatalHandler>,
}

impl CheckpointingConsumer {
    /// Create a consumer in [`ConsumerState::Init`]
    ///
    /// `source` must already be positioned after the checkpoint held by
    /// `checkpoints`. Fatal errors exit the process unless another handler
    /// is installed with [`with_fatal_handler`](Self::with_fatal_handler).
    pub fn new(
        scope: CheckpointScope,
        source: Box<dyn OrderedSource>,
        materializer: Arc<dyn Materializer>,
        checkpoints: Arc<CheckpointGuard>,
        config: ConsumerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if checkpoints.scope() != &scope {
            return Err(ProcessorError::Configuration(format!(
                "checkpoint guard scope {} does not match consumer scope {}",
                checkpoints.scope(),
                scope
            )));
        }

        Ok(Self {
            scope,
            source,
            materializer,
            checkpoints,
            config,
            fatal: Arc::new(ExitProcess),
        })
    }

    /// Replace the fatal error handler
    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal = handler;
        self
    }

    /// Spawn the control loop and return its handle
    pub fn start(self) -> ConsumerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ConsumerState::Init);
        let (progress_tx, progress_rx) = watch::channel(ConsumerProgress::default());

        let control = ControlLoop {
            policy: Arc::new(ApplyPolicy::from(&self.config)),
            timer: Box::pin(tokio::time::sleep(self.config.flush_interval)),
            scope: self.scope,
            source: self.source,
            materializer: self.materializer,
            checkpoints: self.checkpoints,
            config: self.config,
            fatal: self.fatal,
            current: TaskGeneration::new(0),
            cycle: None,
            pending: None,
            progress: ConsumerProgress::default(),
            report: ConsumerReport::default(),
            state_tx,
            progress_tx,
        };

        ConsumerHandle {
            stop_tx: Some(stop_tx),
            task: Some(tokio::spawn(control.run(stop_rx))),
            outcome: None,
            state: state_rx,
            progress: progress_rx,
        }
    }
}

/// Handle to a running consumer
///
/// Dropping the handle requests a graceful stop.
#[derive(Debug)]
pub struct ConsumerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<ConsumerReport>>>,
    outcome: Option<Result<ConsumerReport>>,
    state: watch::Receiver<ConsumerState>,
    progress: watch::Receiver<ConsumerProgress>,
}

impl ConsumerHandle {
    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Latest published progress
    pub fn progress(&self) -> ConsumerProgress {
        self.progress.borrow().clone()
    }

    /// Subscribe to progress updates
    pub fn watch_progress(&self) -> watch::Receiver<ConsumerProgress> {
        self.progress.clone()
    }

    /// Wait until the consumer terminates on its own
    ///
    /// Completes only after a fatal error; a healthy consumer runs until
    /// [`stop`](Self::stop). Cancel safe.
    pub async fn terminated(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(task) = self.task.as_mut() {
            let outcome = flatten_join(task.await);
            self.task = None;
            self.outcome = Some(outcome);
        }
    }

    /// Request a graceful stop and wait for it
    ///
    /// Intake stops, the outstanding cycle and every in-flight message are
    /// awaited, the highest dispatched offset is committed once and the
    /// source is closed. Returns the error instead if the consumer already
    /// failed or fails while draining.
    pub async fn stop(mut self) -> Result<ConsumerReport> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.terminated().await;
        self.outcome.take().unwrap_or_else(|| {
            Err(ProcessorError::NotRunning(
                "consumer outcome already taken".into(),
            ))
        })
    }
}

fn flatten_join(
    joined: std::result::Result<Result<ConsumerReport>, tokio::task::JoinError>,
) -> Result<ConsumerReport> {
    joined.unwrap_or_else(|e| {
        Err(ProcessorError::TaskAborted {
            offset: None,
            reason: format!("consumer control loop: {}", e),
        })
    })
}

/// Result of one checkpoint cycle task
enum CycleOutcome {
    /// Every task drained and the checkpoint was written
    Committed(DrainSummary),
    /// Every task drained but the checkpoint write failed
    CommitFailed(DrainSummary, ProcessorError),
    /// A task of the sealed generation failed
    Failed(ProcessorError),
}

async fn run_cycle(
    generation: SealedGeneration,
    checkpoints: Arc<CheckpointGuard>,
) -> CycleOutcome {
    let id = generation.id();
    let size = generation.dispatched();

    let summary = match generation.drain().await {
        Ok(summary) => summary,
        Err(e) => return CycleOutcome::Failed(e),
    };

    let Some(offset) = summary.highest else {
        return CycleOutcome::Committed(summary);
    };

    debug!(generation = id, size, offset, "Generation drained");
    match checkpoints.commit(offset).await {
        Ok(()) => CycleOutcome::Committed(summary),
        Err(e) => CycleOutcome::CommitFailed(summary, e.into()),
    }
}

/// Waits for the outstanding cycle; pending forever when there is none
async fn wait_cycle(
    cycle: &mut Option<JoinHandle<CycleOutcome>>,
) -> std::result::Result<CycleOutcome, tokio::task::JoinError> {
    match cycle.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

struct ControlLoop {
    scope: CheckpointScope,
    source: Box<dyn OrderedSource>,
    materializer: Arc<dyn Materializer>,
    checkpoints: Arc<CheckpointGuard>,
    config: ConsumerConfig,
    policy: Arc<ApplyPolicy>,
    fatal: Arc<dyn FatalHandler>,
    current: TaskGeneration,
    cycle: Option<JoinHandle<CycleOutcome>>,
    pending: Option<FlushTrigger>,
    timer: Pin<Box<Sleep>>,
    progress: ConsumerProgress,
    report: ConsumerReport,
    state_tx: watch::Sender<ConsumerState>,
    progress_tx: watch::Sender<ConsumerProgress>,
}

impl ControlLoop {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> Result<ConsumerReport> {
        self.progress.last_committed = self.checkpoints.last_committed().await;
        self.set_state(ConsumerState::Running);
        self.reset_timer();

        info!(
            scope = %self.scope,
            checkpoint = ?self.progress.last_committed,
            flush_interval = ?self.config.flush_interval,
            flush_capacity = self.config.flush_capacity,
            "Starting checkpointing consumer"
        );

        loop {
            let intake_open = self.intake_open();

            tokio::select! {
                _ = &mut stop_rx => break,

                event = self.source.next_event(), if intake_open => {
                    if let Err(e) = self.on_event(event) {
                        return Err(self.fail(e));
                    }
                }

                Some(done) = self.current.join_next() => {
                    if let Err(e) = done {
                        return Err(self.fail(e));
                    }
                }

                outcome = wait_cycle(&mut self.cycle) => {
                    self.cycle = None;
                    if let Err(e) = self.on_cycle_finished(outcome) {
                        return Err(self.fail(e));
                    }
                    if let Some(trigger) = self.pending.take() {
                        self.request_flush(trigger);
                    }
                }

                _ = &mut self.timer => {
                    self.reset_timer();
                    self.request_flush(FlushTrigger::Timer);
                }
            }

            self.publish_progress();
        }

        self.shutdown().await
    }

    /// Intake pauses while the current generation is full and cannot be
    /// sealed yet
    fn intake_open(&self) -> bool {
        !(self.cycle.is_some() && self.current.dispatched() >= self.config.flush_capacity)
    }

    fn on_event(&mut self, event: Option<SourceEvent>) -> Result<()> {
        match event {
            Some(SourceEvent::Message(message)) => {
                let offset = message.offset;
                if let Some(highest) = self.progress.highest_seen {
                    if offset <= highest {
                        warn!(offset, highest, "Source delivered an offset out of order");
                    }
                }
                self.progress.highest_seen =
                    Some(self.progress.highest_seen.map_or(offset, |h| h.max(offset)));
                self.progress.messages_dispatched += 1;

                self.current
                    .dispatch(message, self.materializer.clone(), self.policy.clone());

                if self.current.dispatched() >= self.config.flush_capacity {
                    self.request_flush(FlushTrigger::Count);
                }
                Ok(())
            }
            Some(SourceEvent::Error(e)) => Err(e.into()),
            Some(SourceEvent::Notification(notification)) => {
                info!(scope = %self.scope, "Source notification: {}", notification);
                Ok(())
            }
            None => Err(SourceError::Ended {
                topic: self.scope.topic.clone(),
                partition: self.scope.partition,
            }
            .into()),
        }
    }

    /// Start a checkpoint cycle, or defer it while one is outstanding
    fn request_flush(&mut self, trigger: FlushTrigger) {
        if self.current.is_empty() {
            return;
        }

        if self.cycle.is_some() {
            // a count trigger wins over a timer one so it is reported as such
            if self.pending != Some(FlushTrigger::Count) {
                self.pending = Some(trigger);
            }
            return;
        }

        let next = TaskGeneration::new(self.current.id() + 1);
        let sealed = std::mem::replace(&mut self.current, next).seal();

        debug!(
            generation = sealed.id(),
            size = sealed.dispatched(),
            offset = ?sealed.highest_offset(),
            trigger = ?trigger,
            "Starting checkpoint cycle"
        );

        match trigger {
            FlushTrigger::Count => self.progress.cycles_by_count += 1,
            FlushTrigger::Timer => self.progress.cycles_by_timer += 1,
        }

        self.cycle = Some(tokio::spawn(run_cycle(sealed, self.checkpoints.clone())));
        self.reset_timer();
    }

    fn on_cycle_finished(
        &mut self,
        outcome: std::result::Result<CycleOutcome, tokio::task::JoinError>,
    ) -> Result<()> {
        let outcome = outcome.map_err(|e| ProcessorError::TaskAborted {
            offset: None,
            reason: format!("checkpoint cycle: {}", e),
        })?;

        match outcome {
            CycleOutcome::Committed(summary) => {
                self.record_drained(&summary);
                if summary.highest.is_some() {
                    self.progress.commits += 1;
                    self.progress.last_committed = summary.highest;
                }
                Ok(())
            }
            CycleOutcome::CommitFailed(summary, e) => {
                self.record_drained(&summary);
                self.report.commit_failures += 1;
                warn!(
                    scope = %self.scope,
                    offset = ?summary.highest,
                    "Checkpoint commit failed, a later cycle will cover it: {}", e
                );
                Ok(())
            }
            CycleOutcome::Failed(e) => Err(e),
        }
    }

    fn record_drained(&mut self, summary: &DrainSummary) {
        self.report.messages_applied += summary.applied;
        self.report.messages_skipped += summary.skipped;
    }

    async fn shutdown(mut self) -> Result<ConsumerReport> {
        self.set_state(ConsumerState::Stopping);
        info!(
            scope = %self.scope,
            in_flight = self.current.in_flight(),
            oldest_in_flight = ?self.current.oldest_in_flight(),
            cycle_outstanding = self.cycle.is_some(),
            "Stopping consumer, draining in-flight messages"
        );

        if let Some(cycle) = self.cycle.take() {
            let outcome = cycle.await;
            if let Err(e) = self.on_cycle_finished(outcome) {
                return Err(self.fail(e));
            }
        }

        let last = std::mem::replace(&mut self.current, TaskGeneration::new(0)).seal();
        match last.drain().await {
            Ok(summary) => self.record_drained(&summary),
            Err(e) => return Err(self.fail(e)),
        }
        self.pending = None;

        let final_offset = self.progress.highest_seen.or(self.progress.last_committed);
        let mut result = Ok(());
        if let Some(offset) = final_offset {
            match self.checkpoints.commit(offset).await {
                Ok(()) => {
                    self.progress.commits += 1;
                    self.progress.last_committed = Some(offset);
                    self.report.final_checkpoint = Some(offset);
                }
                Err(e) => {
                    error!(scope = %self.scope, offset, "Final checkpoint commit failed: {}", e);
                    self.report.commit_failures += 1;
                    result = Err(ProcessorError::from(e));
                }
            }
        }

        self.source.close().await;
        self.set_state(ConsumerState::Stopped);
        self.publish_progress();

        let report = self.build_report();
        info!(
            scope = %self.scope,
            checkpoint = ?report.final_checkpoint,
            applied = report.messages_applied,
            cycles_by_count = report.cycles_by_count,
            cycles_by_timer = report.cycles_by_timer,
            "Consumer stopped"
        );
        result.map(|_| report)
    }

    /// Tear down after a fatal error
    ///
    /// The outstanding cycle is aborted so no checkpoint past the last
    /// drained generation is written, and the source is left as is.
    fn fail(&mut self, error: ProcessorError) -> ProcessorError {
        if let Some(cycle) = self.cycle.take() {
            cycle.abort();
        }
        self.pending = None;

        error!(
            scope = %self.scope,
            offset = ?error.offset(),
            highest_seen = ?self.progress.highest_seen,
            last_committed = ?self.progress.last_committed,
            oldest_in_flight = ?self.current.oldest_in_flight(),
            class = %error.class(),
            "Consumer failed: {}", error
        );

        self.set_state(ConsumerState::Failed);
        self.publish_progress();
        self.fatal.on_fatal(&self.scope, &error);
        error
    }

    fn build_report(&self) -> ConsumerReport {
        ConsumerReport {
            cycles_by_count: self.progress.cycles_by_count,
            cycles_by_timer: self.progress.cycles_by_timer,
            commits: self.progress.commits,
            messages_dispatched: self.progress.messages_dispatched,
            ..self.report.clone()
        }
    }

    fn reset_timer(&mut self) {
        self.timer
            .as_mut()
            .reset(Instant::now() + self.config.flush_interval);
    }

    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_replace(state);
    }

    fn publish_progress(&mut self) {
        self.progress.in_flight = self.current.in_flight();
        self.progress.cycle_outstanding = self.cycle.is_some();
        self.progress_tx.send_replace(self.progress.clone());
    }
}
