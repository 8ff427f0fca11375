//! Background dump runs on a small worker pool.
//!
//! Runs are keyed by `(stream, kind)`. A trigger for a key that is already
//! queued is coalesced into the queued run; a trigger arriving while the run
//! executes queues one more run. Failed runs are retried up to
//! `max_attempts` times and every failure goes to an [`ErrorTracker`].

use crate::error::{HarvestError, Result};
use crate::repository::{DumpReport, Repository};
use crate::types::StreamId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Scheduler configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub workers: usize,

    /// Attempts per run, including the first.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Append a delta to the stream's chain.
    Delta,
    /// Start a new chain with a full dump.
    FullDump,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Job {
    pub stream: StreamId,
    pub kind: JobKind,
}

/// Receives failed runs.
pub trait ErrorTracker: Send + Sync {
    fn report(&self, job: Job, attempt: u32, error: &HarvestError);
}

/// Logs failures through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorTracker;

impl ErrorTracker for TracingErrorTracker {
    fn report(&self, job: Job, attempt: u32, error: &HarvestError) {
        error!(
            stream = %job.stream,
            kind = ?job.kind,
            attempt,
            %error,
            "dump run failed"
        );
    }
}

enum Message {
    Run { job: Job, attempt: u32 },
    Stop,
}

/// Queued keys plus the number of runs not yet finished.
#[derive(Default)]
struct Pending {
    state: Mutex<PendingState>,
    idle: Condvar,
}

#[derive(Default)]
struct PendingState {
    queued: HashSet<Job>,
    outstanding: usize,
}

impl Pending {
    /// Mark a job queued; false if it already was.
    fn claim(&self, job: Job) -> bool {
        let mut state = self.state.lock();
        if !state.queued.insert(job) {
            return false;
        }
        state.outstanding += 1;
        true
    }

    /// The job left the queue and is about to run.
    fn started(&self, job: &Job) {
        self.state.lock().queued.remove(job);
    }

    /// A run finished for good (success or final failure).
    fn finished(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.idle.wait(&mut state);
        }
    }
}

struct Shared {
    repository: Arc<Repository>,
    tracker: Arc<dyn ErrorTracker>,
    pending: Pending,
    max_attempts: u32,
    sender: Sender<Message>,
}

impl Shared {
    fn run(&self, job: Job) -> Result<DumpReport> {
        match job.kind {
            JobKind::Delta => self.repository.compute_delta(job.stream),
            JobKind::FullDump => self.repository.generate_full_dump(job.stream),
        }
    }
}

/// Worker pool running dump generation for streams.
pub struct DumpScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl DumpScheduler {
    /// Start workers that report failures through `tracing`.
    pub fn start(repository: Arc<Repository>, config: SchedulerConfig) -> Result<Self> {
        Self::with_tracker(repository, config, Arc::new(TracingErrorTracker))
    }

    pub fn with_tracker(
        repository: Arc<Repository>,
        config: SchedulerConfig,
        tracker: Arc<dyn ErrorTracker>,
    ) -> Result<Self> {
        if config.workers == 0 || config.max_attempts == 0 {
            return Err(HarvestError::Config(
                "scheduler needs at least one worker and one attempt".into(),
            ));
        }

        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            repository,
            tracker,
            pending: Pending::default(),
            max_attempts: config.max_attempts,
            sender,
        });

        let workers = (0..config.workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("dump-worker-{i}"))
                    .spawn(move || worker_loop(shared, receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self { shared, workers })
    }

    /// Queue a delta run for a stream. Returns false if one was already queued.
    pub fn enqueue(&self, stream: StreamId) -> bool {
        self.submit(Job {
            stream,
            kind: JobKind::Delta,
        })
    }

    /// Queue a full dump for a stream.
    pub fn enqueue_full_dump(&self, stream: StreamId) -> bool {
        self.submit(Job {
            stream,
            kind: JobKind::FullDump,
        })
    }

    /// Queue a delta run for every active stream; returns how many were queued.
    pub fn enqueue_all(&self) -> usize {
        self.shared
            .repository
            .active_streams()
            .into_iter()
            .filter(|stream| self.enqueue(stream.id))
            .count()
    }

    /// Block until every queued run has finished.
    pub fn wait_idle(&self) {
        self.shared.pending.wait_idle();
    }

    /// Stop the workers after the runs already queued ahead of the stop.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn submit(&self, job: Job) -> bool {
        if !self.shared.pending.claim(job) {
            debug!(stream = %job.stream, kind = ?job.kind, "run already queued");
            return false;
        }
        if self
            .shared
            .sender
            .send(Message::Run { job, attempt: 1 })
            .is_err()
        {
            self.shared.pending.started(&job);
            self.shared.pending.finished();
            return false;
        }
        true
    }

    fn stop_workers(&mut self) {
        for _ in &self.workers {
            let _ = self.shared.sender.send(Message::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DumpScheduler {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        let (job, attempt) = match message {
            Message::Stop => break,
            Message::Run { job, attempt } => (job, attempt),
        };

        shared.pending.started(&job);

        match shared.run(job) {
            Ok(report) if report.created => info!(
                stream = %job.stream,
                dump = %report.dump.id,
                skipped = report.diagnostics.len(),
                "dump run finished"
            ),
            Ok(_) => debug!(stream = %job.stream, "nothing to dump"),
            Err(e) => {
                shared.tracker.report(job, attempt, &e);
                if attempt < shared.max_attempts
                    && shared
                        .sender
                        .send(Message::Run {
                            job,
                            attempt: attempt + 1,
                        })
                        .is_ok()
                {
                    continue;
                }
            }
        }

        shared.pending.finished();
    }
}
