//! Single-slot alignment worker pool.
//!
//! Alignment engines block on file and device I/O, so they run on one
//! dedicated OS thread instead of the async runtime. The job queue holds at
//! most one pending job: at most one alignment runs in the process at a time
//! and `submit` waits while the slot is taken.

use crate::engine::{EngineError, EngineFactory, EngineRequest, EngineStep, OpenedEngine};
use crate::position::{PositionStore, SessionKey};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How an alignment job ended.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Completed,
    Failed(EngineError),
    Cancelled,
}

#[derive(Debug, Error)]
#[error("alignment worker is not running")]
pub struct PoolClosed;

/// Work for the alignment thread.
pub struct AlignmentJob {
    pub key: SessionKey,
    pub request: EngineRequest,
    pub store: Arc<PositionStore>,
}

/// Where a submitted job is. A job is either withdrawn or started, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Withdrawn,
    Started,
}

fn lock_state(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move a queued job to started. False when it was withdrawn first.
fn claim(state: &Mutex<JobState>) -> bool {
    let mut state = lock_state(state);
    if *state == JobState::Queued {
        *state = JobState::Started;
        true
    } else {
        false
    }
}

struct Queued {
    job: AlignmentJob,
    token: CancellationToken,
    state: Arc<Mutex<JobState>>,
    reply: oneshot::Sender<WorkerOutcome>,
}

pub struct AlignmentPool {
    queue: mpsc::Sender<Queued>,
}

impl AlignmentPool {
    /// Spawn the worker thread. It exits once the pool is dropped.
    pub fn start(factory: Arc<dyn EngineFactory>) -> std::io::Result<Self> {
        let (queue, mut jobs) = mpsc::channel::<Queued>(1);

        std::thread::Builder::new()
            .name("alignment-worker".to_string())
            .spawn(move || {
                while let Some(queued) = jobs.blocking_recv() {
                    let Queued {
                        job,
                        token,
                        state,
                        reply,
                    } = queued;
                    let outcome = if claim(&state) {
                        run_job(factory.as_ref(), &job, &token)
                    } else {
                        debug!(session.key = %job.key, "skipping job withdrawn before start");
                        WorkerOutcome::Cancelled
                    };
                    let _ = reply.send(outcome);
                }
                debug!("alignment worker exiting");
            })?;

        Ok(Self { queue })
    }

    /// Queue a job, waiting for the slot if another job is pending.
    pub async fn submit(&self, job: AlignmentJob) -> Result<JobHandle, PoolClosed> {
        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(JobState::Queued));
        let (reply, outcome) = oneshot::channel();

        self.queue
            .send(Queued {
                job,
                token: token.clone(),
                state: Arc::clone(&state),
                reply,
            })
            .await
            .map_err(|_| PoolClosed)?;

        Ok(JobHandle {
            token,
            state,
            outcome,
            finished: None,
        })
    }
}

/// Handle to a submitted job.
pub struct JobHandle {
    token: CancellationToken,
    state: Arc<Mutex<JobState>>,
    outcome: oneshot::Receiver<WorkerOutcome>,
    finished: Option<WorkerOutcome>,
}

impl JobHandle {
    /// Ask the job to stop at its next step.
    ///
    /// A job still waiting in the queue is withdrawn and never opens an
    /// engine. Returns true when the job had already started, in which case
    /// only [`JobHandle::wait`] tells when it has actually stopped.
    pub fn cancel(&self) -> bool {
        self.token.cancel();
        let mut state = lock_state(&self.state);
        if *state == JobState::Queued {
            *state = JobState::Withdrawn;
        }
        *state == JobState::Started
    }

    /// True once the worker thread picked the job up.
    pub fn has_started(&self) -> bool {
        *lock_state(&self.state) == JobState::Started
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Wait for the job to end. Safe to call again, and safe to drop midway.
    pub async fn wait(&mut self) -> WorkerOutcome {
        if let Some(outcome) = &self.finished {
            return outcome.clone();
        }

        let outcome = (&mut self.outcome).await.unwrap_or_else(|_| {
            WorkerOutcome::Failed(EngineError::Failed(
                "alignment worker exited without reporting".to_string(),
            ))
        });
        self.finished = Some(outcome.clone());
        outcome
    }
}

fn run_job(factory: &dyn EngineFactory, job: &AlignmentJob, token: &CancellationToken) -> WorkerOutcome {
    info!(session.key = %job.key, score = %job.request.score.display(), "alignment started");

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let opened = factory.open(&job.request)?;
        drive(opened, job, token)
    }));

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => WorkerOutcome::Failed(e),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            WorkerOutcome::Failed(EngineError::Failed(format!("engine panicked: {}", message)))
        }
    };

    match &outcome {
        WorkerOutcome::Completed => info!(session.key = %job.key, "alignment completed"),
        WorkerOutcome::Cancelled => info!(session.key = %job.key, "alignment cancelled"),
        WorkerOutcome::Failed(e) => error!(session.key = %job.key, "alignment failed: {}", e),
    }
    outcome
}

/// Step the engine until it finishes, fails or is cancelled.
fn drive(opened: OpenedEngine, job: &AlignmentJob, token: &CancellationToken) -> Result<WorkerOutcome, EngineError> {
    let OpenedEngine { mut engine, beat_map } = opened;
    let mut last = f64::NEG_INFINITY;

    loop {
        if token.is_cancelled() {
            return Ok(WorkerOutcome::Cancelled);
        }

        match engine.step()? {
            EngineStep::Position(beat) => {
                let quarter = beat_map.beat_to_quarter(beat);
                if quarter < last {
                    warn!(session.key = %job.key, from = last, to = quarter, "position moved backwards");
                }
                last = quarter;
                job.store.set(&job.key, quarter);
            }
            EngineStep::Idle => {}
            EngineStep::Finished => return Ok(WorkerOutcome::Completed),
        }
    }
}
