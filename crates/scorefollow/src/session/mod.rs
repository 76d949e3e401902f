//! Score-following session coordinator.
//!
//! One session per connection. After the init message the alignment job,
//! the stop listener and the position broadcaster run concurrently on the
//! connection task; whichever of the first two ends first decides the
//! outcome, and a single teardown routine releases everything the session
//! acquired.

mod broadcaster;
mod listener;
mod state;

pub use broadcaster::{broadcast_positions, send_if_changed, ChangeGate};
pub use listener::{listen_for_stop, StopSignal};
pub use state::{InvalidTransition, SessionStatus, StatusTracker};

use crate::engine::EngineRequest;
use crate::error::SessionError;
use crate::files::{FileKind, FileProvider, WorkDir};
use crate::metrics::{self, SessionKind};
use crate::position::{PositionStore, SessionKey};
use crate::protocol::{InitMessage, InputType, ServerMessage, SessionMode};
use crate::transport::{MessageSink, MessageSource};
use crate::worker::{AlignmentJob, AlignmentPool, JobHandle, WorkerOutcome};
use followconf::SessionConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Shared collaborators for score-following sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<PositionStore>,
    pub pool: Arc<AlignmentPool>,
    pub files: Arc<dyn FileProvider>,
    pub config: SessionConfig,
    /// Parent of per-session working directories.
    pub work_root: PathBuf,
}

/// What ended a session.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    StoppedByClient,
    WorkerSucceeded,
    WorkerFailed(SessionError),
    ConnectionLost,
    /// The init message was missing or invalid.
    InitFailed(SessionError),
}

impl SessionOutcome {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::StoppedByClient => "stopped_by_client",
            SessionOutcome::WorkerSucceeded => "worker_succeeded",
            SessionOutcome::WorkerFailed(_) => "worker_failed",
            SessionOutcome::ConnectionLost => "connection_lost",
            SessionOutcome::InitFailed(_) => "init_failed",
        }
    }

    fn final_status(&self) -> SessionStatus {
        match self {
            SessionOutcome::WorkerFailed(_) | SessionOutcome::InitFailed(_) => SessionStatus::Failed,
            _ => SessionStatus::Closed,
        }
    }

    fn terminal_message(&self) -> Option<ServerMessage> {
        match self {
            SessionOutcome::WorkerSucceeded => Some(ServerMessage::completed()),
            SessionOutcome::WorkerFailed(e) | SessionOutcome::InitFailed(e) => {
                Some(ServerMessage::error(e.to_string()))
            }
            SessionOutcome::StoppedByClient | SessionOutcome::ConnectionLost => None,
        }
    }
}

impl From<StopSignal> for SessionOutcome {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Requested => SessionOutcome::StoppedByClient,
            StopSignal::ConnectionLost => SessionOutcome::ConnectionLost,
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub key: Option<SessionKey>,
    pub outcome: SessionOutcome,
    pub history: Vec<SessionStatus>,
    pub duration: Duration,
}

impl SessionReport {
    pub fn status(&self) -> SessionStatus {
        self.history
            .last()
            .copied()
            .unwrap_or(SessionStatus::Initializing)
    }
}

/// Everything a session may hold when teardown runs.
#[derive(Default)]
struct Acquired {
    key: Option<SessionKey>,
    job: Option<JobHandle>,
    work_dir: Option<WorkDir>,
}

/// Run one score-following session to completion.
pub async fn run_alignment_session<S, K>(ctx: &SessionContext, mut source: S, mut sink: K) -> SessionReport
where
    S: MessageSource,
    K: MessageSink,
{
    let mut status = StatusTracker::new();

    let init = match source.recv_json().await {
        Ok(value) => InitMessage::from_value(value),
        Err(e) => Err(SessionError::Initialization(format!("no init message: {}", e))),
    };

    let init = match init {
        Ok(init) => init,
        Err(e) => {
            warn!("rejecting session: {}", e);
            let outcome = SessionOutcome::InitFailed(e);
            return teardown(ctx, &mut status, Acquired::default(), &mut sink, outcome).await;
        }
    };

    let key = SessionKey::new(init.file_id.clone());
    let span = info_span!(
        "session",
        session.key = %key,
        input = %init.input_type,
        mode = ?init.mode(),
    );

    async move {
        ctx.store.remove(&key);
        if let Err(e) = status.advance(SessionStatus::Running) {
            error!("{}", e);
        }
        info!("session running");

        let mut acquired = Acquired {
            key: Some(key.clone()),
            ..Acquired::default()
        };

        let mut gate = ChangeGate::new(ctx.config.position_epsilon);
        let outcome = {
            let alignment = run_alignment(ctx, &key, &init, &mut acquired.job, &mut acquired.work_dir);
            let stop = listen_for_stop(&mut source);
            let broadcast = broadcast_positions(
                &ctx.store,
                &key,
                &mut sink,
                ctx.config.broadcast_interval(),
                &mut gate,
            );

            tokio::select! {
                result = alignment => match result {
                    Ok(()) => SessionOutcome::WorkerSucceeded,
                    Err(e) => SessionOutcome::WorkerFailed(e),
                },
                signal = stop => signal.into(),
                never = broadcast => match never {},
            }
        };

        if matches!(outcome, SessionOutcome::WorkerSucceeded) {
            // the last position may have landed after the final tick
            send_if_changed(&ctx.store, &key, &mut sink, &mut gate).await;
        }

        teardown(ctx, &mut status, acquired, &mut sink, outcome).await
    }
    .instrument(span)
    .await
}

/// Fetch files, submit the job and wait for it.
///
/// Everything acquired is parked in the caller's slots so teardown can
/// release it even when this future is dropped midway.
async fn run_alignment(
    ctx: &SessionContext,
    key: &SessionKey,
    init: &InitMessage,
    job_slot: &mut Option<JobHandle>,
    work_slot: &mut Option<WorkDir>,
) -> Result<(), SessionError> {
    let work = WorkDir::create_in(&ctx.work_root)
        .map_err(|e| SessionError::Setup(format!("working directory: {}", e)))?;
    let dir = work_slot
        .insert(work)
        .path()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| SessionError::Setup("working directory already released".to_string()))?;

    let score = fetch(ctx.files.as_ref(), &init.file_id, FileKind::Score, &dir).await?;

    // uploaded scores are MusicXML; the cloud keeps a MIDI rendering of each
    let score_midi = match init.input_type {
        InputType::Midi => Some(fetch(ctx.files.as_ref(), &init.file_id, FileKind::Midi, &dir).await?),
        InputType::Audio => None,
    };

    let performance = match (init.mode(), init.input_type) {
        (SessionMode::PlaybackFile, InputType::Audio) => {
            Some(fetch(ctx.files.as_ref(), &init.file_id, FileKind::Audio, &dir).await?)
        }
        (SessionMode::PlaybackFile, InputType::Midi) => score_midi.clone(),
        (SessionMode::LiveDevice, _) => None,
    };

    let job = AlignmentJob {
        key: key.clone(),
        request: EngineRequest {
            score,
            mode: init.mode(),
            input_type: init.input_type,
            score_midi,
            performance,
            device: init.device.clone(),
            frame_rate: ctx.config.frame_rate,
        },
        store: Arc::clone(&ctx.store),
    };

    let handle = ctx
        .pool
        .submit(job)
        .await
        .map_err(|e| SessionError::Setup(e.to_string()))?;

    match job_slot.insert(handle).wait().await {
        WorkerOutcome::Completed => Ok(()),
        WorkerOutcome::Failed(e) => Err(e.into()),
        WorkerOutcome::Cancelled => Err(SessionError::Setup("alignment was cancelled".to_string())),
    }
}

async fn fetch(
    files: &dyn FileProvider,
    id: &str,
    kind: FileKind,
    dir: &std::path::Path,
) -> Result<PathBuf, SessionError> {
    files.fetch(id, kind, dir).await.ok_or_else(|| SessionError::Retrieval {
        id: id.to_string(),
        kind,
    })
}

/// The one exit path for every session.
async fn teardown<K>(
    ctx: &SessionContext,
    status: &mut StatusTracker,
    mut acquired: Acquired,
    sink: &mut K,
    outcome: SessionOutcome,
) -> SessionReport
where
    K: MessageSink + ?Sized,
{
    if status.current() == SessionStatus::Running {
        if let Err(e) = status.advance(SessionStatus::Stopping) {
            error!("{}", e);
        }
    }

    if let Some(job) = acquired.job.as_mut() {
        if !job.is_finished() {
            if job.cancel() {
                await_cancelled(job, ctx.config.cancel_warn_after()).await;
            } else {
                debug!("withdrew alignment job still waiting for the worker");
            }
        }
    }

    if let Some(key) = &acquired.key {
        ctx.store.remove(key);
    }

    if let Some(message) = outcome.terminal_message() {
        if let Err(e) = sink.send(&message).await {
            warn!("could not deliver final message: {}", e);
        }
    }
    sink.close().await;

    if let Some(mut work) = acquired.work_dir.take() {
        work.release();
    }

    let final_status = outcome.final_status();
    if let Err(e) = status.advance(final_status) {
        error!("{}", e);
    }

    match &outcome {
        SessionOutcome::WorkerFailed(e) | SessionOutcome::InitFailed(e) => {
            error!(session.status = %final_status, error.kind = e.kind(), "session failed: {}", e)
        }
        other => info!(session.status = %final_status, outcome = other.label(), "session ended"),
    }

    let duration = status.elapsed();
    metrics::record_session_end(SessionKind::Alignment, outcome.label(), final_status, duration);

    SessionReport {
        key: acquired.key,
        outcome,
        history: status.history().to_vec(),
        duration,
    }
}

/// Wait for a cancelled job, warning while the engine is stuck in a blocking call.
async fn await_cancelled(job: &mut JobHandle, warn_after: Duration) -> WorkerOutcome {
    loop {
        match tokio::time::timeout(warn_after, job.wait()).await {
            Ok(outcome) => return outcome,
            Err(_) => warn!("alignment engine has not returned since cancellation; still waiting"),
        }
    }
}
