//! Tuner session: detection loop raced against the stop listener.

use super::{CaptureOpener, FrameSource, PitchDetector, PitchReading};
use crate::error::SessionError;
use crate::metrics::{self, SessionKind};
use crate::protocol::{ServerMessage, TunerInit};
use crate::session::{listen_for_stop, SessionStatus, StatusTracker, StopSignal};
use crate::transport::{MessageSink, MessageSource};
use followconf::TunerConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone)]
pub struct TunerContext {
    pub opener: Arc<dyn CaptureOpener>,
    pub config: TunerConfig,
}

#[derive(Debug, Clone)]
pub enum TunerOutcome {
    StoppedByClient,
    ConnectionLost,
    Failed(SessionError),
}

impl TunerOutcome {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TunerOutcome::StoppedByClient => "stopped_by_client",
            TunerOutcome::ConnectionLost => "connection_lost",
            TunerOutcome::Failed(_) => "failed",
        }
    }
}

impl From<StopSignal> for TunerOutcome {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Requested => TunerOutcome::StoppedByClient,
            StopSignal::ConnectionLost => TunerOutcome::ConnectionLost,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunerReport {
    pub outcome: TunerOutcome,
    pub history: Vec<SessionStatus>,
    pub duration: Duration,
}

impl TunerReport {
    pub fn status(&self) -> SessionStatus {
        self.history
            .last()
            .copied()
            .unwrap_or(SessionStatus::Initializing)
    }
}

pub async fn run_tuner_session<S, K>(ctx: &TunerContext, mut source: S, mut sink: K) -> TunerReport
where
    S: MessageSource,
    K: MessageSink,
{
    let mut status = StatusTracker::new();

    let init = match source.recv_json().await {
        Ok(value) => TunerInit::from_value(value),
        Err(e) => Err(SessionError::Initialization(format!("no init message: {}", e))),
    };
    let init = match init {
        Ok(init) => init,
        Err(e) => {
            warn!("rejecting tuner session: {}", e);
            return finish(&mut status, None, &mut sink, TunerOutcome::Failed(e)).await;
        }
    };

    let span = info_span!("tuner", device.index = init.device_index);
    async move {
        let mut capture = match ctx.opener.open(init.device_index, &ctx.config).await {
            Ok(capture) => capture,
            Err(e) => return finish(&mut status, None, &mut sink, TunerOutcome::Failed(e)).await,
        };

        if let Err(e) = status.advance(SessionStatus::Running) {
            error!("{}", e);
        }
        info!(sample_rate = capture.sample_rate(), "tuner running");

        let mut detector = PitchDetector::new(&ctx.config, capture.sample_rate());
        let outcome = {
            let detection = detection_loop(capture.as_mut(), &mut detector, &mut sink);
            let stop = listen_for_stop(&mut source);

            tokio::select! {
                ended = detection => ended,
                signal = stop => signal.into(),
            }
        };

        finish(&mut status, Some(capture), &mut sink, outcome).await
    }
    .instrument(span)
    .await
}

async fn detection_loop<K>(capture: &mut dyn FrameSource, detector: &mut PitchDetector, sink: &mut K) -> TunerOutcome
where
    K: MessageSink + ?Sized,
{
    loop {
        let Some(frame) = capture.next_frame().await else {
            return TunerOutcome::Failed(SessionError::DeviceUnavailable(
                "capture stream ended".to_string(),
            ));
        };

        let message = match detector.detect(&frame) {
            PitchReading::Pitch { frequency, volume } => ServerMessage::Pitch { frequency, volume },
            PitchReading::Silence { .. } | PitchReading::OutOfRange { .. } => ServerMessage::no_sound(),
        };

        if let Err(e) = sink.send(&message).await {
            debug!("tuner send failed: {}", e);
            return std::future::pending().await;
        }
    }
}

/// Release capture, report, then close the connection.
async fn finish<K>(
    status: &mut StatusTracker,
    capture: Option<Box<dyn FrameSource>>,
    sink: &mut K,
    outcome: TunerOutcome,
) -> TunerReport
where
    K: MessageSink + ?Sized,
{
    if status.current() == SessionStatus::Running {
        if let Err(e) = status.advance(SessionStatus::Stopping) {
            error!("{}", e);
        }
    }

    if let Some(mut capture) = capture {
        capture.release();
    }

    if let TunerOutcome::Failed(e) = &outcome {
        if let Err(send_err) = sink.send(&ServerMessage::error(e.to_string())).await {
            warn!("could not deliver tuner error: {}", send_err);
        }
    }
    sink.close().await;

    let final_status = match outcome {
        TunerOutcome::Failed(_) => SessionStatus::Failed,
        _ => SessionStatus::Closed,
    };
    if let Err(e) = status.advance(final_status) {
        error!("{}", e);
    }

    match &outcome {
        TunerOutcome::Failed(e) => error!(session.status = %final_status, error.kind = e.kind(), "tuner failed: {}", e),
        other => info!(session.status = %final_status, outcome = other.label(), "tuner ended"),
    }

    let duration = status.elapsed();
    metrics::record_session_end(SessionKind::Tuner, outcome.label(), final_status, duration);

    TunerReport {
        outcome,
        history: status.history().to_vec(),
        duration,
    }
}
