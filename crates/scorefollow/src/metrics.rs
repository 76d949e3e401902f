//! Session metrics on the global OpenTelemetry meter.
//!
//! Instruments bind to whatever meter provider is installed when the first
//! session ends, so `telemetry::init` has to run before serving.

use crate::session::SessionStatus;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};
use std::sync::OnceLock;
use std::time::Duration;

/// Endpoint a session came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Alignment,
    Tuner,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Alignment => "alignment",
            SessionKind::Tuner => "tuner",
        }
    }
}

struct SessionMetrics {
    ended: Counter<u64>,
    duration: Histogram<f64>,
}

fn instruments() -> &'static SessionMetrics {
    static METRICS: OnceLock<SessionMetrics> = OnceLock::new();
    METRICS.get_or_init(|| {
        let meter = global::meter("scorefollow");
        SessionMetrics {
            ended: meter
                .u64_counter("scorefollow.sessions.ended")
                .with_description("Sessions ended, by kind, outcome and final status")
                .build(),
            duration: meter
                .f64_histogram("scorefollow.session.duration")
                .with_unit("s")
                .with_description("Time from connection to teardown")
                .build(),
        }
    })
}

fn attributes(kind: SessionKind, outcome: &'static str, status: SessionStatus) -> [KeyValue; 3] {
    [
        KeyValue::new("session.kind", kind.as_str()),
        KeyValue::new("session.outcome", outcome),
        KeyValue::new("session.status", status.as_str()),
    ]
}

/// Count a finished session and record how long it ran.
pub fn record_session_end(kind: SessionKind, outcome: &'static str, status: SessionStatus, duration: Duration) {
    let attributes = attributes(kind, outcome, status);
    let metrics = instruments();
    metrics.ended.add(1, &attributes);
    metrics.duration.record(duration.as_secs_f64(), &attributes);
}
