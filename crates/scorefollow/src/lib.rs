//! scorefollow - local device service for live score following.
//!
//! A browser client opens a WebSocket, names a score, and receives the
//! performer's position in that score while an alignment engine follows a
//! live MIDI device or a recorded performance. A second endpoint streams
//! tuner readings from an audio input.
//!
//! Layout:
//! - [`session`] coordinates one score-following connection
//! - [`worker`] runs alignment engines on a dedicated thread
//! - [`position`] holds the latest position per session
//! - [`tuner`] captures audio and detects pitch
//! - [`web`] exposes everything over HTTP

pub mod devices;
pub mod engine;
pub mod error;
pub mod files;
pub mod metrics;
pub mod position;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod tuner;
pub mod web;
pub mod worker;

pub use error::SessionError;
pub use position::{PositionStore, SessionKey};
pub use session::{run_alignment_session, SessionContext, SessionOutcome, SessionReport, SessionStatus};
pub use tuner::{run_tuner_session, TunerContext};
pub use worker::AlignmentPool;
