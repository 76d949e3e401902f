//! Session error taxonomy.
//!
//! Every component converts its local failures into one of these before the
//! coordinator sees them. A lost connection is not an error; it ends a
//! session the same way an explicit stop does.

use crate::engine::EngineError;
use crate::files::FileKind;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The first message on the connection was missing or malformed.
    #[error("invalid init message: {0}")]
    Initialization(String),

    /// The capture device could not be opened.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The file provider had nothing for this id.
    #[error("failed to retrieve {kind} file for id {id}")]
    Retrieval { id: String, kind: FileKind },

    /// The alignment engine failed.
    #[error("alignment failed: {0}")]
    Engine(#[from] EngineError),

    /// Local setup failed (working directory, worker pool).
    #[error("session setup failed: {0}")]
    Setup(String),
}

impl SessionError {
    /// Short, stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Initialization(_) => "initialization",
            SessionError::DeviceUnavailable(_) => "device_unavailable",
            SessionError::Retrieval { .. } => "retrieval",
            SessionError::Engine(_) => "engine",
            SessionError::Setup(_) => "setup",
        }
    }
}
