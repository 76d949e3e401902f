//! Position store - latest known playback position per session.
//!
//! The alignment worker writes from its dedicated thread while the
//! broadcaster reads from the connection task. Writers never wait on readers;
//! writes to one key are serialized by the map shard lock and the last one wins.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies one session's entry in the store.
///
/// Carries the file id supplied at init plus a per-connection id, so two
/// connections following the same score never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub file_id: String,
    pub connection: Uuid,
}

impl SessionKey {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            connection: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id, self.connection)
    }
}

/// Shared map from session key to position in quarter notes.
#[derive(Debug, Default)]
pub struct PositionStore {
    positions: DashMap<SessionKey, f64>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite the position for `key`.
    pub fn set(&self, key: &SessionKey, position: f64) {
        self.positions.insert(key.clone(), position);
    }

    /// Last position written for `key`, or 0 when absent.
    pub fn get(&self, key: &SessionKey) -> f64 {
        self.positions.get(key).map(|p| *p).unwrap_or(0.0)
    }

    /// Drop the entry for `key`.
    pub fn remove(&self, key: &SessionKey) {
        self.positions.remove(key);
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.positions.clear();
    }

    /// Number of sessions with a recorded position.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
