//! Periodic position updates to the client.

use crate::position::{PositionStore, SessionKey};
use crate::protocol::ServerMessage;
use crate::transport::MessageSink;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Admits a value only when it moved at least `epsilon` from the last
/// admitted value. The last value starts at 0.
#[derive(Debug, Clone)]
pub struct ChangeGate {
    last_sent: f64,
    epsilon: f64,
}

impl ChangeGate {
    pub fn new(epsilon: f64) -> Self {
        Self {
            last_sent: 0.0,
            epsilon,
        }
    }

    pub fn admit(&mut self, current: f64) -> bool {
        if (current - self.last_sent).abs() >= self.epsilon {
            self.last_sent = current;
            true
        } else {
            false
        }
    }

    pub fn last_sent(&self) -> f64 {
        self.last_sent
    }
}

/// Send the position for `key` every `interval` when it changed.
///
/// Never returns: once the connection is gone it parks until the session
/// drops it, leaving the stop listener to notice the disconnect.
pub async fn broadcast_positions<K>(
    store: &PositionStore,
    key: &SessionKey,
    sink: &mut K,
    interval: Duration,
    gate: &mut ChangeGate,
) -> Infallible
where
    K: MessageSink + ?Sized,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !sink.is_open() || !send_if_changed(store, key, sink, gate).await {
            break;
        }
    }

    std::future::pending().await
}

/// Send the current position if the gate admits it. False once sending failed.
pub async fn send_if_changed<K>(store: &PositionStore, key: &SessionKey, sink: &mut K, gate: &mut ChangeGate) -> bool
where
    K: MessageSink + ?Sized,
{
    let current = store.get(key);
    if !gate.admit(current) {
        return true;
    }

    match sink.send(&ServerMessage::position(current)).await {
        Ok(()) => true,
        Err(e) => {
            debug!(session.key = %key, "position send failed: {}", e);
            false
        }
    }
}
