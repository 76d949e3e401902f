//! Waits for the client to ask the session to stop.

use crate::protocol::ControlMessage;
use crate::transport::MessageSource;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// The client sent `{"action": "stop"}`.
    Requested,
    /// Receiving failed; the client is assumed gone.
    ConnectionLost,
}

/// Resolve on the first stop message or receive failure.
///
/// Other messages are ignored. Dropping the future before it resolves
/// loses no stop message.
pub async fn listen_for_stop<S>(source: &mut S) -> StopSignal
where
    S: MessageSource + ?Sized,
{
    loop {
        match source.recv_json().await {
            Ok(value) => match serde_json::from_value::<ControlMessage>(value) {
                Ok(control) if control.is_stop() => {
                    info!("received stop signal");
                    return StopSignal::Requested;
                }
                Ok(control) => debug!(action = ?control.action, "ignoring control message"),
                Err(e) => debug!("ignoring non-control message: {}", e),
            },
            Err(e) => {
                info!("connection receive failed, stopping: {}", e);
                return StopSignal::ConnectionLost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory, TransportError};
    use serde_json::json;

    #[tokio::test]
    async fn test_stop_message() {
        let (mut source, _sink, client) = memory::pair();
        client.send_json(json!({ "action": "pause" }));
        client.send_json(json!([1, 2, 3]));
        client.stop();

        assert_eq!(listen_for_stop(&mut source).await, StopSignal::Requested);
    }

    #[tokio::test]
    async fn test_hang_up_is_connection_lost() {
        let (mut source, _sink, mut client) = memory::pair();
        client.hang_up();
        assert_eq!(listen_for_stop(&mut source).await, StopSignal::ConnectionLost);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_connection_lost() {
        let (mut source, _sink, client) = memory::pair();
        client.send_error(TransportError::Malformed("not json".to_string()));
        assert_eq!(listen_for_stop(&mut source).await, StopSignal::ConnectionLost);
    }
}
