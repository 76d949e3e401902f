//! Tuner sessions over the in-memory transport with a scripted capture device.

use async_trait::async_trait;
use followconf::TunerConfig;
use pretty_assertions::assert_eq;
use scorefollow::protocol::ServerMessage;
use scorefollow::transport::memory;
use scorefollow::tuner::{CaptureOpener, FrameSource, TunerOutcome, TunerReport};
use scorefollow::{run_tuner_session, SessionError, SessionStatus, TunerContext};
use serde_json::json;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const RATE: u32 = 44_100;

fn sine(freq: f32, amplitude: f32) -> Vec<f32> {
    (0..1024)
        .map(|n| amplitude * (2.0 * PI * freq * n as f32 / RATE as f32).sin())
        .collect()
}

struct ScriptedCapture {
    frames: VecDeque<Vec<f32>>,
    end_when_empty: bool,
    released: bool,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSource for ScriptedCapture {
    async fn next_frame(&mut self) -> Option<Vec<f32>> {
        match self.frames.pop_front() {
            Some(frame) => Some(frame),
            None if self.end_when_empty => None,
            None => std::future::pending().await,
        }
    }

    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ScriptedOpener {
    frames: Vec<Vec<f32>>,
    end_when_empty: bool,
    fail: bool,
    releases: Arc<AtomicUsize>,
    opened: Mutex<Vec<usize>>,
}

impl ScriptedOpener {
    fn new(frames: Vec<Vec<f32>>) -> Self {
        Self {
            frames,
            end_when_empty: false,
            fail: false,
            releases: Arc::new(AtomicUsize::new(0)),
            opened: Mutex::new(Vec::new()),
        }
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureOpener for ScriptedOpener {
    async fn open(&self, device_index: usize, _config: &TunerConfig) -> Result<Box<dyn FrameSource>, SessionError> {
        self.opened.lock().unwrap().push(device_index);
        if self.fail {
            return Err(SessionError::DeviceUnavailable(format!("no input device at index {}", device_index)));
        }
        Ok(Box::new(ScriptedCapture {
            frames: self.frames.clone().into(),
            end_when_empty: self.end_when_empty,
            released: false,
            releases: Arc::clone(&self.releases),
        }))
    }
}

fn start(opener: Arc<ScriptedOpener>) -> (tokio::task::JoinHandle<TunerReport>, memory::ClientEnd) {
    let ctx = TunerContext {
        opener,
        config: TunerConfig::default(),
    };
    let (source, sink, client) = memory::pair();
    let handle = tokio::spawn(async move { run_tuner_session(&ctx, source, sink).await });
    (handle, client)
}

#[tokio::test]
async fn test_readings_stream_until_stop() {
    let opener = Arc::new(ScriptedOpener::new(vec![
        sine(440.0, 0.5),
        sine(440.0, 0.001),
        sine(50.0, 0.5),
    ]));
    let (handle, mut client) = start(Arc::clone(&opener));

    client.send_json(json!({ "deviceIndex": 2 }));

    match client.recv().await {
        Some(ServerMessage::Pitch { frequency, volume }) => {
            assert!((frequency - 440.0).abs() < 2.0, "frequency {}", frequency);
            assert!(volume > 0.3 && volume < 0.4, "volume {}", volume);
        }
        other => panic!("expected pitch, got {:?}", other),
    }
    assert_eq!(client.recv().await, Some(ServerMessage::no_sound()));
    assert_eq!(client.recv().await, Some(ServerMessage::no_sound()));

    client.stop();
    assert_eq!(client.recv().await, None);
    // capture released before the connection closed
    assert_eq!(opener.releases(), 1);

    let report = handle.await.unwrap();
    assert!(matches!(report.outcome, TunerOutcome::StoppedByClient));
    assert_eq!(
        report.history,
        vec![
            SessionStatus::Initializing,
            SessionStatus::Running,
            SessionStatus::Stopping,
            SessionStatus::Closed
        ]
    );
    assert_eq!(*opener.opened.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn test_unavailable_device_fails_before_running() {
    let opener = Arc::new(ScriptedOpener {
        fail: true,
        ..ScriptedOpener::new(vec![])
    });
    let (handle, mut client) = start(Arc::clone(&opener));

    client.send_json(json!({ "deviceIndex": 7 }));
    let messages = client.drain().await;

    assert_eq!(
        messages,
        vec![ServerMessage::error("audio device unavailable: no input device at index 7")]
    );
    let report = handle.await.unwrap();
    assert_eq!(report.history, vec![SessionStatus::Initializing, SessionStatus::Failed]);
    assert_eq!(opener.releases(), 0);
}

#[tokio::test]
async fn test_capture_end_fails_session() {
    let opener = Arc::new(ScriptedOpener {
        end_when_empty: true,
        ..ScriptedOpener::new(vec![sine(440.0, 0.001)])
    });
    let (handle, mut client) = start(Arc::clone(&opener));

    client.send_json(json!({}));
    let messages = client.drain().await;
    assert_eq!(opener.releases(), 1);

    assert_eq!(
        messages,
        vec![
            ServerMessage::no_sound(),
            ServerMessage::error("audio device unavailable: capture stream ended")
        ]
    );
    let report = handle.await.unwrap();
    assert_eq!(report.status(), SessionStatus::Failed);
    assert_eq!(*opener.opened.lock().unwrap(), vec![0]);
}

#[tokio::test]
async fn test_client_disconnect_releases_capture() {
    let opener = Arc::new(ScriptedOpener::new(vec![]));
    let (handle, mut client) = start(Arc::clone(&opener));

    client.send_json(json!({ "device_index": 1 }));
    client.hang_up();
    let messages = client.drain().await;

    assert!(messages.is_empty());
    let report = handle.await.unwrap();
    assert!(matches!(report.outcome, TunerOutcome::ConnectionLost));
    assert_eq!(report.status(), SessionStatus::Closed);
    assert_eq!(opener.releases(), 1);
}

#[tokio::test]
async fn test_invalid_init_is_rejected() {
    let opener = Arc::new(ScriptedOpener::new(vec![]));
    let (handle, mut client) = start(Arc::clone(&opener));

    client.send_json(json!({ "deviceIndex": "left" }));
    let messages = client.drain().await;

    assert_eq!(messages.len(), 1);
    assert!(matches!(&messages[0], ServerMessage::Error { error } if error.starts_with("invalid init message")));
    assert_eq!(handle.await.unwrap().status(), SessionStatus::Failed);
    assert!(opener.opened.lock().unwrap().is_empty());
}
