//! Violin tuner: live pitch readings from an input device.

mod capture;
mod detector;
mod session;

pub use capture::{CpalCapture, CpalCaptureOpener, FrameAssembler};
pub use detector::{rms, PitchDetector, PitchReading};
pub use session::{run_tuner_session, TunerContext, TunerOutcome, TunerReport};

use crate::error::SessionError;
use async_trait::async_trait;
use followconf::TunerConfig;

/// A running capture producing mono frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Vec<f32>>;

    fn sample_rate(&self) -> u32;

    /// Stop the stream and close the device. Later calls do nothing.
    fn release(&mut self);
}

/// Opens capture devices for tuner sessions.
#[async_trait]
pub trait CaptureOpener: Send + Sync {
    async fn open(&self, device_index: usize, config: &TunerConfig) -> Result<Box<dyn FrameSource>, SessionError>;
}
