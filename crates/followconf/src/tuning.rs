//! Session tuning - timing and signal-processing constants for live sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Score-following session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Position broadcaster poll interval in milliseconds.
    /// Default: 100
    pub broadcast_interval_ms: u64,

    /// Minimum position change (quarter notes) that produces a new message.
    /// Default: 0.001
    pub position_epsilon: f64,

    /// Frame rate handed to alignment engines.
    /// Default: 86
    pub frame_rate: u32,

    /// How long teardown waits on a cancelled worker before logging a warning.
    /// Teardown keeps waiting afterwards.
    /// Default: 2000
    pub cancel_warn_ms: u64,
}

impl SessionConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn cancel_warn_after(&self) -> Duration {
        Duration::from_millis(self.cancel_warn_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 100,
            position_epsilon: 0.001,
            frame_rate: 86,
            cancel_warn_ms: 2000,
        }
    }
}

/// Tuner (pitch detection) parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Requested capture sample rate. The device rate wins when it differs.
    /// Default: 44100
    pub sample_rate: u32,

    /// Samples per analysis frame.
    /// Default: 1024
    pub frame_size: usize,

    /// FFT length; frames are zero-padded up to this size.
    /// Default: 2048
    pub fft_size: usize,

    /// RMS volume at or below which a frame counts as silence.
    /// Default: 0.01
    pub silence_threshold: f32,

    /// Lowest frequency reported, in Hz.
    /// Default: 100
    pub min_frequency: f32,

    /// Highest frequency reported, in Hz.
    /// Default: 1000
    pub max_frequency: f32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frame_size: 1024,
            fft_size: 2048,
            silence_threshold: 0.01,
            min_frequency: 100.0,
            max_frequency: 1000.0,
        }
    }
}

/// Tuning for live sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub session: SessionConfig,
    pub tuner: TunerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.broadcast_interval(), Duration::from_millis(100));
        assert_eq!(session.position_epsilon, 0.001);
        assert_eq!(session.frame_rate, 86);
    }

    #[test]
    fn test_tuner_defaults() {
        let tuner = TunerConfig::default();
        assert_eq!(tuner.frame_size, 1024);
        assert_eq!(tuner.fft_size, 2048);
        assert_eq!(tuner.silence_threshold, 0.01);
    }
}
