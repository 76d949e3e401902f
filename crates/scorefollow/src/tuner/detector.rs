//! Spectral peak pitch detection.

use followconf::TunerConfig;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Result of analysing one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PitchReading {
    Pitch { frequency: f32, volume: f32 },
    /// RMS volume at or below the silence threshold.
    Silence { volume: f32 },
    /// Loud enough, but the peak lies outside the instrument range.
    OutOfRange { frequency: f32, volume: f32 },
}

pub struct PitchDetector {
    sample_rate: f32,
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    silence_threshold: f32,
    min_frequency: f32,
    max_frequency: f32,
}

impl PitchDetector {
    pub fn new(config: &TunerConfig, sample_rate: u32) -> Self {
        let fft_size = config.fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        Self {
            sample_rate: sample_rate as f32,
            fft_size,
            fft,
            window: Vec::new(),
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            silence_threshold: config.silence_threshold,
            min_frequency: config.min_frequency,
            max_frequency: config.max_frequency,
        }
    }

    pub fn detect(&mut self, frame: &[f32]) -> PitchReading {
        let volume = rms(frame);
        if frame.is_empty() || volume <= self.silence_threshold {
            return PitchReading::Silence { volume };
        }

        let len = frame.len().min(self.fft_size);
        if self.window.len() != len {
            self.window = hann(len);
        }

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            *slot = match (frame.get(i), self.window.get(i)) {
                (Some(sample), Some(w)) => Complex::new(sample * w, 0.0),
                _ => Complex::new(0.0, 0.0),
            };
        }
        self.fft.process(&mut self.buffer);

        let magnitudes: Vec<f32> = self.buffer[..=self.fft_size / 2]
            .iter()
            .map(|c| c.norm())
            .collect();
        let peak = magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let bin = refine_peak(&magnitudes, peak);
        let frequency = bin * self.sample_rate / self.fft_size as f32;

        if frequency >= self.min_frequency && frequency <= self.max_frequency {
            PitchReading::Pitch { frequency, volume }
        } else {
            PitchReading::OutOfRange { frequency, volume }
        }
    }
}

pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

/// Symmetric Hann window.
fn hann(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    let denom = (len - 1) as f32;
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / denom).cos())
        .collect()
}

/// Fractional bin of the peak via a parabola through the log magnitudes.
fn refine_peak(magnitudes: &[f32], peak: usize) -> f32 {
    if peak == 0 || peak + 1 >= magnitudes.len() {
        return peak as f32;
    }

    let ln = |m: f32| (m + f32::EPSILON).ln();
    let (a, b, c) = (ln(magnitudes[peak - 1]), ln(magnitudes[peak]), ln(magnitudes[peak + 1]));
    let denom = a - 2.0 * b + c;
    if denom.abs() < f32::EPSILON {
        return peak as f32;
    }

    let offset = (0.5 * (a - c) / denom).clamp(-0.5, 0.5);
    peak as f32 + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TunerConfig {
        TunerConfig::default()
    }

    fn sine(frequency: f32, amplitude: f32, len: usize, sample_rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_a440() {
        let mut detector = PitchDetector::new(&config(), 44_100);
        match detector.detect(&sine(440.0, 0.5, 1024, 44_100.0)) {
            PitchReading::Pitch { frequency, volume } => {
                assert!((frequency - 440.0).abs() < 10.0, "got {}", frequency);
                assert!(volume > 0.01);
            }
            other => panic!("expected a pitch, got {:?}", other),
        }
    }

    #[test]
    fn test_open_strings() {
        let mut detector = PitchDetector::new(&config(), 44_100);
        for expected in [196.0, 293.66, 659.25] {
            match detector.detect(&sine(expected, 0.3, 1024, 44_100.0)) {
                PitchReading::Pitch { frequency, .. } => {
                    assert!((frequency - expected).abs() < 12.0, "{} vs {}", frequency, expected)
                }
                other => panic!("expected a pitch near {}, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_quiet_frame_is_silence() {
        let mut detector = PitchDetector::new(&config(), 44_100);
        assert!(matches!(
            detector.detect(&sine(440.0, 0.005, 1024, 44_100.0)),
            PitchReading::Silence { .. }
        ));
        assert!(matches!(detector.detect(&[0.0; 1024]), PitchReading::Silence { .. }));
        assert!(matches!(detector.detect(&[]), PitchReading::Silence { .. }));
    }

    #[test]
    fn test_low_hum_is_out_of_range() {
        let mut detector = PitchDetector::new(&config(), 44_100);
        assert!(matches!(
            detector.detect(&sine(50.0, 0.5, 1024, 44_100.0)),
            PitchReading::OutOfRange { .. }
        ));
    }

    #[test]
    fn test_whistle_is_out_of_range() {
        let mut detector = PitchDetector::new(&config(), 44_100);
        match detector.detect(&sine(3000.0, 0.5, 1024, 44_100.0)) {
            PitchReading::OutOfRange { frequency, .. } => assert!(frequency > 1000.0),
            other => panic!("expected out of range, got {:?}", other),
        }
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_hann_endpoints() {
        let w = hann(5);
        assert!(w[0].abs() < 1e-6 && w[4].abs() < 1e-6);
        assert!((w[2] - 1.0).abs() < 1e-6);
    }
}
