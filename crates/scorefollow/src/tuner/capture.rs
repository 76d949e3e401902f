//! Microphone capture through cpal.
//!
//! `cpal::Stream` is not `Send`, so each capture owns a thread that builds
//! the stream, keeps it alive and drops it when released. Audio callbacks
//! downmix to mono and hand complete frames to the async side; frames are
//! dropped when the reader falls behind.

use super::{CaptureOpener, FrameSource};
use crate::error::SessionError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig};
use followconf::TunerConfig;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

/// Frames buffered between the audio callback and the detection loop.
const FRAME_QUEUE: usize = 8;

/// Collects interleaved samples into mono frames of a fixed size.
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    frame_size: usize,
    current: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(channels: usize, frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            channels: channels.max(1),
            frame_size,
            current: Vec::with_capacity(frame_size),
        }
    }

    /// Add interleaved samples, returning every frame completed.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<Vec<f32>> {
        let mut done = Vec::new();
        for chunk in interleaved.chunks(self.channels) {
            let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
            self.current.push(mono);
            if self.current.len() == self.frame_size {
                let next = Vec::with_capacity(self.frame_size);
                done.push(std::mem::replace(&mut self.current, next));
            }
        }
        done
    }
}

/// Opens cpal input devices by enumeration index.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCaptureOpener;

#[async_trait]
impl CaptureOpener for CpalCaptureOpener {
    async fn open(&self, device_index: usize, config: &TunerConfig) -> Result<Box<dyn FrameSource>, SessionError> {
        let config = config.clone();
        let capture = tokio::task::spawn_blocking(move || CpalCapture::open(device_index, &config))
            .await
            .map_err(|e| SessionError::DeviceUnavailable(format!("capture setup panicked: {}", e)))??;
        Ok(Box::new(capture))
    }
}

pub struct CpalCapture {
    frames: mpsc::Receiver<Vec<f32>>,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl CpalCapture {
    /// Start capturing. Blocks until the stream is running or failed.
    pub fn open(device_index: usize, config: &TunerConfig) -> Result<Self, SessionError> {
        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name("tuner-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(device_index, &config, frame_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // returns on an explicit stop or when the handle is dropped
                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    debug!("pausing capture stream failed: {}", e);
                }
                drop(stream);
                debug!("capture stream closed");
            })
            .map_err(|e| SessionError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Self {
                frames,
                stop: Some(stop),
                thread: Some(thread),
                sample_rate,
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(SessionError::DeviceUnavailable(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(SessionError::DeviceUnavailable("capture thread exited".to_string()))
            }
        }
    }
}

#[async_trait]
impl FrameSource for CpalCapture {
    async fn next_frame(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!("capture thread panicked");
                }
            }
            self.frames.close();
            debug!("tuner capture released");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_stream(
    device_index: usize,
    config: &TunerConfig,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = host
        .input_devices()
        .map_err(|e| e.to_string())?
        .nth(device_index)
        .ok_or_else(|| format!("no input device at index {}", device_index))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = choose_config(&device, config.sample_rate)?;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();
    let sample_rate = stream_config.sample_rate.0;
    let mut assembler = FrameAssembler::new(stream_config.channels as usize, config.frame_size);

    let on_error = |err: cpal::StreamError| error!("tuner capture error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| forward(&frames, assembler.push(data)),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                forward(&frames, assembler.push(&samples))
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported sample format {:?}", other)),
    }
    .map_err(|e| e.to_string())?;

    stream.play().map_err(|e| e.to_string())?;
    info!(device = %name, sample_rate, "tuner capture started");
    Ok((stream, sample_rate))
}

/// Prefer the configured rate when the device supports it.
fn choose_config(device: &cpal::Device, wanted_rate: u32) -> Result<SupportedStreamConfig, String> {
    let preferred = device.supported_input_configs().ok().and_then(|mut ranges| {
        ranges.find(|r| {
            matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16)
                && r.min_sample_rate().0 <= wanted_rate
                && wanted_rate <= r.max_sample_rate().0
        })
    });

    match preferred {
        Some(range) => Ok(range.with_sample_rate(SampleRate(wanted_rate))),
        None => device.default_input_config().map_err(|e| e.to_string()),
    }
}

fn forward(frames: &mpsc::Sender<Vec<f32>>, done: Vec<Vec<f32>>) {
    for frame in done {
        if let Err(TrySendError::Full(_)) = frames.try_send(frame) {
            trace!("tuner reader behind, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_frames() {
        let mut assembler = FrameAssembler::new(1, 4);
        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        let done = assembler.push(&[0.4, 0.5]);
        assert_eq!(done, vec![vec![0.1, 0.2, 0.3, 0.4]]);
        assert_eq!(assembler.push(&[0.6, 0.7, 0.8]), vec![vec![0.5, 0.6, 0.7, 0.8]]);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut assembler = FrameAssembler::new(2, 2);
        let done = assembler.push(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0]);
        assert_eq!(done, vec![vec![0.5, 0.5]]);
        assert_eq!(assembler.push(&[0.25, 0.25]), vec![vec![0.0, 0.25]]);
    }

    #[test]
    fn test_multiple_frames_in_one_callback() {
        let mut assembler = FrameAssembler::new(1, 2);
        assert_eq!(assembler.push(&[1.0, 2.0, 3.0, 4.0, 5.0]).len(), 2);
    }

    #[tokio::test]
    async fn test_forward_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        forward(&tx, vec![vec![1.0], vec![2.0]]);
        assert_eq!(rx.recv().await, Some(vec![1.0]));
        assert!(rx.try_recv().is_err());
    }
}
