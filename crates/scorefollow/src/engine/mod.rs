//! Alignment engine boundary.
//!
//! An engine is a blocking iterator over score positions. The worker pool
//! calls [`AlignmentEngine::step`] on its dedicated thread and checks for
//! cancellation between steps, so engines that wait on devices should return
//! [`EngineStep::Idle`] periodically instead of blocking forever.

mod live_midi;
mod replay;
mod score;

pub use live_midi::{LiveMidiEngine, OnsetFollower};
pub use replay::MidiReplayEngine;
pub use score::{BeatMap, MidiScore, NoteOnset};

use crate::protocol::{DeviceSelector, InputType, SessionMode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("unsupported alignment input: {0}")]
    Unsupported(String),

    #[error("could not read score: {0}")]
    Score(String),

    #[error("could not open input: {0}")]
    Input(String),

    #[error("{0}")]
    Failed(String),
}

/// Result of one engine step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineStep {
    /// New score position, in beats.
    Position(f64),
    /// Nothing new yet.
    Idle,
    /// The performance is over.
    Finished,
}

pub trait AlignmentEngine {
    fn step(&mut self) -> Result<EngineStep, EngineError>;
}

/// Everything an engine needs to start following one performance.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Score as served, MusicXML or MIDI.
    pub score: PathBuf,
    /// MIDI rendering of the score. Score timing comes from here when present.
    pub score_midi: Option<PathBuf>,
    pub mode: SessionMode,
    pub input_type: InputType,
    /// Recorded performance, present in playback mode.
    pub performance: Option<PathBuf>,
    pub device: Option<DeviceSelector>,
    /// Engine updates per second.
    pub frame_rate: u32,
}

impl EngineRequest {
    /// Upper bound for a single blocking wait inside an engine.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}

pub struct OpenedEngine {
    pub engine: Box<dyn AlignmentEngine>,
    pub beat_map: BeatMap,
}

/// Creates engines on the worker thread.
pub trait EngineFactory: Send + Sync {
    fn open(&self, request: &EngineRequest) -> Result<OpenedEngine, EngineError>;
}

/// MIDI score follower backed by midly and midir.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEngineFactory;

impl DefaultEngineFactory {
    fn read_midi(path: &Path) -> Result<MidiScore, EngineError> {
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::Score(format!("{}: {}", path.display(), e)))?;
        MidiScore::parse(&bytes)
    }

    fn load_score(request: &EngineRequest) -> Result<MidiScore, EngineError> {
        match &request.score_midi {
            Some(rendering) => Self::read_midi(rendering),
            None => Self::read_midi(&request.score).map_err(|e| match e {
                EngineError::Score(msg) => {
                    EngineError::Score(format!("{} (no MIDI rendering of the score was supplied)", msg))
                }
                other => other,
            }),
        }
    }
}

impl EngineFactory for DefaultEngineFactory {
    fn open(&self, request: &EngineRequest) -> Result<OpenedEngine, EngineError> {
        let score = Self::load_score(request)?;
        let beat_map = score.beat_map();

        let engine: Box<dyn AlignmentEngine> = match (request.mode, request.input_type) {
            (SessionMode::PlaybackFile, InputType::Midi) => {
                let path = request.performance.as_deref().ok_or_else(|| {
                    EngineError::Failed("playback requested without a performance file".to_string())
                })?;
                let bytes = std::fs::read(path)
                    .map_err(|e| EngineError::Input(format!("{}: {}", path.display(), e)))?;
                let performance = MidiScore::parse(&bytes)?;
                Box::new(MidiReplayEngine::new(&performance, &beat_map, request.frame_period()))
            }
            (SessionMode::LiveDevice, InputType::Midi) => Box::new(LiveMidiEngine::open(
                request.device.as_ref(),
                &score,
                &beat_map,
                request.frame_period(),
            )?),
            (_, InputType::Audio) => {
                return Err(EngineError::Unsupported(
                    "audio alignment has no engine backend".to_string(),
                ))
            }
        };

        Ok(OpenedEngine { engine, beat_map })
    }
}

#[cfg(test)]
mod tests {
    use super::score::tests::{note_on, smf_bytes, time_signature};
    use super::*;

    fn request(dir: &Path, mode: SessionMode, input_type: InputType) -> EngineRequest {
        EngineRequest {
            score: dir.join("score.mid"),
            score_midi: None,
            mode,
            input_type,
            performance: Some(dir.join("take.mid")),
            device: None,
            frame_rate: 1000,
        }
    }

    #[test]
    fn test_frame_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), SessionMode::PlaybackFile, InputType::Midi);
        req.frame_rate = 50;
        assert_eq!(req.frame_period(), Duration::from_millis(20));
        req.frame_rate = 0;
        assert_eq!(req.frame_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_audio_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("score.mid"), smf_bytes(96, &[(0, note_on(60))])).unwrap();

        let req = request(dir.path(), SessionMode::PlaybackFile, InputType::Audio);
        let err = DefaultEngineFactory.open(&req).err().unwrap();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn test_missing_score_is_score_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), SessionMode::PlaybackFile, InputType::Midi);
        assert!(matches!(DefaultEngineFactory.open(&req).err().unwrap(), EngineError::Score(_)));
    }

    #[test]
    fn test_playback_replays_performance() {
        let dir = tempfile::tempdir().unwrap();
        let score = smf_bytes(96, &[(0, time_signature(3, 3)), (0, note_on(60))]);
        let take = smf_bytes(96, &[(0, note_on(60)), (0, note_on(64))]);
        std::fs::write(dir.path().join("score.mid"), score).unwrap();
        std::fs::write(dir.path().join("take.mid"), take).unwrap();

        let req = request(dir.path(), SessionMode::PlaybackFile, InputType::Midi);
        let OpenedEngine { mut engine, beat_map } = DefaultEngineFactory.open(&req).unwrap();

        assert_eq!(beat_map.beat_to_quarter(2.0), 1.0);
        assert_eq!(engine.step().unwrap(), EngineStep::Position(0.0));
        assert_eq!(engine.step().unwrap(), EngineStep::Finished);
    }

    #[test]
    fn test_musicxml_score_uses_midi_rendering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("score.musicxml"), MUSICXML).unwrap();
        let rendering = smf_bytes(96, &[(0, note_on(60)), (96, note_on(62))]);
        std::fs::write(dir.path().join("score_rendering.mid"), &rendering).unwrap();
        std::fs::write(dir.path().join("take.mid"), &rendering).unwrap();

        let mut req = request(dir.path(), SessionMode::PlaybackFile, InputType::Midi);
        req.score = dir.path().join("score.musicxml");
        req.score_midi = Some(dir.path().join("score_rendering.mid"));

        let OpenedEngine { mut engine, .. } = DefaultEngineFactory.open(&req).unwrap();
        assert_eq!(engine.step().unwrap(), EngineStep::Position(0.0));
    }

    #[test]
    fn test_musicxml_score_without_rendering_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("score.musicxml"), MUSICXML).unwrap();

        let mut req = request(dir.path(), SessionMode::LiveDevice, InputType::Midi);
        req.score = dir.path().join("score.musicxml");

        match DefaultEngineFactory.open(&req).err().unwrap() {
            EngineError::Score(msg) => assert!(msg.contains("no MIDI rendering"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    const MUSICXML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<score-partwise version="3.1">
  <part-list><score-part id="P1"><part-name>Violin</part-name></score-part></part-list>
  <part id="P1">
    <measure number="1">
      <attributes><divisions>1</divisions><time><beats>4</beats><beat-type>4</beat-type></time></attributes>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>4</duration></note>
    </measure>
  </part>
</score-partwise>
"#;
}
