//! Replays a recorded MIDI performance against the score in real time.

use super::{AlignmentEngine, BeatMap, EngineError, EngineStep, MidiScore};
use std::time::{Duration, Instant};

/// Emits the score position of each performance onset when its time comes.
///
/// Waits are capped at one frame so the worker can observe cancellation.
/// When several onsets fall due within one wait only the latest is reported.
pub struct MidiReplayEngine {
    cues: Vec<(Duration, f64)>,
    next: usize,
    started: Option<Instant>,
    frame: Duration,
}

impl MidiReplayEngine {
    pub fn new(performance: &MidiScore, beat_map: &BeatMap, frame: Duration) -> Self {
        let mut cues: Vec<(Duration, f64)> = Vec::new();
        let mut last_tick = None;

        for onset in &performance.onsets {
            if last_tick == Some(onset.tick) {
                continue;
            }
            last_tick = Some(onset.tick);

            let at = Duration::from_secs_f64(performance.seconds_at(onset.tick));
            let beat = beat_map.quarter_to_beat(performance.quarter_at(onset.tick));
            cues.push((at, beat));
        }

        Self::from_cues(cues, frame)
    }

    /// `(offset from start, beat)` pairs, sorted by offset.
    pub fn from_cues(cues: Vec<(Duration, f64)>, frame: Duration) -> Self {
        Self {
            cues,
            next: 0,
            started: None,
            frame,
        }
    }

    pub fn remaining(&self) -> usize {
        self.cues.len().saturating_sub(self.next)
    }
}

impl AlignmentEngine for MidiReplayEngine {
    fn step(&mut self) -> Result<EngineStep, EngineError> {
        let Some(&(due, _)) = self.cues.get(self.next) else {
            return Ok(EngineStep::Finished);
        };

        let start = *self.started.get_or_insert_with(Instant::now);
        let elapsed = start.elapsed();
        if elapsed < due {
            std::thread::sleep((due - elapsed).min(self.frame));
            if start.elapsed() < due {
                return Ok(EngineStep::Idle);
            }
        }

        let elapsed = start.elapsed();
        let mut last = self.next;
        while last + 1 < self.cues.len() && self.cues[last + 1].0 <= elapsed {
            last += 1;
        }
        self.next = last + 1;

        Ok(EngineStep::Position(self.cues[last].1))
    }
}
