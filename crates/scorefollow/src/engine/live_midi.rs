//! Live MIDI score following.

use super::{AlignmentEngine, BeatMap, EngineError, EngineStep, MidiScore};
use crate::protocol::DeviceSelector;
use midir::{MidiInput, MidiInputConnection, MidiInputPort};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info};

/// How many upcoming score onsets a played note may match.
const LOOKAHEAD: usize = 4;

/// Greedy matcher from played keys to expected score onsets.
///
/// A played key matches the first expected onset with the same key within
/// the look-ahead window; everything before the match counts as skipped.
#[derive(Debug, Clone)]
pub struct OnsetFollower {
    expected: Vec<(u8, f64)>,
    cursor: usize,
    lookahead: usize,
}

impl OnsetFollower {
    /// `(key, beat)` pairs in score order.
    pub fn new(expected: Vec<(u8, f64)>, lookahead: usize) -> Self {
        Self {
            expected,
            cursor: 0,
            lookahead: lookahead.max(1),
        }
    }

    pub fn from_score(score: &MidiScore, beat_map: &BeatMap, lookahead: usize) -> Self {
        let expected = score
            .onsets
            .iter()
            .map(|n| (n.key, beat_map.quarter_to_beat(score.quarter_at(n.tick))))
            .collect();
        Self::new(expected, lookahead)
    }

    /// Beat of the matched onset, if the key matched.
    pub fn observe(&mut self, key: u8) -> Option<f64> {
        let end = (self.cursor + self.lookahead).min(self.expected.len());
        let offset = self.expected[self.cursor..end]
            .iter()
            .position(|(expected, _)| *expected == key)?;

        let index = self.cursor + offset;
        self.cursor = index + 1;
        Some(self.expected[index].1)
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.expected.len()
    }
}

/// Follows note-on events from a MIDI input port.
pub struct LiveMidiEngine {
    follower: OnsetFollower,
    notes: Receiver<u8>,
    frame: Duration,
    _connection: MidiInputConnection<()>,
}

impl LiveMidiEngine {
    pub fn open(
        device: Option<&DeviceSelector>,
        score: &MidiScore,
        beat_map: &BeatMap,
        frame: Duration,
    ) -> Result<Self, EngineError> {
        let input = MidiInput::new("scorefollow").map_err(|e| EngineError::Input(e.to_string()))?;
        let port = select_port(&input, device)?;
        let port_name = input.port_name(&port).unwrap_or_else(|_| "unknown".to_string());

        let (tx, notes) = mpsc::channel();
        let connection = input
            .connect(
                &port,
                "scorefollow-live",
                move |_stamp, message, _| {
                    if let Some(key) = note_on_key(message) {
                        let _ = tx.send(key);
                    }
                },
                (),
            )
            .map_err(|e| EngineError::Input(e.to_string()))?;

        info!(port = %port_name, "following live MIDI input");
        Ok(Self {
            follower: OnsetFollower::from_score(score, beat_map, LOOKAHEAD),
            notes,
            frame,
            _connection: connection,
        })
    }
}

impl AlignmentEngine for LiveMidiEngine {
    fn step(&mut self) -> Result<EngineStep, EngineError> {
        if self.follower.is_finished() {
            return Ok(EngineStep::Finished);
        }

        match self.notes.recv_timeout(self.frame) {
            Ok(key) => match self.follower.observe(key) {
                Some(beat) => Ok(EngineStep::Position(beat)),
                None => {
                    debug!(key, "unmatched note");
                    Ok(EngineStep::Idle)
                }
            },
            Err(RecvTimeoutError::Timeout) => Ok(EngineStep::Idle),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::Input("MIDI input disconnected".to_string()))
            }
        }
    }
}

fn select_port(input: &MidiInput, device: Option<&DeviceSelector>) -> Result<MidiInputPort, EngineError> {
    let ports = input.ports();

    let found = match device {
        None => ports.first().cloned(),
        Some(selector) => match selector.as_index() {
            Some(index) => ports.get(index as usize).cloned(),
            None => {
                let wanted = selector.to_string();
                ports
                    .iter()
                    .find(|p| input.port_name(p).is_ok_and(|name| name.contains(&wanted)))
                    .cloned()
            }
        },
    };

    found.ok_or_else(|| match device {
        Some(selector) => EngineError::Input(format!("MIDI input {} not found", selector)),
        None => EngineError::Input("no MIDI input ports".to_string()),
    })
}

/// Key number of a note-on with non-zero velocity.
fn note_on_key(message: &[u8]) -> Option<u8> {
    match message {
        [status, key, velocity, ..] if status & 0xF0 == 0x90 && *velocity > 0 => Some(*key),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale() -> OnsetFollower {
        OnsetFollower::new(
            vec![(60, 0.0), (62, 1.0), (64, 2.0), (65, 3.0), (67, 4.0), (69, 5.0)],
            3,
        )
    }

    #[test]
    fn test_follows_in_order() {
        let mut follower = scale();
        assert_eq!(follower.observe(60), Some(0.0));
        assert_eq!(follower.observe(62), Some(1.0));
        assert_eq!(follower.observe(64), Some(2.0));
    }

    #[test]
    fn test_skips_within_lookahead() {
        let mut follower = scale();
        assert_eq!(follower.observe(64), Some(2.0));
        // 60 is behind the cursor now
        assert_eq!(follower.observe(60), None);
        assert_eq!(follower.observe(65), Some(3.0));
    }

    #[test]
    fn test_ignores_notes_beyond_lookahead() {
        let mut follower = scale();
        assert_eq!(follower.observe(67), None);
        assert_eq!(follower.observe(60), Some(0.0));
    }

    #[test]
    fn test_finishes_after_last_onset() {
        let mut follower = OnsetFollower::new(vec![(60, 0.0), (64, 1.0)], 4);
        assert!(!follower.is_finished());
        follower.observe(64);
        assert!(follower.is_finished());
        assert_eq!(follower.observe(64), None);
    }

    #[test]
    fn test_note_on_key() {
        assert_eq!(note_on_key(&[0x90, 60, 100]), Some(60));
        assert_eq!(note_on_key(&[0x93, 61, 1]), Some(61));
        assert_eq!(note_on_key(&[0x90, 60, 0]), None);
        assert_eq!(note_on_key(&[0x80, 60, 64]), None);
        assert_eq!(note_on_key(&[0xF8]), None);
    }
}
