//! Score timing: beat/quarter mapping and Standard MIDI score parsing.

use super::EngineError;
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

/// Default MIDI tempo, microseconds per quarter note (120 BPM).
const DEFAULT_TEMPO_US: u32 = 500_000;

/// One stretch of constant meter.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MeterSegment {
    start_beat: f64,
    start_quarter: f64,
    quarters_per_beat: f64,
}

/// Piecewise-linear mapping between score beats and quarter notes.
///
/// A beat is the time signature's denominator unit, so a 6/8 bar has six
/// beats of half a quarter each.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatMap {
    segments: Vec<MeterSegment>,
}

impl BeatMap {
    /// Beats and quarters coincide everywhere.
    pub fn quarter_notes() -> Self {
        Self {
            segments: vec![MeterSegment {
                start_beat: 0.0,
                start_quarter: 0.0,
                quarters_per_beat: 1.0,
            }],
        }
    }

    /// Build from `(quarter position, time signature denominator)` changes.
    ///
    /// Anything before the first change is treated as x/4. Changes at the
    /// same position keep the last one.
    pub fn from_time_signatures(changes: &[(f64, u32)]) -> Self {
        let mut sorted: Vec<(f64, u32)> = changes
            .iter()
            .copied()
            .filter(|(q, den)| q.is_finite() && *q >= 0.0 && *den > 0)
            .collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut map = Self::quarter_notes();
        for (quarter, denominator) in sorted {
            let quarters_per_beat = 4.0 / denominator as f64;
            let start_beat = map.quarter_to_beat(quarter);
            let segment = MeterSegment {
                start_beat,
                start_quarter: quarter,
                quarters_per_beat,
            };

            match map.segments.last_mut() {
                Some(last) if last.start_quarter == quarter => *last = segment,
                _ => map.segments.push(segment),
            }
        }
        map
    }

    /// Convert a score beat position to quarter notes.
    pub fn beat_to_quarter(&self, beat: f64) -> f64 {
        let seg = self.segment_by(|s| s.start_beat <= beat);
        seg.start_quarter + (beat - seg.start_beat) * seg.quarters_per_beat
    }

    /// Convert a quarter-note position to score beats.
    pub fn quarter_to_beat(&self, quarter: f64) -> f64 {
        let seg = self.segment_by(|s| s.start_quarter <= quarter);
        seg.start_beat + (quarter - seg.start_quarter) / seg.quarters_per_beat
    }

    fn segment_by(&self, starts_before: impl Fn(&MeterSegment) -> bool) -> MeterSegment {
        self.segments
            .iter()
            .rev()
            .find(|s| starts_before(s))
            .or_else(|| self.segments.first())
            .copied()
            .unwrap_or(MeterSegment {
                start_beat: 0.0,
                start_quarter: 0.0,
                quarters_per_beat: 1.0,
            })
    }
}

impl Default for BeatMap {
    fn default() -> Self {
        Self::quarter_notes()
    }
}

/// A note onset in a MIDI file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteOnset {
    pub tick: u64,
    pub key: u8,
}

/// The parts of a Standard MIDI File the engines need.
#[derive(Debug, Clone)]
pub struct MidiScore {
    /// Ticks per quarter note.
    pub ppq: u16,
    /// `(tick, denominator)` time signature changes.
    pub time_signatures: Vec<(u64, u32)>,
    /// `(tick, microseconds per quarter)` tempo changes, sorted.
    pub tempos: Vec<(u64, u32)>,
    /// Note onsets from every track, sorted by tick then key.
    pub onsets: Vec<NoteOnset>,
}

impl MidiScore {
    pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
        let smf = Smf::parse(bytes).map_err(|e| EngineError::Score(e.to_string()))?;

        let ppq = match smf.header.timing {
            Timing::Metrical(ticks) => ticks.as_int(),
            Timing::Timecode(..) => {
                return Err(EngineError::Score(
                    "SMPTE timecode timing is not supported".to_string(),
                ))
            }
        };
        if ppq == 0 {
            return Err(EngineError::Score("zero ticks per quarter".to_string()));
        }

        let mut time_signatures = Vec::new();
        let mut tempos = Vec::new();
        let mut onsets = Vec::new();

        for track in &smf.tracks {
            let mut tick: u64 = 0;
            for event in track {
                tick += event.delta.as_int() as u64;
                match event.kind {
                    TrackEventKind::Meta(MetaMessage::TimeSignature(_, den_pow, _, _)) => {
                        time_signatures.push((tick, 1u32 << den_pow.min(6)));
                    }
                    TrackEventKind::Meta(MetaMessage::Tempo(us)) => {
                        tempos.push((tick, us.as_int()));
                    }
                    TrackEventKind::Midi {
                        message: MidiMessage::NoteOn { key, vel },
                        ..
                    } if vel.as_int() > 0 => {
                        onsets.push(NoteOnset {
                            tick,
                            key: key.as_int(),
                        });
                    }
                    _ => {}
                }
            }
        }

        time_signatures.sort_by_key(|(t, _)| *t);
        tempos.sort_by_key(|(t, _)| *t);
        onsets.sort_by_key(|n| (n.tick, n.key));

        Ok(Self {
            ppq,
            time_signatures,
            tempos,
            onsets,
        })
    }

    pub fn quarter_at(&self, tick: u64) -> f64 {
        tick as f64 / self.ppq as f64
    }

    /// Wall-clock seconds from the start of the file to `tick`.
    pub fn seconds_at(&self, tick: u64) -> f64 {
        let mut seconds = 0.0;
        let mut last_tick = 0u64;
        let mut tempo = DEFAULT_TEMPO_US;

        for &(change_tick, us) in &self.tempos {
            if change_tick >= tick {
                break;
            }
            seconds += self.span_seconds(change_tick - last_tick, tempo);
            last_tick = change_tick;
            tempo = us;
        }

        seconds + self.span_seconds(tick - last_tick, tempo)
    }

    fn span_seconds(&self, ticks: u64, us_per_quarter: u32) -> f64 {
        ticks as f64 / self.ppq as f64 * us_per_quarter as f64 / 1_000_000.0
    }

    pub fn beat_map(&self) -> BeatMap {
        let changes: Vec<(f64, u32)> = self
            .time_signatures
            .iter()
            .map(|&(tick, den)| (self.quarter_at(tick), den))
            .collect();
        BeatMap::from_time_signatures(&changes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a format-0 SMF by hand: header chunk plus one track chunk.
    pub(crate) fn smf_bytes(ppq: u16, events: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut track = Vec::new();
        for (delta, body) in events {
            write_vlq(&mut track, *delta);
            track.extend_from_slice(body);
        }
        write_vlq(&mut track, 0);
        track.extend_from_slice(&[0xFF, 0x2F, 0x00]);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MThd");
        bytes.extend_from_slice(&6u32.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&ppq.to_be_bytes());
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(track.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&track);
        bytes
    }

    fn write_vlq(out: &mut Vec<u8>, mut value: u32) {
        let mut stack = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            stack.push(((value & 0x7F) as u8) | 0x80);
            value >>= 7;
        }
        out.extend(stack.into_iter().rev());
    }

    pub(crate) fn note_on(key: u8) -> Vec<u8> {
        vec![0x90, key, 100]
    }

    pub(crate) fn time_signature(num: u8, den_pow: u8) -> Vec<u8> {
        vec![0xFF, 0x58, 0x04, num, den_pow, 24, 8]
    }

    pub(crate) fn tempo(us: u32) -> Vec<u8> {
        let b = us.to_be_bytes();
        vec![0xFF, 0x51, 0x03, b[1], b[2], b[3]]
    }

    #[test]
    fn test_quarter_notes_identity() {
        let map = BeatMap::quarter_notes();
        assert_eq!(map.beat_to_quarter(7.25), 7.25);
        assert_eq!(map.quarter_to_beat(3.0), 3.0);
    }

    #[test]
    fn test_eighth_note_meter() {
        // 6/8 from the start: each beat is half a quarter
        let map = BeatMap::from_time_signatures(&[(0.0, 8)]);
        assert_eq!(map.beat_to_quarter(6.0), 3.0);
        assert_eq!(map.quarter_to_beat(3.0), 6.0);
    }

    #[test]
    fn test_meter_change_midway() {
        // Two bars of 4/4 (8 quarters), then 3/8 from quarter 8 onward
        let map = BeatMap::from_time_signatures(&[(0.0, 4), (8.0, 8)]);
        assert_eq!(map.beat_to_quarter(8.0), 8.0);
        assert_eq!(map.beat_to_quarter(11.0), 9.5);
        assert_eq!(map.quarter_to_beat(9.5), 11.0);
    }

    #[test]
    fn test_half_note_meter_after_pickup() {
        let map = BeatMap::from_time_signatures(&[(1.0, 2)]);
        assert_eq!(map.beat_to_quarter(1.0), 1.0);
        assert_eq!(map.beat_to_quarter(2.0), 3.0);
    }

    #[test]
    fn test_duplicate_change_keeps_last() {
        let map = BeatMap::from_time_signatures(&[(0.0, 4), (0.0, 8)]);
        assert_eq!(map.beat_to_quarter(2.0), 1.0);
    }

    #[test]
    fn test_parse_midi_score() {
        let bytes = smf_bytes(
            480,
            &[
                (0, time_signature(6, 3)),
                (0, tempo(250_000)),
                (0, note_on(60)),
                (480, note_on(64)),
                (0, note_on(67)),
                (480, vec![0x90, 72, 0]),
            ],
        );
        let score = MidiScore::parse(&bytes).unwrap();

        assert_eq!(score.ppq, 480);
        assert_eq!(score.time_signatures, vec![(0, 8)]);
        assert_eq!(score.onsets.len(), 3);
        assert_eq!(score.onsets[1], NoteOnset { tick: 480, key: 64 });
        assert_eq!(score.quarter_at(960), 2.0);
        assert_eq!(score.seconds_at(960), 0.5);
        assert_eq!(score.beat_map().beat_to_quarter(4.0), 2.0);
    }

    #[test]
    fn test_seconds_with_tempo_change() {
        let bytes = smf_bytes(100, &[(0, note_on(60)), (100, tempo(1_000_000)), (100, note_on(62))]);
        let score = MidiScore::parse(&bytes).unwrap();
        // one quarter at 120 BPM, then one quarter at 60 BPM
        assert!((score.seconds_at(200) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(MidiScore::parse(b"<score-partwise/>"), Err(EngineError::Score(_))));
    }
}
