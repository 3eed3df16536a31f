//! SMF Type 1 generation over the unrolled measure sequence.
//!
//! Track 0 is the conductor track (tempo and time-signature meta events);
//! tracks 1..=N carry one part each. Event times are derived musically:
//! cumulative quarter notes across the unrolled sequence, converted to
//! ticks at the configured resolution, so repeated sections land on exact
//! tick boundaries regardless of tempo.

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};
use num_rational::Rational32;
use serde::Deserialize;

use crate::error::MidiGenError;
use crate::model::{NoteEvent, Score};
use crate::timeline::UnrolledMeasure;

const DEFAULT_RESOLUTION: u16 = 480;
const DEFAULT_VELOCITY: u8 = 80;

/// Generation options, decoded from the caller's JSON. Unknown keys are
/// ignored; every field has a default so `{}` is a valid document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MidiOptions {
    /// Overrides every tempo in the document when set.
    pub tempo_bpm: Option<f64>,
    /// Ticks per quarter note.
    pub resolution: u16,
    /// Semitone shift applied before generation.
    pub transpose: i32,
    /// Explicit per-part track routing; empty means one track per part
    /// with channels assigned sequentially.
    pub tracks: Vec<TrackOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackOptions {
    /// Part index into the score.
    pub part: usize,
    /// MIDI channel, 0-15.
    pub channel: u8,
    /// General MIDI program override, 0-127.
    pub program: Option<u8>,
}

impl Default for MidiOptions {
    fn default() -> Self {
        MidiOptions {
            tempo_bpm: None,
            resolution: DEFAULT_RESOLUTION,
            transpose: 0,
            tracks: Vec::new(),
        }
    }
}

impl MidiOptions {
    pub fn from_json(json: &str) -> Result<MidiOptions, MidiGenError> {
        serde_json::from_str(json).map_err(|e| MidiGenError::InvalidOptions(e.to_string()))
    }

    /// Check the options against a concrete score.
    pub fn validate(&self, score: &Score) -> Result<(), MidiGenError> {
        if self.resolution == 0 {
            return Err(MidiGenError::InvalidOptions("resolution must be positive".into()));
        }
        if let Some(bpm) = self.tempo_bpm {
            if !bpm.is_finite() || bpm <= 0.0 {
                return Err(MidiGenError::InvalidOptions(format!(
                    "tempo {bpm} is not a positive number"
                )));
            }
        }
        for track in &self.tracks {
            if track.channel > 15 {
                return Err(MidiGenError::InvalidChannel(track.channel));
            }
            if track.part >= score.parts.len() {
                return Err(MidiGenError::UnknownPart {
                    part: track.part,
                    available: score.parts.len(),
                });
            }
            if let Some(program) = track.program {
                if program > 127 {
                    return Err(MidiGenError::InvalidOptions(format!(
                        "program {program} is out of range (0-127)"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the effective track list: explicit routing, or one track
    /// per part using the part's declared channel/program.
    fn effective_tracks(&self, score: &Score) -> Vec<TrackOptions> {
        if !self.tracks.is_empty() {
            return self.tracks.clone();
        }
        score
            .parts
            .iter()
            .enumerate()
            .map(|(i, part)| TrackOptions {
                part: i,
                channel: part.midi_channel.unwrap_or((i % 16) as u8),
                program: part.midi_program,
            })
            .collect()
    }
}

/// Ticks for a duration expressed as a fraction of a whole note.
fn ticks(duration: Rational32, tpq: u16) -> u32 {
    let num = *duration.numer() as i64 * 4 * tpq as i64;
    let den = *duration.denom() as i64;
    // Round half up; irregular tuplet denominators do not divide evenly.
    ((num + den / 2) / den).max(0) as u32
}

/// Generate SMF bytes for the score in play order.
pub fn generate(
    score: &Score,
    unrolled: &[UnrolledMeasure],
    options: &MidiOptions,
) -> Result<Vec<u8>, MidiGenError> {
    options.validate(score)?;
    let tpq = options.resolution;

    // Start tick of each unrolled occurrence, exact in musical time.
    let mut starts: Vec<u32> = Vec::with_capacity(unrolled.len());
    let mut cursor = 0u32;
    for um in unrolled {
        starts.push(cursor);
        let measure = &score.parts[0].measures[um.index];
        cursor += ticks(measure.sounding_duration(), tpq);
    }

    let mut tracks = Vec::with_capacity(1 + score.parts.len());
    tracks.push(conductor_track(score, unrolled, &starts, options));
    for spec in options.effective_tracks(score) {
        tracks.push(part_track(score, unrolled, &starts, &spec, tpq));
    }

    let smf = Smf {
        header: Header { format: Format::Parallel, timing: Timing::Metrical(tpq.into()) },
        tracks,
    };
    let mut out = Vec::new();
    smf.write(&mut out).map_err(|e| MidiGenError::Write(e.to_string()))?;
    Ok(out)
}

fn conductor_track<'a>(
    score: &'a Score,
    unrolled: &[UnrolledMeasure],
    starts: &[u32],
    options: &MidiOptions,
) -> Vec<TrackEvent<'a>> {
    let mut events: Vec<TrackEvent> = Vec::new();

    if let Some(title) = &score.title {
        events.push(TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(title.as_bytes())),
        });
    }

    if let Some(bpm) = options.tempo_bpm {
        events.push(tempo_event(0, bpm));
    } else {
        let mut last_bpm = f64::NAN;
        for (um, &tick) in unrolled.iter().zip(starts) {
            if um.tempo_bpm != last_bpm {
                events.push(tempo_event(tick, um.tempo_bpm));
                last_bpm = um.tempo_bpm;
            }
        }
        if events.iter().all(|e| !matches!(e.kind, TrackEventKind::Meta(MetaMessage::Tempo(_)))) {
            events.push(tempo_event(0, 120.0));
        }
    }

    let mut last_time = None;
    for (um, &tick) in unrolled.iter().zip(starts) {
        let time = score.parts[0].measures[um.index].time;
        if last_time != Some(time) {
            let denominator_power = (time.beat_type as f32).log2() as u8;
            events.push(TrackEvent {
                delta: tick.into(),
                kind: TrackEventKind::Meta(MetaMessage::TimeSignature(
                    time.beats,
                    denominator_power,
                    24,
                    8,
                )),
            });
            last_time = Some(time);
        }
    }

    finish_track(&mut events);
    events
}

fn tempo_event<'a>(tick: u32, bpm: f64) -> TrackEvent<'a> {
    let microseconds_per_quarter = (60_000_000.0 / bpm) as u32;
    TrackEvent {
        delta: tick.into(),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(microseconds_per_quarter.into())),
    }
}

fn part_track<'a>(
    score: &'a Score,
    unrolled: &[UnrolledMeasure],
    starts: &[u32],
    spec: &TrackOptions,
    tpq: u16,
) -> Vec<TrackEvent<'a>> {
    let part = &score.parts[spec.part];
    let channel = spec.channel;
    let mut events: Vec<TrackEvent> = Vec::new();

    events.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::TrackName(part.name.as_bytes())),
    });
    if let Some(program) = spec.program {
        events.push(TrackEvent {
            delta: 0.into(),
            kind: TrackEventKind::Midi {
                channel: channel.into(),
                message: MidiMessage::ProgramChange { program: program.into() },
            },
        });
    }

    for (um, &measure_tick) in unrolled.iter().zip(starts) {
        let Some(measure) = part.measures.get(um.index) else { continue };
        for voice in &measure.voices {
            let mut beat = Rational32::new(0, 1);
            for event in &voice.events {
                let on_tick = measure_tick + ticks(beat, tpq);
                let off_tick = measure_tick + ticks(beat + event.duration(), tpq);
                match event {
                    NoteEvent::Note { pitch, tie, .. } => {
                        push_note(&mut events, channel, pitch.midi_number(), on_tick, off_tick, tie.stop, tie.start);
                    }
                    NoteEvent::Chord { pitches, tie, .. } => {
                        for p in pitches {
                            push_note(&mut events, channel, p.midi_number(), on_tick, off_tick, tie.stop, tie.start);
                        }
                    }
                    NoteEvent::Rest { .. } => {}
                }
                beat += event.duration();
            }
        }
    }

    finish_track(&mut events);
    events
}

/// Tie merging: a note that only continues a tie emits no note-on, a
/// note that starts or continues into another emits no note-off. The
/// chain collapses into one sustained note.
fn push_note(
    events: &mut Vec<TrackEvent>,
    channel: u8,
    key: u8,
    on_tick: u32,
    off_tick: u32,
    tie_stop: bool,
    tie_start: bool,
) {
    if !tie_stop {
        events.push(TrackEvent {
            delta: on_tick.into(),
            kind: TrackEventKind::Midi {
                channel: channel.into(),
                message: MidiMessage::NoteOn { key: key.into(), vel: DEFAULT_VELOCITY.into() },
            },
        });
    }
    if !tie_start {
        events.push(TrackEvent {
            delta: off_tick.into(),
            kind: TrackEventKind::Midi {
                channel: channel.into(),
                message: MidiMessage::NoteOff { key: key.into(), vel: 0.into() },
            },
        });
    }
}

/// Sort by absolute tick (stable, so same-tick offs stay ahead of the
/// ons pushed after them), convert to deltas, close the track.
fn finish_track(events: &mut Vec<TrackEvent>) {
    events.sort_by_key(|e| e.delta.as_int());
    let mut prev = 0u32;
    for event in events.iter_mut() {
        let tick = event.delta.as_int();
        event.delta = tick.saturating_sub(prev).into();
        prev = tick;
    }
    events.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
}
