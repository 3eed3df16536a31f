//! Semantic score model.
//!
//! The model is the normalized form every later stage consumes: parts own
//! measures, measures own voices, voices own note events. All durations
//! are exact rationals (fractions of a whole note) so tuplet and dotted
//! arithmetic never accumulates floating-point error. Cross-references
//! (ties, repeat targets) are index-based lookups, never pointers, so the
//! ownership tree stays acyclic even though the repeat structure is a
//! cyclic graph.

mod builder;

pub use builder::build_score;

use num_rational::Rational32;

/// A duration expressed as a fraction of a whole note.
pub type Duration = Rational32;

/// A complete score: ordered parts plus document-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub title: Option<String>,
    pub parts: Vec<Part>,
}

impl Score {
    /// Number of measures, taken from the first part. Standard MusicXML
    /// keeps the measure structure identical across parts.
    pub fn measure_count(&self) -> usize {
        self.parts.first().map_or(0, |p| p.measures.len())
    }
}

/// One instrument line.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// MusicXML part id (e.g. "P1").
    pub id: String,
    pub name: String,
    /// General MIDI program from `<midi-instrument>`, if declared.
    pub midi_program: Option<u8>,
    /// Declared MIDI channel (1-based in MusicXML, stored 0-based).
    pub midi_channel: Option<u8>,
    pub measures: Vec<Measure>,
}

/// A single measure with its *resolved* attributes: clef, key and time
/// signature are inherited from the previous measure when the document
/// does not restate them, so every measure carries usable values.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    /// Position within the owning part (0-based).
    pub index: usize,
    /// Pickup/anacrusis measure: exempt from the duration invariant.
    pub partial: bool,
    pub clef: Clef,
    /// Sharps (positive) or flats (negative) in the key signature.
    pub key_fifths: i32,
    pub time: TimeSig,
    /// Voices sorted by voice number; each is an independent event line.
    pub voices: Vec<Voice>,
    /// Directions anchored at a beat offset within the measure.
    pub directions: Vec<Direction>,
    /// Forward repeat barline at the left of this measure.
    pub repeat_start: bool,
    /// Backward repeat barline at the right of this measure.
    pub repeat_end: bool,
    /// Volta bracket covering this measure, if any.
    pub ending: Option<Ending>,
}

impl Measure {
    /// Nominal duration under the active time signature, as a fraction of
    /// a whole note.
    pub fn nominal_duration(&self) -> Duration {
        self.time.nominal_duration()
    }

    /// Actual sounding duration: the longest voice for partial measures,
    /// the nominal duration otherwise.
    pub fn sounding_duration(&self) -> Duration {
        if self.partial {
            self.voices
                .iter()
                .map(Voice::total_duration)
                .max()
                .unwrap_or_else(|| self.nominal_duration())
        } else {
            self.nominal_duration()
        }
    }
}

/// Time signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSig {
    pub beats: u8,
    pub beat_type: u8,
}

impl TimeSig {
    pub const COMMON: TimeSig = TimeSig { beats: 4, beat_type: 4 };

    pub fn nominal_duration(&self) -> Duration {
        Rational32::new(self.beats as i32, self.beat_type as i32)
    }

    /// Measure length in quarter notes.
    pub fn quarters(&self) -> f64 {
        self.beats as f64 * 4.0 / self.beat_type as f64
    }
}

/// Clef, reduced to the signs the renderer knows how to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clef {
    #[default]
    Treble,
    Bass,
    Alto,
}

/// One rhythmic line within a measure.
#[derive(Debug, Clone, PartialEq)]
pub struct Voice {
    /// MusicXML voice number (1-based).
    pub number: u8,
    pub events: Vec<NoteEvent>,
}

impl Voice {
    pub fn total_duration(&self) -> Duration {
        self.events
            .iter()
            .map(NoteEvent::duration)
            .fold(Rational32::new(0, 1), |acc, d| acc + d)
    }
}

/// A sounding or silent event. Tagged union dispatched by matching — the
/// three cases have genuinely different payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteEvent {
    Note {
        pitch: Pitch,
        duration: Duration,
        tie: Tie,
        /// Tuplet ratio from `<time-modification>`: (actual, normal),
        /// e.g. (3, 2) for a triplet. Display metadata; the duration
        /// already reflects it.
        tuplet: Option<(u8, u8)>,
    },
    Chord {
        /// Pitches sorted ascending by MIDI number; all share one onset
        /// and duration.
        pitches: Vec<Pitch>,
        duration: Duration,
        tie: Tie,
    },
    Rest {
        duration: Duration,
    },
}

impl NoteEvent {
    pub fn duration(&self) -> Duration {
        match self {
            NoteEvent::Note { duration, .. }
            | NoteEvent::Chord { duration, .. }
            | NoteEvent::Rest { duration } => *duration,
        }
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, NoteEvent::Rest { .. })
    }
}

/// Tie flags on a note event. `stop` links the event to the same-pitch
/// event it is tied *from*; the link is resolved (and unmatched markers
/// demoted to warnings) by the model builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tie {
    pub start: bool,
    pub stop: bool,
}

impl Tie {
    pub const NONE: Tie = Tie { start: false, stop: false };
}

/// Diatonic step letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    C,
    D,
    E,
    F,
    G,
    A,
    B,
}

impl Step {
    /// Semitones above C.
    pub fn semitones(self) -> i32 {
        match self {
            Step::C => 0,
            Step::D => 2,
            Step::E => 4,
            Step::F => 5,
            Step::G => 7,
            Step::A => 9,
            Step::B => 11,
        }
    }

    /// Diatonic index (C=0 .. B=6), for staff positioning.
    pub fn diatonic(self) -> i32 {
        match self {
            Step::C => 0,
            Step::D => 1,
            Step::E => 2,
            Step::F => 3,
            Step::G => 4,
            Step::A => 5,
            Step::B => 6,
        }
    }

    pub fn from_name(name: &str) -> Option<Step> {
        match name {
            "C" => Some(Step::C),
            "D" => Some(Step::D),
            "E" => Some(Step::E),
            "F" => Some(Step::F),
            "G" => Some(Step::G),
            "A" => Some(Step::A),
            "B" => Some(Step::B),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::C => "C",
            Step::D => "D",
            Step::E => "E",
            Step::F => "F",
            Step::G => "G",
            Step::A => "A",
            Step::B => "B",
        }
    }
}

/// Spelled pitch: step + chromatic alteration + octave (middle C = C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pitch {
    pub step: Step,
    /// Alteration in semitones: -2 (double flat) .. +2 (double sharp).
    pub alter: i8,
    pub octave: i8,
}

impl Pitch {
    /// MIDI note number, clamped to 0..=127. C4 = 60.
    pub fn midi_number(&self) -> u8 {
        let n = (self.octave as i32 + 1) * 12 + self.step.semitones() + self.alter as i32;
        n.clamp(0, 127) as u8
    }
}

/// A direction anchored at a beat offset (fraction of a whole note from
/// the measure start).
#[derive(Debug, Clone, PartialEq)]
pub struct Direction {
    pub beat: Duration,
    pub kind: DirectionKind,
}

/// The direction kinds the pipeline acts on. Tempo feeds the timeline and
/// MIDI; the navigation marks drive the unroller; dynamics and words are
/// rendered only.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectionKind {
    /// Quarter-note beats per minute.
    Tempo(f64),
    Dynamic(String),
    Words(String),
    Segno,
    Coda,
    DaCapo,
    DalSegno,
    Fine,
    ToCoda,
}

/// Volta (ending) bracket attached to a measure. A single-measure volta
/// both starts and stops on the same measure.
#[derive(Debug, Clone, PartialEq)]
pub struct Ending {
    /// Repeat passes on which this measure plays (1-based).
    pub numbers: Vec<u32>,
    /// Bracket opens at this measure.
    pub starts: bool,
    /// Bracket closes at this measure (stop or discontinue).
    pub stops: bool,
    /// Closed open-ended (`discontinue`), without the downward hook.
    pub discontinue: bool,
}
