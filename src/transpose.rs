//! Chromatic transposition over the score model.
//!
//! Pure structural mapping: the score is rebuilt with every pitch shifted
//! by the requested number of semitones and respelled. Pitch class is
//! always exact; the spelling of black-key pitches follows the active key
//! signature, falling back to the shift direction when the key is neutral.

use crate::model::{NoteEvent, Pitch, Score, Step};

/// Return a copy of `score` with every pitch shifted by `semitones`.
/// A shift of 0 is the identity and yields byte-identical downstream
/// output.
pub fn transpose_score(score: &Score, semitones: i32) -> Score {
    if semitones == 0 {
        return score.clone();
    }

    let mut out = score.clone();
    for part in &mut out.parts {
        for measure in &mut part.measures {
            let key_fifths = measure.key_fifths;
            for voice in &mut measure.voices {
                for event in &mut voice.events {
                    match event {
                        NoteEvent::Note { pitch, .. } => {
                            *pitch = shift_pitch(*pitch, semitones, key_fifths);
                        }
                        NoteEvent::Chord { pitches, .. } => {
                            for p in pitches.iter_mut() {
                                *p = shift_pitch(*p, semitones, key_fifths);
                            }
                            pitches.sort_by_key(Pitch::midi_number);
                        }
                        NoteEvent::Rest { .. } => {}
                    }
                }
            }
        }
    }
    out
}

/// Shift one pitch and respell it. Naturals are always spelled natural;
/// black keys use sharps in sharp keys and flats in flat keys. In a
/// neutral key the shift direction decides.
fn shift_pitch(pitch: Pitch, semitones: i32, key_fifths: i32) -> Pitch {
    // Absolute chromatic position, octave -1 at 0. Unclamped so extreme
    // shifts round-trip exactly; MIDI clamping happens at emission.
    let abs = (pitch.octave as i32 + 1) * 12
        + pitch.step.semitones()
        + pitch.alter as i32
        + semitones;

    let prefer_sharps = key_fifths > 0 || (key_fifths == 0 && semitones > 0);
    let (step, alter) = spell_pitch_class(abs.rem_euclid(12), prefer_sharps);

    // Table spellings satisfy step.semitones() + alter == pitch class, so
    // the octave falls straight out of the chromatic position.
    let octave = (abs.div_euclid(12) - 1) as i8;
    Pitch { step, alter, octave }
}

/// Canonical spelling for a pitch class 0..=11.
fn spell_pitch_class(pc: i32, prefer_sharps: bool) -> (Step, i8) {
    match pc {
        0 => (Step::C, 0),
        1 if prefer_sharps => (Step::C, 1),
        1 => (Step::D, -1),
        2 => (Step::D, 0),
        3 if prefer_sharps => (Step::D, 1),
        3 => (Step::E, -1),
        4 => (Step::E, 0),
        5 => (Step::F, 0),
        6 if prefer_sharps => (Step::F, 1),
        6 => (Step::G, -1),
        7 => (Step::G, 0),
        8 if prefer_sharps => (Step::G, 1),
        8 => (Step::A, -1),
        9 => (Step::A, 0),
        10 if prefer_sharps => (Step::A, 1),
        10 => (Step::B, -1),
        _ => (Step::B, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Clef, Duration, Measure, Part, Tie, TimeSig, Voice};
    use num_rational::Rational32;
    use pretty_assertions::assert_eq;

    fn quarter() -> Duration {
        Rational32::new(1, 4)
    }

    fn note(step: Step, alter: i8, octave: i8) -> NoteEvent {
        NoteEvent::Note {
            pitch: Pitch { step, alter, octave },
            duration: quarter(),
            tie: Tie::NONE,
            tuplet: None,
        }
    }

    fn one_measure_score(key_fifths: i32, events: Vec<NoteEvent>) -> Score {
        Score {
            title: None,
            parts: vec![Part {
                id: "P1".into(),
                name: "Music".into(),
                midi_program: None,
                midi_channel: None,
                measures: vec![Measure {
                    index: 0,
                    partial: true,
                    clef: Clef::Treble,
                    key_fifths,
                    time: TimeSig::COMMON,
                    voices: vec![Voice { number: 1, events }],
                    directions: vec![],
                    repeat_start: false,
                    repeat_end: false,
                    ending: None,
                }],
            }],
        }
    }

    fn first_pitch(score: &Score) -> Pitch {
        match &score.parts[0].measures[0].voices[0].events[0] {
            NoteEvent::Note { pitch, .. } => *pitch,
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn zero_shift_is_identity() {
        let score = one_measure_score(0, vec![note(Step::C, 1, 4)]);
        assert_eq!(transpose_score(&score, 0), score);
    }

    #[test]
    fn octave_shift_preserves_spelling() {
        let score = one_measure_score(0, vec![note(Step::E, 0, 4)]);
        let up = transpose_score(&score, 12);
        assert_eq!(first_pitch(&up), Pitch { step: Step::E, alter: 0, octave: 5 });
    }

    #[test]
    fn midi_numbers_shift_exactly() {
        let score = one_measure_score(0, vec![note(Step::A, 0, 4)]);
        for shift in [-7, -1, 1, 3, 12] {
            let shifted = transpose_score(&score, shift);
            assert_eq!(
                first_pitch(&shifted).midi_number() as i32,
                69 + shift,
                "shift {shift}"
            );
        }
    }

    #[test]
    fn sharp_key_prefers_sharps() {
        // D major (2 sharps): C4 down a semitone is B3, up one is C#4.
        let score = one_measure_score(2, vec![note(Step::C, 0, 4)]);
        let up = transpose_score(&score, 1);
        assert_eq!(first_pitch(&up), Pitch { step: Step::C, alter: 1, octave: 4 });
    }

    #[test]
    fn flat_key_prefers_flats() {
        // F major (1 flat): up a semitone from C is Db, even though the
        // shift direction alone would say C#.
        let score = one_measure_score(-1, vec![note(Step::C, 0, 4)]);
        let up = transpose_score(&score, 1);
        assert_eq!(first_pitch(&up), Pitch { step: Step::D, alter: -1, octave: 4 });
    }

    #[test]
    fn neutral_key_follows_shift_direction() {
        let score = one_measure_score(0, vec![note(Step::C, 0, 4)]);
        let up = transpose_score(&score, 1);
        assert_eq!(first_pitch(&up), Pitch { step: Step::C, alter: 1, octave: 4 });
        let down = transpose_score(&score, -11);
        assert_eq!(first_pitch(&down), Pitch { step: Step::D, alter: -1, octave: 3 });
    }

    #[test]
    fn octave_boundary_crossing() {
        let score = one_measure_score(0, vec![note(Step::B, 0, 3)]);
        let up = transpose_score(&score, 1);
        assert_eq!(first_pitch(&up), Pitch { step: Step::C, alter: 0, octave: 4 });
        let score = one_measure_score(0, vec![note(Step::C, 0, 4)]);
        let down = transpose_score(&score, -1);
        assert_eq!(first_pitch(&down), Pitch { step: Step::B, alter: 0, octave: 3 });
    }

    #[test]
    fn round_trip_preserves_pitch_class() {
        let score = one_measure_score(
            0,
            vec![note(Step::F, 1, 4), note(Step::B, -1, 3), note(Step::G, 0, 5)],
        );
        let back = transpose_score(&transpose_score(&score, 5), -5);
        let original: Vec<u8> = score.parts[0].measures[0].voices[0]
            .events
            .iter()
            .map(|e| match e {
                NoteEvent::Note { pitch, .. } => pitch.midi_number(),
                _ => unreachable!(),
            })
            .collect();
        let returned: Vec<u8> = back.parts[0].measures[0].voices[0]
            .events
            .iter()
            .map(|e| match e {
                NoteEvent::Note { pitch, .. } => pitch.midi_number(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(original, returned);
    }

    #[test]
    fn chord_pitches_stay_sorted() {
        let chord = NoteEvent::Chord {
            pitches: vec![
                Pitch { step: Step::C, alter: 0, octave: 4 },
                Pitch { step: Step::E, alter: 0, octave: 4 },
                Pitch { step: Step::G, alter: 0, octave: 4 },
            ],
            duration: quarter(),
            tie: Tie::NONE,
        };
        let score = one_measure_score(0, vec![chord]);
        let shifted = transpose_score(&score, 3);
        match &shifted.parts[0].measures[0].voices[0].events[0] {
            NoteEvent::Chord { pitches, .. } => {
                let midi: Vec<u8> = pitches.iter().map(Pitch::midi_number).collect();
                assert_eq!(midi, vec![63, 67, 70]);
            }
            other => panic!("expected chord, got {other:?}"),
        }
    }

    #[test]
    fn rests_are_untouched() {
        let score = one_measure_score(0, vec![NoteEvent::Rest { duration: quarter() }]);
        let shifted = transpose_score(&score, 7);
        assert_eq!(
            shifted.parts[0].measures[0].voices[0].events,
            vec![NoteEvent::Rest { duration: quarter() }]
        );
    }
}
