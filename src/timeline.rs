//! Timing unroller: expands the repeat structure into play order and
//! assigns wall-clock timestamps.
//!
//! The unrolled sequence is the foundation for both the playback map and
//! MIDI generation. Handles forward/backward repeats, volta brackets,
//! D.C./D.S./Fine/To Coda navigation, and treats repeats as not retaken
//! after a navigation jump (senza ripetizione). The walk is bounded by an
//! iteration budget so a malformed repeat graph can never hang the
//! pipeline: on exhaustion the sequence is truncated with a warning.

use std::collections::HashMap;

use num_rational::Rational32;

use crate::error::UnrollError;
use crate::layout::ScoreLayout;
use crate::model::{DirectionKind, Duration, Measure, Score};

const DEFAULT_TEMPO: f64 = 120.0;

/// Iteration budget multiplier. A section with N volta endings walks its
/// body about N times, so the budget caps the ending count a score can
/// express rather than the score length.
const MAX_PASSES_PER_MEASURE: usize = 64;

/// One measure occurrence in play order.
#[derive(Debug, Clone)]
pub struct UnrolledMeasure {
    /// Index into `Part.measures`.
    pub index: usize,
    /// 1-based repeat pass active when this occurrence plays.
    pub pass: u32,
    /// Wall-clock start, milliseconds from the beginning.
    pub start_ms: f64,
    pub duration_ms: f64,
    /// Active tempo in quarter-note bpm.
    pub tempo_bpm: f64,
    /// Sounding length in quarter notes (pickups are shorter than the
    /// time signature's nominal length).
    pub quarters: f64,
}

/// One cursor position: a beat onset in play order with its page
/// coordinates.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub time_ms: f64,
    /// Original measure index.
    pub measure: usize,
    pub pass: u32,
    /// Onset within the measure, fraction of a whole note.
    pub beat: Duration,
    pub x: f64,
    pub y: f64,
}

pub fn total_duration_ms(unrolled: &[UnrolledMeasure]) -> f64 {
    unrolled.last().map_or(0.0, |m| m.start_ms + m.duration_ms)
}

/// Effective tempo at each measure, resolved in score order so jumps
/// restore the tempo in effect at the destination.
fn measure_tempos(measures: &[Measure]) -> Vec<f64> {
    let mut tempos = Vec::with_capacity(measures.len());
    let mut tempo = DEFAULT_TEMPO;
    for measure in measures {
        for dir in &measure.directions {
            if let DirectionKind::Tempo(bpm) = dir.kind {
                if bpm > 0.0 {
                    tempo = bpm;
                }
            }
        }
        tempos.push(tempo);
    }
    tempos
}

/// Measure index → pass numbers on which it plays, expanded from the
/// volta start/stop brackets.
fn volta_map(measures: &[Measure]) -> HashMap<usize, Vec<u32>> {
    let mut map = HashMap::new();
    let mut current: Option<Vec<u32>> = None;
    for (i, m) in measures.iter().enumerate() {
        if let Some(ending) = &m.ending {
            if ending.starts {
                current = Some(ending.numbers.clone());
            }
            let nums = current.clone().unwrap_or_else(|| ending.numbers.clone());
            map.insert(i, nums);
            if ending.stops {
                current = None;
            }
        } else if let Some(nums) = &current {
            map.insert(i, nums.clone());
        }
        // A backward repeat closes the bracket even when the stop marker
        // is missing from the document.
        if m.repeat_end {
            current = None;
        }
    }
    map
}

/// Total passes each repeat section needs: 2 for a plain repeat, more
/// when volta brackets name higher passes.
fn section_max_passes(
    measures: &[Measure],
    voltas: &HashMap<usize, Vec<u32>>,
) -> HashMap<usize, u32> {
    let mut map: HashMap<usize, u32> = HashMap::new();
    let mut current_forward = 0usize;
    for (i, m) in measures.iter().enumerate() {
        if m.repeat_start {
            current_forward = i;
        }
        if let Some(nums) = voltas.get(&i) {
            let entry = map.entry(current_forward).or_insert(2);
            for &n in nums {
                if n > *entry {
                    *entry = n;
                }
            }
        }
    }
    map
}

/// Expand the repeat structure of the score (part 0 carries the shared
/// navigation) into play order with timestamps.
pub fn unroll(score: &Score) -> Result<Vec<UnrolledMeasure>, UnrollError> {
    let measures: &[Measure] = match score.parts.first() {
        Some(p) => &p.measures,
        None => return Ok(Vec::new()),
    };
    if measures.is_empty() {
        return Ok(Vec::new());
    }

    let segno_index = measures.iter().position(|m| {
        m.directions.iter().any(|d| d.kind == DirectionKind::Segno)
    });
    let coda_index = measures.iter().position(|m| {
        m.directions.iter().any(|d| d.kind == DirectionKind::Coda)
    });
    let voltas = volta_map(measures);
    let max_passes = section_max_passes(measures, &voltas);
    let tempos = measure_tempos(measures);

    let mut out: Vec<UnrolledMeasure> = Vec::new();
    let mut time_ms = 0.0f64;
    let mut pos = 0usize;
    let mut repeat_start = 0usize;
    let mut repeat_pass = 1u32;
    let mut jump_taken = false;

    let budget = measures.len() * MAX_PASSES_PER_MEASURE;
    let mut iterations = 0usize;

    while pos < measures.len() {
        iterations += 1;
        if iterations > budget {
            // Every iteration either emits or advances `pos`, so an empty
            // result here means the walk invariants were broken.
            if out.is_empty() {
                debug_assert!(false, "budget exhausted without emitting");
                return Err(UnrollError::Unbounded);
            }
            log::warn!(
                "repeat unrolling exceeded {budget} iterations; truncating after {} measures",
                out.len()
            );
            break;
        }

        let measure = &measures[pos];

        // Only the first encounter anchors the section start; later
        // passes arrive here by jumping back.
        if measure.repeat_start && repeat_pass == 1 {
            repeat_start = pos;
        }

        // Volta skip: bracket does not cover the current pass.
        if let Some(nums) = voltas.get(&pos) {
            if !nums.contains(&repeat_pass) {
                pos += 1;
                continue;
            }
        }

        let has_fine = measure.directions.iter().any(|d| d.kind == DirectionKind::Fine);
        let has_to_coda = measure.directions.iter().any(|d| d.kind == DirectionKind::ToCoda);

        let emit = |time_ms: f64| {
            let quarters = {
                let d = measure.sounding_duration();
                (*d.numer() as f64 / *d.denom() as f64) * 4.0
            };
            let tempo = tempos[pos];
            let duration_ms = quarters * 60_000.0 / tempo;
            UnrolledMeasure {
                index: pos,
                pass: repeat_pass,
                start_ms: time_ms,
                duration_ms,
                tempo_bpm: tempo,
                quarters,
            }
        };

        let entry = emit(time_ms);
        time_ms += entry.duration_ms;
        out.push(entry);

        // Fine stops the walk on the post-jump pass, after sounding the
        // marked measure.
        if jump_taken && has_fine {
            break;
        }

        // To Coda fires on the post-jump pass, after sounding the marked
        // measure.
        if jump_taken && has_to_coda {
            if let Some(coda) = coda_index {
                pos = coda;
                jump_taken = false;
                continue;
            }
        }

        // Backward repeat; not retaken after a navigation jump.
        if !jump_taken && measure.repeat_end {
            let max = max_passes.get(&repeat_start).copied().unwrap_or(2);
            if repeat_pass < max {
                repeat_pass += 1;
                pos = repeat_start;
                continue;
            }
        }

        // One-shot navigation jumps.
        if !jump_taken {
            let jump = measure.directions.iter().find_map(|d| match d.kind {
                DirectionKind::DaCapo => Some(0),
                DirectionKind::DalSegno => segno_index,
                _ => None,
            });
            if let Some(target) = jump {
                pos = target;
                jump_taken = true;
                repeat_pass = 1;
                continue;
            }
        }

        pos += 1;

        // Leaving a finished repeat section resets the pass counter and
        // re-anchors implicit backward repeats at the current position.
        // The counter re-arms only on exits through a backward repeat; a
        // section left through its final volta keeps the pass label.
        if repeat_pass > 1 && measures[pos - 1].repeat_end && !voltas.contains_key(&pos) {
            repeat_pass = 1;
            repeat_start = pos;
        }
    }

    Ok(out)
}

/// Build cursor entries: one per beat onset of each unrolled measure,
/// with coordinates taken from the layout. `time_ms` is monotone
/// non-decreasing across the whole timeline.
pub fn build_timeline(
    score: &Score,
    layout: &ScoreLayout,
    unrolled: &[UnrolledMeasure],
) -> Vec<TimelineEntry> {
    let mut entries = Vec::new();
    for um in unrolled {
        let geom = &layout.measures[um.index];
        let y = layout.system_of(um.index).y;
        let ms_per_quarter = 60_000.0 / um.tempo_bpm;

        if geom.beat_x.is_empty() {
            entries.push(TimelineEntry {
                time_ms: um.start_ms,
                measure: um.index,
                pass: um.pass,
                beat: Rational32::new(0, 1),
                x: geom.x + geom.left_inset,
                y,
            });
            continue;
        }

        for &(beat, x) in &geom.beat_x {
            let beat_quarters = (*beat.numer() as f64 / *beat.denom() as f64) * 4.0;
            // Clamp into the measure so a trailing onset in an over-full
            // voice cannot run past the next measure's start.
            let offset = (beat_quarters * ms_per_quarter).min(um.duration_ms);
            entries.push(TimelineEntry {
                time_ms: um.start_ms + offset,
                measure: um.index,
                pass: um.pass,
                beat,
                x,
                y,
            });
        }
    }
    entries
}
