//! Layout engine: maps the score model onto page coordinates.
//!
//! The geometry pass is separate from SVG emission so the playback map
//! and the timeline can reuse the same coordinates. All positions are in
//! SVG user units. The layout is fully deterministic: identical input
//! always yields identical geometry.

pub mod svg;

use std::collections::BTreeSet;

use num_rational::Rational32;

use crate::error::LayoutError;
use crate::model::{Clef, Duration, Measure, Score};

// ── Page ─────────────────────────────────────────────────────────────
pub const DEFAULT_PAGE_WIDTH: f64 = 820.0;
pub const PAGE_HEIGHT: f64 = 1160.0;
const PAGE_MARGIN_LEFT: f64 = 50.0;
const PAGE_MARGIN_RIGHT: f64 = 30.0;
const PAGE_MARGIN_TOP: f64 = 30.0;
const PAGE_MARGIN_BOTTOM: f64 = 30.0;

// ── Staff ────────────────────────────────────────────────────────────
pub(crate) const STAFF_LINE_SPACING: f64 = 10.0;
pub(crate) const STAFF_HEIGHT: f64 = 40.0;
const SYSTEM_SPACING: f64 = 90.0;
const PART_GAP: f64 = 80.0;
const HEADER_HEIGHT: f64 = 70.0;
const FIRST_SYSTEM_TOP: f64 = PAGE_MARGIN_TOP + HEADER_HEIGHT;

// ── Prefix widths ────────────────────────────────────────────────────
const CLEF_SPACE: f64 = 32.0;
const KEY_SIG_SHARP_SPACE: f64 = 10.0;
const KEY_SIG_FLAT_SPACE: f64 = 8.0;
const TIME_SIG_SPACE: f64 = 24.0;

// ── Measure packing ──────────────────────────────────────────────────
const MIN_MEASURE_WIDTH: f64 = 38.0;
const PER_BEAT_MIN_WIDTH: f64 = 55.0;
const MIN_ONSET_SPACING: f64 = 12.0;
const DEFAULT_INSET: f64 = 14.0;
const REPEAT_LEFT_INSET: f64 = 28.0;
const REPEAT_RIGHT_INSET: f64 = 30.0;

/// Complete page geometry for a score at one page width.
#[derive(Debug, Clone)]
pub struct ScoreLayout {
    pub page_width: f64,
    pub total_height: f64,
    pub page_count: usize,
    pub systems: Vec<SystemGeom>,
    /// One entry per measure index, in score order.
    pub measures: Vec<MeasureGeom>,
}

/// One system (line of music).
#[derive(Debug, Clone)]
pub struct SystemGeom {
    pub index: usize,
    pub page: usize,
    /// Top of the first staff, absolute y.
    pub y: f64,
    pub x_start: f64,
    pub x_end: f64,
    /// Vertical offset of each part's staff from the system top.
    pub part_offsets: Vec<f64>,
    /// Time signature is drawn on the first system and after changes.
    pub show_time: bool,
}

/// One measure's horizontal slot within its system.
#[derive(Debug, Clone)]
pub struct MeasureGeom {
    pub index: usize,
    pub system: usize,
    pub x: f64,
    pub width: f64,
    pub left_inset: f64,
    pub right_inset: f64,
    /// Beat onset (fraction of a whole note from measure start) to x
    /// position, for every onset occurring in any part or voice. Sorted.
    pub beat_x: Vec<(Duration, f64)>,
    /// Key or time signature restated at the start of this measure.
    pub key_change: bool,
    pub time_change: bool,
}

impl MeasureGeom {
    /// X position of a beat onset; nearest mapped onset when the exact
    /// beat is absent (e.g. a timeline probe between notes).
    pub fn beat_to_x(&self, beat: Duration) -> f64 {
        if let Ok(i) = self.beat_x.binary_search_by(|(b, _)| b.cmp(&beat)) {
            return self.beat_x[i].1;
        }
        let mut best = self.x + self.left_inset;
        let mut best_dist: Option<Duration> = None;
        for &(b, x) in &self.beat_x {
            let dist = if b > beat { b - beat } else { beat - b };
            if best_dist.map_or(true, |d| dist < d) {
                best_dist = Some(dist);
                best = x;
            }
        }
        best
    }
}

impl ScoreLayout {
    pub fn system_of(&self, measure: usize) -> &SystemGeom {
        &self.systems[self.measures[measure].system]
    }
}

/// Width 0 means "use the default"; anything non-finite is an error and
/// unreasonably narrow pages are clamped up to stay drawable.
pub fn normalize_page_width(page_width: f64) -> Result<f64, LayoutError> {
    if !page_width.is_finite() {
        return Err(LayoutError::InvalidPageWidth(page_width));
    }
    if page_width <= 0.0 {
        return Ok(DEFAULT_PAGE_WIDTH);
    }
    Ok(page_width.max(MIN_MEASURE_WIDTH + PAGE_MARGIN_LEFT + PAGE_MARGIN_RIGHT + CLEF_SPACE + TIME_SIG_SPACE))
}

fn key_sig_width(fifths: i32) -> f64 {
    if fifths > 0 {
        fifths as f64 * KEY_SIG_SHARP_SPACE
    } else {
        fifths.unsigned_abs() as f64 * KEY_SIG_FLAT_SPACE
    }
}

/// Measure length in quarter notes as used for spacing weight. Pickup
/// measures weigh their sounding length, floored at one beat.
fn measure_quarters(measure: &Measure) -> f64 {
    let d = measure.sounding_duration();
    let q = (*d.numer() as f64 / *d.denom() as f64) * 4.0;
    q.max(1.0)
}

/// Compute the full page geometry.
pub fn compute_layout(score: &Score, page_width: f64) -> Result<ScoreLayout, LayoutError> {
    let page_width = normalize_page_width(page_width)?;
    let content_width = page_width - PAGE_MARGIN_LEFT - PAGE_MARGIN_RIGHT;
    let measure_count = score.measure_count();

    // Reference part drives the measure grid; standard MusicXML keeps
    // barlines aligned across parts.
    let ref_measures: &[Measure] = score.parts.first().map(|p| p.measures.as_slice()).unwrap_or(&[]);

    let mut key_change = vec![false; measure_count];
    let mut time_change = vec![false; measure_count];
    for (i, m) in ref_measures.iter().enumerate() {
        if i > 0 {
            key_change[i] = m.key_fifths != ref_measures[i - 1].key_fifths;
            time_change[i] = m.time != ref_measures[i - 1].time;
        }
    }

    // Minimum widths before justification.
    let min_widths: Vec<f64> = ref_measures
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let mut w = (measure_quarters(m) * PER_BEAT_MIN_WIDTH).max(MIN_MEASURE_WIDTH);
            if key_change[i] {
                w += key_sig_width(m.key_fifths) + 4.0;
            }
            if time_change[i] {
                w += TIME_SIG_SPACE;
            }
            w
        })
        .collect();

    // Greedy packing into systems.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group: Vec<usize> = Vec::new();
    let mut group_width = 0.0;
    for (i, &min_w) in min_widths.iter().enumerate() {
        let first_system = groups.is_empty();
        let key_at = ref_measures[i].key_fifths;
        let prefix = CLEF_SPACE
            + key_sig_width(key_at)
            + if first_system { TIME_SIG_SPACE } else { 0.0 };
        let available = content_width - prefix;
        if !group.is_empty() && group_width + min_w > available {
            groups.push(std::mem::take(&mut group));
            group_width = 0.0;
        }
        group.push(i);
        group_width += min_w;
    }
    if !group.is_empty() {
        groups.push(group);
    }

    let part_count = score.parts.len().max(1);
    let part_offsets: Vec<f64> = (0..part_count)
        .map(|p| p as f64 * (STAFF_HEIGHT + PART_GAP))
        .collect();
    let system_height = STAFF_HEIGHT + (part_count as f64 - 1.0) * (STAFF_HEIGHT + PART_GAP);

    let mut systems: Vec<SystemGeom> = Vec::new();
    let mut measures: Vec<MeasureGeom> = Vec::with_capacity(measure_count);

    let mut page = 0usize;
    let mut y = FIRST_SYSTEM_TOP;

    for (sys_idx, group) in groups.iter().enumerate() {
        // Page break when the system would run off the bottom.
        if y + system_height > PAGE_HEIGHT - PAGE_MARGIN_BOTTOM && y > PAGE_MARGIN_TOP {
            page += 1;
            y = PAGE_MARGIN_TOP;
        }
        let abs_y = page as f64 * PAGE_HEIGHT + y;

        let first_mi = group[0];
        let show_time = sys_idx == 0 || time_change[first_mi];
        let prefix = CLEF_SPACE
            + key_sig_width(ref_measures[first_mi].key_fifths)
            + if show_time { TIME_SIG_SPACE } else { 0.0 };
        let x_start = PAGE_MARGIN_LEFT + prefix;
        let x_end = PAGE_MARGIN_LEFT + content_width;

        // Justify: proportional to beat weight, filling the system.
        let weights: Vec<f64> = group.iter().map(|&mi| measure_quarters(&ref_measures[mi])).collect();
        let total_weight: f64 = weights.iter().sum();
        let scale = if total_weight > 0.0 { (x_end - x_start) / total_weight } else { 1.0 };

        let mut x = x_start;
        for (j, &mi) in group.iter().enumerate() {
            let width = weights[j] * scale;
            let system_start = j == 0;

            let mut left_inset = DEFAULT_INSET;
            if key_change[mi] && !system_start {
                left_inset += key_sig_width(ref_measures[mi].key_fifths) + 4.0;
            }
            if time_change[mi] && !system_start {
                left_inset += TIME_SIG_SPACE;
            }
            if ref_measures[mi].repeat_start {
                left_inset = left_inset.max(REPEAT_LEFT_INSET);
            }
            let mut right_inset = DEFAULT_INSET;
            if ref_measures[mi].repeat_end || mi + 1 == measure_count {
                right_inset = REPEAT_RIGHT_INSET;
            }

            let beat_x = compute_beat_x(score, mi, x, width, left_inset, right_inset);

            measures.push(MeasureGeom {
                index: mi,
                system: sys_idx,
                x,
                width,
                left_inset,
                right_inset,
                beat_x,
                key_change: key_change[mi] && !system_start,
                time_change: time_change[mi] && !system_start,
            });
            x += width;
        }

        systems.push(SystemGeom {
            index: sys_idx,
            page,
            y: abs_y,
            x_start,
            x_end,
            part_offsets: part_offsets.clone(),
            show_time,
        });

        y += system_height + SYSTEM_SPACING;
    }

    let page_count = page + 1;
    let total_height = if page_count > 1 {
        page_count as f64 * PAGE_HEIGHT
    } else {
        page as f64 * PAGE_HEIGHT + y - SYSTEM_SPACING + STAFF_HEIGHT + PAGE_MARGIN_BOTTOM
    };

    Ok(ScoreLayout { page_width, total_height, page_count, systems, measures })
}

/// Beat onset → x map for one measure: the union of onsets across every
/// part and voice, spaced proportionally to elapsed duration with a
/// minimum advance so short notes never collide.
fn compute_beat_x(
    score: &Score,
    measure_idx: usize,
    x: f64,
    width: f64,
    left_inset: f64,
    right_inset: f64,
) -> Vec<(Duration, f64)> {
    let mut onsets: BTreeSet<Duration> = BTreeSet::new();
    let mut total = Rational32::new(0, 1);
    for part in &score.parts {
        let Some(measure) = part.measures.get(measure_idx) else { continue };
        total = total.max(measure.sounding_duration());
        for voice in &measure.voices {
            let mut cursor = Rational32::new(0, 1);
            for event in &voice.events {
                onsets.insert(cursor);
                cursor += event.duration();
            }
        }
    }
    if onsets.is_empty() {
        return Vec::new();
    }

    let usable = (width - left_inset - right_inset).max(MIN_ONSET_SPACING);
    let total_f = (*total.numer() as f64 / *total.denom() as f64).max(0.001);
    let sorted: Vec<Duration> = onsets.into_iter().collect();

    // Gap between consecutive onsets, plus a trailing gap to the barline.
    let mut gaps: Vec<f64> = Vec::with_capacity(sorted.len());
    for w in sorted.windows(2) {
        let span = w[1] - w[0];
        let prop = (*span.numer() as f64 / *span.denom() as f64) / total_f * usable;
        gaps.push(prop.max(MIN_ONSET_SPACING));
    }
    let last = *sorted.last().unwrap_or(&Rational32::new(0, 1));
    let tail = total - last;
    let tail_prop = (*tail.numer() as f64 / *tail.denom() as f64) / total_f * usable;
    gaps.push(tail_prop.max(MIN_ONSET_SPACING));

    let gap_sum: f64 = gaps.iter().sum();
    let scale = if gap_sum > 0.0 { usable / gap_sum } else { 1.0 };

    let mut out = Vec::with_capacity(sorted.len());
    let mut bx = x + left_inset;
    for (i, beat) in sorted.into_iter().enumerate() {
        out.push((beat, bx));
        bx += gaps[i] * scale;
    }
    out
}

/// Vertical position of a pitch on a staff whose top line is at
/// `staff_top`. Each diatonic step is half a line spacing.
pub(crate) fn staff_y(step_diatonic: i32, octave: i32, clef: Clef, staff_top: f64) -> f64 {
    let pos = octave * 7 + step_diatonic;
    // Reference: the pitch sitting on the bottom staff line.
    let bottom_ref = match clef {
        Clef::Treble => 4 * 7 + 2, // E4
        Clef::Bass => 2 * 7 + 4,   // G2
        Clef::Alto => 3 * 7 + 3,   // F3
    };
    staff_top + STAFF_HEIGHT - (pos - bottom_ref) as f64 * (STAFF_LINE_SPACING / 2.0)
}
