//! Deterministic SVG emission over the computed layout.
//!
//! Output structure: one `<svg>` element containing `<g id="page-N">`
//! groups, each holding `<g id="system-N">` groups, each holding
//! `<g id="measure-N">` groups. The ids are stable across renders of the
//! same document so a host can address any measure for highlighting.
//! All coordinates are written with one decimal so formatting is
//! platform-independent.

use num_rational::Rational32;

use crate::layout::{staff_y, MeasureGeom, ScoreLayout, STAFF_HEIGHT, STAFF_LINE_SPACING};
use crate::model::{Clef, Duration, Measure, NoteEvent, Pitch, Score, Step};

const NOTE_COLOR: &str = "#1a1a1a";
const STAFF_COLOR: &str = "#555555";
const BARLINE_COLOR: &str = "#333333";
const STAFF_LINE_WIDTH: f64 = 0.8;
const BARLINE_WIDTH: f64 = 1.0;
const NOTEHEAD_RX: f64 = 5.5;
const NOTEHEAD_RY: f64 = 4.0;
const STEM_LENGTH: f64 = 30.0;
const STEM_WIDTH: f64 = 1.2;
const LEDGER_EXTEND: f64 = 5.0;

fn render_system(svg: &mut SvgBuilder, score: &Score, layout: &ScoreLayout, sys_idx: usize) {
    let system = &layout.systems[sys_idx];
    let in_system: Vec<&MeasureGeom> =
        layout.measures.iter().filter(|m| m.system == sys_idx).collect();
    let Some(first) = in_system.first() else { return };
    let left = system.x_start - prefix_width_of(score, first.index, system.show_time);

    for (part_idx, part) in score.parts.iter().enumerate() {
        let staff_top = system.y + system.part_offsets[part_idx];
        let Some(measure) = part.measures.get(first.index) else { continue };

        // Five staff lines spanning the whole system.
        for line in 0..5 {
            let y = staff_top + line as f64 * STAFF_LINE_SPACING;
            svg.line(left, y, system.x_end, y, STAFF_COLOR, STAFF_LINE_WIDTH);
        }

        let mut x = left;
        x += render_clef(svg, measure.clef, x, staff_top);
        x += render_key_signature(svg, measure.key_fifths, measure.clef, x, staff_top);
        if system.show_time {
            render_time_signature(svg, measure, x, staff_top);
        }

        // Opening barline.
        svg.line(left, staff_top, left, staff_top + STAFF_HEIGHT, BARLINE_COLOR, BARLINE_WIDTH);
    }

    for geom in &in_system {
        svg.open_group(&format!("measure-{}", geom.index));
        render_measure(svg, score, system.y, &system.part_offsets, geom);
        svg.close_group();
    }
}

fn prefix_width_of(score: &Score, measure_idx: usize, show_time: bool) -> f64 {
    let Some(measure) = score.parts.first().and_then(|p| p.measures.get(measure_idx)) else {
        return 0.0;
    };
    let key = if measure.key_fifths > 0 {
        measure.key_fifths as f64 * 10.0
    } else {
        measure.key_fifths.unsigned_abs() as f64 * 8.0
    };
    32.0 + key + if show_time { 24.0 } else { 0.0 }
}

fn render_measure(
    svg: &mut SvgBuilder,
    score: &Score,
    system_y: f64,
    part_offsets: &[f64],
    geom: &MeasureGeom,
) {
    let total_measures = score.measure_count();

    for (part_idx, part) in score.parts.iter().enumerate() {
        let Some(measure) = part.measures.get(geom.index) else { continue };
        let staff_top = system_y + part_offsets[part_idx];

        // Restated signatures after a mid-system change.
        let mut sig_x = geom.x + 4.0;
        if geom.key_change {
            sig_x += render_key_signature(svg, measure.key_fifths, measure.clef, sig_x, staff_top);
        }
        if geom.time_change {
            render_time_signature(svg, measure, sig_x, staff_top);
        }

        render_barlines(svg, measure, geom, staff_top, geom.index + 1 == total_measures);

        if part_idx == 0 {
            render_ending_bracket(svg, measure, geom, staff_top);
        }

        let many_voices = measure.voices.len() > 1;
        for (voice_idx, voice) in measure.voices.iter().enumerate() {
            let forced_stem = many_voices.then_some(voice_idx == 0);
            let mut cursor = Rational32::new(0, 1);
            for event in &voice.events {
                let x = geom.beat_to_x(cursor);
                match event {
                    NoteEvent::Note { pitch, duration, tuplet, .. } => {
                        let shape = NoteShape::of(*duration, *tuplet);
                        render_note(svg, &[*pitch], &shape, measure.clef, x, staff_top, forced_stem);
                    }
                    NoteEvent::Chord { pitches, duration, .. } => {
                        let shape = NoteShape::of(*duration, None);
                        render_note(svg, pitches, &shape, measure.clef, x, staff_top, forced_stem);
                    }
                    NoteEvent::Rest { duration } => {
                        let shape = NoteShape::of(*duration, None);
                        render_rest(svg, &shape, x, staff_top);
                    }
                }
                cursor += event.duration();
            }
        }
    }

}

// ── Fixed glyphs ─────────────────────────────────────────────────────

fn render_clef(svg: &mut SvgBuilder, clef: Clef, x: f64, staff_top: f64) -> f64 {
    let (glyph, y, size) = match clef {
        // Anchored on the G, F and C lines respectively.
        Clef::Treble => ("\u{1D11E}", staff_top + 30.0, 42.0),
        Clef::Bass => ("\u{1D122}", staff_top + 10.0, 42.0),
        Clef::Alto => ("\u{1D121}", staff_top + 20.0, 42.0),
    };
    svg.glyph(x + 4.0, y, glyph, size);
    32.0
}

/// Staff positions (step, octave) for key-signature accidentals, in
/// engraving order.
fn key_sig_positions(fifths: i32, clef: Clef) -> Vec<(Step, i32)> {
    const SHARPS: [(Step, i32); 7] = [
        (Step::F, 5), (Step::C, 5), (Step::G, 5), (Step::D, 5),
        (Step::A, 4), (Step::E, 5), (Step::B, 4),
    ];
    const FLATS: [(Step, i32); 7] = [
        (Step::B, 4), (Step::E, 5), (Step::A, 4), (Step::D, 5),
        (Step::G, 4), (Step::C, 5), (Step::F, 4),
    ];
    let count = fifths.unsigned_abs().min(7) as usize;
    let table = if fifths > 0 { &SHARPS } else { &FLATS };
    // Treble positions; bass sits a ninth lower, alto a step lower.
    let octave_shift = match clef {
        Clef::Treble => 0,
        Clef::Bass => -2,
        Clef::Alto => -1,
    };
    table[..count]
        .iter()
        .map(|&(step, octave)| {
            let adjusted = if clef == Clef::Bass && step.diatonic() >= Step::G.diatonic() {
                octave + octave_shift + 1
            } else {
                octave + octave_shift
            };
            (step, adjusted)
        })
        .collect()
}

fn render_key_signature(svg: &mut SvgBuilder, fifths: i32, clef: Clef, x: f64, staff_top: f64) -> f64 {
    if fifths == 0 {
        return 0.0;
    }
    let glyph = if fifths > 0 { "\u{266F}" } else { "\u{266D}" };
    let advance = if fifths > 0 { 10.0 } else { 8.0 };
    for (i, (step, octave)) in key_sig_positions(fifths, clef).into_iter().enumerate() {
        let y = staff_y(step.diatonic(), octave, clef, staff_top);
        svg.glyph(x + i as f64 * advance, y + 4.0, glyph, 18.0);
    }
    fifths.unsigned_abs().min(7) as f64 * advance
}

fn render_time_signature(svg: &mut SvgBuilder, measure: &Measure, x: f64, staff_top: f64) {
    let cx = x + 10.0;
    svg.text(cx, staff_top + 17.0, &measure.time.beats.to_string(), 20.0, "bold", "middle");
    svg.text(cx, staff_top + 37.0, &measure.time.beat_type.to_string(), 20.0, "bold", "middle");
}

// ── Barlines, repeats, endings ───────────────────────────────────────

fn render_barlines(svg: &mut SvgBuilder, measure: &Measure, geom: &MeasureGeom, staff_top: f64, is_last: bool) {
    let top = staff_top;
    let bottom = staff_top + STAFF_HEIGHT;
    let right = geom.x + geom.width;

    if measure.repeat_start {
        svg.rect(geom.x + 1.0, top, 3.0, STAFF_HEIGHT, BARLINE_COLOR);
        svg.line(geom.x + 7.0, top, geom.x + 7.0, bottom, BARLINE_COLOR, BARLINE_WIDTH);
        svg.circle(geom.x + 13.0, top + 15.0, 2.0, NOTE_COLOR);
        svg.circle(geom.x + 13.0, top + 25.0, 2.0, NOTE_COLOR);
    }

    if measure.repeat_end {
        svg.circle(right - 13.0, top + 15.0, 2.0, NOTE_COLOR);
        svg.circle(right - 13.0, top + 25.0, 2.0, NOTE_COLOR);
        svg.line(right - 7.0, top, right - 7.0, bottom, BARLINE_COLOR, BARLINE_WIDTH);
        svg.rect(right - 4.0, top, 3.0, STAFF_HEIGHT, BARLINE_COLOR);
    } else if is_last {
        svg.line(right - 6.0, top, right - 6.0, bottom, BARLINE_COLOR, BARLINE_WIDTH);
        svg.rect(right - 3.0, top, 3.0, STAFF_HEIGHT, BARLINE_COLOR);
    } else {
        svg.line(right, top, right, bottom, BARLINE_COLOR, BARLINE_WIDTH);
    }
}

fn render_ending_bracket(svg: &mut SvgBuilder, measure: &Measure, geom: &MeasureGeom, staff_top: f64) {
    let Some(ending) = &measure.ending else { return };
    let y = staff_top - 18.0;
    let right = geom.x + geom.width - 2.0;
    svg.line(geom.x, y, right, y, BARLINE_COLOR, BARLINE_WIDTH);
    if ending.starts {
        svg.line(geom.x, y, geom.x, y + 8.0, BARLINE_COLOR, BARLINE_WIDTH);
        let label: Vec<String> = ending.numbers.iter().map(u32::to_string).collect();
        svg.text(geom.x + 4.0, y + 12.0, &format!("{}.", label.join(", ")), 10.0, "normal", "start");
    }
    if ending.stops && !ending.discontinue {
        svg.line(right, y, right, y + 8.0, BARLINE_COLOR, BARLINE_WIDTH);
    }
}

// ── Notes and rests ──────────────────────────────────────────────────

/// Visual shape of a duration: base value, augmentation dots, flag count.
struct NoteShape {
    hollow: bool,
    has_stem: bool,
    dots: u8,
    flags: u8,
    /// Base in whole-note units, for rest glyph selection.
    base: Duration,
}

impl NoteShape {
    fn of(duration: Duration, tuplet: Option<(u8, u8)>) -> NoteShape {
        // Undo the tuplet ratio to recover the written value.
        let written = match tuplet {
            Some((actual, normal)) => {
                duration * Rational32::new(actual as i32, normal as i32)
            }
            None => duration,
        };
        const BASES: [(i32, i32); 8] =
            [(2, 1), (1, 1), (1, 2), (1, 4), (1, 8), (1, 16), (1, 32), (1, 64)];
        let mut base = Rational32::new(1, 4);
        let mut dots = 0u8;
        'outer: for &(n, d) in &BASES {
            let b = Rational32::new(n, d);
            for (k, mult) in [(0u8, (1, 1)), (1, (3, 2)), (2, (7, 4))] {
                if written == b * Rational32::new(mult.0, mult.1) {
                    base = b;
                    dots = k;
                    break 'outer;
                }
            }
            // Irregular value: fall back to the largest base not above it.
            if b <= written {
                base = b;
                break;
            }
        }
        let hollow = base >= Rational32::new(1, 2);
        let has_stem = base < Rational32::new(1, 1);
        let flags = match (*base.numer(), *base.denom()) {
            (1, 8) => 1,
            (1, 16) => 2,
            (1, 32) => 3,
            (1, 64) => 4,
            _ => 0,
        };
        NoteShape { hollow, has_stem, dots, flags, base }
    }
}

fn render_note(
    svg: &mut SvgBuilder,
    pitches: &[Pitch],
    shape: &NoteShape,
    clef: Clef,
    x: f64,
    staff_top: f64,
    forced_stem_up: Option<bool>,
) {
    let ys: Vec<f64> = pitches
        .iter()
        .map(|p| staff_y(p.step.diatonic(), p.octave as i32, clef, staff_top))
        .collect();
    let middle = staff_top + STAFF_HEIGHT / 2.0;
    let mean = ys.iter().sum::<f64>() / ys.len() as f64;
    let stem_up = forced_stem_up.unwrap_or(mean > middle);

    for (pitch, &y) in pitches.iter().zip(&ys) {
        render_ledger_lines(svg, x, y, staff_top);
        svg.notehead(x, y, !shape.hollow);
        if pitch.alter != 0 {
            let glyph = match pitch.alter {
                1 => "\u{266F}",
                -1 => "\u{266D}",
                2 => "\u{1D12A}",
                -2 => "\u{1D12B}",
                _ => "\u{266E}",
            };
            svg.glyph(x - 14.0, y + 4.0, glyph, 16.0);
        }
        for d in 0..shape.dots {
            svg.circle(x + NOTEHEAD_RX + 4.0 + d as f64 * 5.0, y - 2.0, 1.6, NOTE_COLOR);
        }
    }

    if shape.has_stem {
        let (stem_x, tip_y, base_y) = if stem_up {
            let top = ys.iter().cloned().fold(f64::MAX, f64::min);
            let bottom = ys.iter().cloned().fold(f64::MIN, f64::max);
            (x + NOTEHEAD_RX - 0.6, top - STEM_LENGTH, bottom)
        } else {
            let top = ys.iter().cloned().fold(f64::MAX, f64::min);
            let bottom = ys.iter().cloned().fold(f64::MIN, f64::max);
            (x - NOTEHEAD_RX + 0.6, bottom + STEM_LENGTH, top)
        };
        svg.line(stem_x, base_y, stem_x, tip_y, NOTE_COLOR, STEM_WIDTH);
        for f in 0..shape.flags {
            let fy = if stem_up {
                tip_y + f as f64 * 7.0
            } else {
                tip_y - f as f64 * 7.0
            };
            render_flag(svg, stem_x, fy, stem_up);
        }
    }
}

fn render_flag(svg: &mut SvgBuilder, x: f64, y: f64, stem_up: bool) {
    let d = if stem_up {
        format!(
            "M{:.1},{:.1} c 1.0,6.0 8.0,7.5 8.0,15.5 c 0.0,-5.0 -3.5,-7.5 -8.0,-8.5 Z",
            x, y
        )
    } else {
        format!(
            "M{:.1},{:.1} c 1.0,-6.0 8.0,-7.5 8.0,-15.5 c 0.0,5.0 -3.5,7.5 -8.0,8.5 Z",
            x, y
        )
    };
    svg.path(&d, NOTE_COLOR);
}

fn render_ledger_lines(svg: &mut SvgBuilder, x: f64, y: f64, staff_top: f64) {
    let bottom = staff_top + STAFF_HEIGHT;
    let mut ly = staff_top - STAFF_LINE_SPACING;
    while ly >= y - 1.0 {
        svg.line(x - NOTEHEAD_RX - LEDGER_EXTEND, ly, x + NOTEHEAD_RX + LEDGER_EXTEND, ly, NOTE_COLOR, 0.8);
        ly -= STAFF_LINE_SPACING;
    }
    let mut ly = bottom + STAFF_LINE_SPACING;
    while ly <= y + 1.0 {
        svg.line(x - NOTEHEAD_RX - LEDGER_EXTEND, ly, x + NOTEHEAD_RX + LEDGER_EXTEND, ly, NOTE_COLOR, 0.8);
        ly += STAFF_LINE_SPACING;
    }
}

fn render_rest(svg: &mut SvgBuilder, shape: &NoteShape, x: f64, staff_top: f64) {
    let (glyph, y) = if shape.base >= Rational32::new(1, 1) {
        ("\u{1D13B}", staff_top + 12.0)
    } else if shape.base >= Rational32::new(1, 2) {
        ("\u{1D13C}", staff_top + 20.0)
    } else if shape.base >= Rational32::new(1, 4) {
        ("\u{1D13D}", staff_top + 24.0)
    } else if shape.base >= Rational32::new(1, 8) {
        ("\u{1D13E}", staff_top + 24.0)
    } else {
        ("\u{1D13F}", staff_top + 24.0)
    };
    svg.glyph(x, y, glyph, 30.0);
    for d in 0..shape.dots {
        svg.circle(x + 10.0 + d as f64 * 5.0, staff_top + 14.0, 1.6, NOTE_COLOR);
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Accumulates SVG elements and produces the final document string.
struct SvgBuilder {
    elements: Vec<String>,
    depth: usize,
    width: f64,
    height: f64,
}

impl SvgBuilder {
    fn new(width: f64, height: f64) -> Self {
        SvgBuilder { elements: Vec::new(), depth: 0, width, height }
    }

    fn push(&mut self, element: String) {
        let indent = "  ".repeat(self.depth + 1);
        self.elements.push(format!("{indent}{element}"));
    }

    fn open_group(&mut self, id: &str) {
        self.push(format!(r#"<g id="{id}">"#));
        self.depth += 1;
    }

    fn close_group(&mut self) {
        self.depth -= 1;
        self.push("</g>".to_string());
    }

    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, color: &str, width: f64) {
        self.push(format!(
            r#"<line x1="{x1:.1}" y1="{y1:.1}" x2="{x2:.1}" y2="{y2:.1}" stroke="{color}" stroke-width="{width:.1}"/>"#
        ));
    }

    fn rect(&mut self, x: f64, y: f64, w: f64, h: f64, fill: &str) {
        self.push(format!(
            r#"<rect x="{x:.1}" y="{y:.1}" width="{w:.1}" height="{h:.1}" fill="{fill}"/>"#
        ));
    }

    fn circle(&mut self, cx: f64, cy: f64, r: f64, fill: &str) {
        self.push(format!(r#"<circle cx="{cx:.1}" cy="{cy:.1}" r="{r:.1}" fill="{fill}"/>"#));
    }

    fn path(&mut self, d: &str, fill: &str) {
        self.push(format!(r#"<path d="{d}" fill="{fill}"/>"#));
    }

    fn notehead(&mut self, cx: f64, cy: f64, filled: bool) {
        if filled {
            self.push(format!(
                r#"<ellipse cx="{cx:.1}" cy="{cy:.1}" rx="{NOTEHEAD_RX:.1}" ry="{NOTEHEAD_RY:.1}" fill="{NOTE_COLOR}" transform="rotate(-15,{cx:.1},{cy:.1})"/>"#
            ));
        } else {
            self.push(format!(
                r#"<ellipse cx="{cx:.1}" cy="{cy:.1}" rx="{:.1}" ry="{:.1}" fill="none" stroke="{NOTE_COLOR}" stroke-width="2.0" transform="rotate(-15,{cx:.1},{cy:.1})"/>"#,
                NOTEHEAD_RX - 1.0,
                NOTEHEAD_RY - 1.0
            ));
        }
    }

    /// Musical glyph rendered as text in the music font fallback chain.
    fn glyph(&mut self, x: f64, y: f64, glyph: &str, size: f64) {
        self.push(format!(
            r#"<text x="{x:.1}" y="{y:.1}" font-size="{size:.0}" fill="{NOTE_COLOR}">{glyph}</text>"#
        ));
    }

    fn text(&mut self, x: f64, y: f64, content: &str, size: f64, weight: &str, anchor: &str) {
        let escaped = content
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        self.push(format!(
            r#"<text x="{x:.1}" y="{y:.1}" font-size="{size:.0}" font-weight="{weight}" fill="{NOTE_COLOR}" text-anchor="{anchor}">{escaped}</text>"#
        ));
    }

    fn build(self) -> String {
        let mut out = format!(
            concat!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w:.1} {h:.1}" "#,
                r#"width="{w:.1}" height="{h:.1}" style="font-family: 'Georgia', 'Times New Roman', serif;">"#
            ),
            w = self.width,
            h = self.height
        );
        out.push('\n');
        for element in &self.elements {
            out.push_str(element);
            out.push('\n');
        }
        out.push_str("</svg>\n");
        out
    }
}

/// Render with measure numbers: the public entry used by the pipeline.
pub fn render_score(score: &Score, layout: &ScoreLayout) -> String {
    let mut svg = SvgBuilder::new(layout.page_width, layout.total_height);

    for page in 0..layout.page_count {
        svg.open_group(&format!("page-{page}"));
        if page == 0 {
            if let Some(title) = &score.title {
                svg.text(layout.page_width / 2.0, 58.0, title, 22.0, "bold", "middle");
            }
        }
        for system in layout.systems.iter().filter(|s| s.page == page) {
            svg.open_group(&format!("system-{}", system.index));
            render_system(&mut svg, score, layout, system.index);
            if let Some(first) = layout.measures.iter().find(|m| m.system == system.index) {
                if first.index > 0 {
                    svg.text(first.x, system.y - 10.0, &(first.index + 1).to_string(), 10.0, "normal", "start");
                }
            }
            svg.close_group();
        }
        svg.close_group();
    }

    svg.build()
}
