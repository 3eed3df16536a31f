//! staffline — MusicXML to engraved SVG, playback maps, and MIDI.
//!
//! The crate is a pure transformation pipeline with no I/O of its own:
//! callers hand in MusicXML bytes and get back artifacts.
//!
//! ```text
//! bytes ─ parse ─ model ─ (transpose) ─┬─ layout ── SVG
//!                                      ├─ layout + timeline ── playback map
//!                                      └─ timeline ── MIDI (SMF type 1)
//! ```
//!
//! All three artifacts are deterministic: the same document and options
//! always produce byte-identical output.

pub mod error;
pub mod layout;
pub mod midi;
pub mod model;
pub mod parse;
pub mod playback;
pub mod timeline;
pub mod transpose;

pub use error::Error;
pub use midi::MidiOptions;
pub use model::Score;
pub use playback::PlaybackMap;

/// Parse MusicXML bytes into the semantic score model.
///
/// `hint` is an optional format hint, typically the source file
/// extension. Compressed `.mxl` containers are rejected; extract the
/// document first.
pub fn parse_score(bytes: &[u8], hint: Option<&str>) -> Result<Score, Error> {
    let xml = parse::sniff(bytes, hint)?;
    let doc = parse::parse_xml(xml)?;
    Ok(model::build_score(&doc)?)
}

/// Render the document as paginated SVG. A `page_width` of 0 selects the
/// default width (820 units).
pub fn render_svg(bytes: &[u8], hint: Option<&str>, page_width: f64) -> Result<String, Error> {
    render_svg_transposed(bytes, hint, page_width, 0)
}

/// Render with a chromatic transposition applied first.
pub fn render_svg_transposed(
    bytes: &[u8],
    hint: Option<&str>,
    page_width: f64,
    semitones: i32,
) -> Result<String, Error> {
    let score = transpose::transpose_score(&parse_score(bytes, hint)?, semitones);
    let layout = layout::compute_layout(&score, page_width)?;
    Ok(layout::svg::render_score(&score, &layout))
}

/// Build the playback map: measure/system geometry plus the unrolled
/// cursor timeline, matching the SVG produced with the same arguments.
pub fn playback_map(
    bytes: &[u8],
    hint: Option<&str>,
    page_width: f64,
    semitones: i32,
) -> Result<PlaybackMap, Error> {
    let score = transpose::transpose_score(&parse_score(bytes, hint)?, semitones);
    let layout = layout::compute_layout(&score, page_width)?;
    let unrolled = timeline::unroll(&score)?;
    let entries = timeline::build_timeline(&score, &layout, &unrolled);
    Ok(PlaybackMap::build(&layout, &entries, timeline::total_duration_ms(&unrolled)))
}

/// Generate a Standard MIDI File (format 1). `options_json` follows
/// [`MidiOptions`]; `None` uses the defaults.
pub fn generate_midi(
    bytes: &[u8],
    hint: Option<&str>,
    options_json: Option<&str>,
) -> Result<Vec<u8>, Error> {
    let options = match options_json {
        Some(json) => MidiOptions::from_json(json)?,
        None => MidiOptions::default(),
    };
    let score = transpose::transpose_score(&parse_score(bytes, hint)?, options.transpose);
    let unrolled = timeline::unroll(&score)?;
    Ok(midi::generate(&score, &unrolled, &options)?)
}
