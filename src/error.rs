//! Error types for the rendering pipeline.
//!
//! Each pipeline stage has its own error enum; `Error` is the top-level
//! type returned by the crate-root entry points. A render either succeeds
//! completely or fails with exactly one of these — no partial output.

use thiserror::Error;

/// Top-level pipeline error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Unroll(#[from] UnrollError),

    #[error(transparent)]
    MidiGen(#[from] MidiGenError),
}

/// Document-level failures: the input bytes are not a usable MusicXML
/// document.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// Input is a ZIP container (`.mxl`). Decompression is the caller's
    /// job; the parser only accepts the extracted document.
    #[error("input is a compressed container; extract the MusicXML document first")]
    CompressedInput,

    #[error("input is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("input does not look like an XML document")]
    NotMarkup,

    #[error("XML parse error: {0}")]
    MalformedXml(String),

    #[error("unsupported root element '{0}': only score-partwise is supported")]
    UnsupportedRoot(String),
}

/// Musical structure that cannot be reconciled into a valid score model.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("score contains no parts")]
    NoParts,

    #[error(
        "part {part} measure {measure} voice {voice}: \
         events sum to {actual} of a whole note but the time signature \
         requires {expected}"
    )]
    DurationMismatch {
        part: usize,
        measure: usize,
        voice: u8,
        actual: String,
        expected: String,
    },

    #[error("part {part} measure {measure}: ending bracket has no usable pass numbers")]
    InvalidEnding { part: usize, measure: usize },
}

/// Geometry failures. Should not occur for normal input; a zero or
/// negative page width is normalized, not an error.
#[derive(Debug, Clone, Error)]
pub enum LayoutError {
    #[error("page width {0} is not a finite number")]
    InvalidPageWidth(f64),
}

/// Repeat-graph traversal failures.
#[derive(Debug, Clone, Error)]
pub enum UnrollError {
    /// The iteration budget was exhausted before a single timeline entry
    /// was produced. Budget exhaustion *after* content is produced is a
    /// warning plus a truncated timeline, not an error.
    #[error("repeat structure produced no playable measures within the iteration budget")]
    Unbounded,
}

/// Invalid MIDI generation configuration.
#[derive(Debug, Clone, Error)]
pub enum MidiGenError {
    #[error("MIDI channel {0} is out of range (0-15)")]
    InvalidChannel(u8),

    #[error("track options reference part {part}, but the score has {available} parts")]
    UnknownPart { part: usize, available: usize },

    #[error("invalid generation options: {0}")]
    InvalidOptions(String),

    #[error("SMF serialization failed: {0}")]
    Write(String),
}
