//! Document parser: raw bytes to a validated XML element tree.
//!
//! Pure functions, no I/O. The parser accepts uncompressed MusicXML only;
//! when the document arrives inside an MXL (ZIP) container the surrounding
//! collaborator extracts it first, and compressed bytes reaching this
//! layer are an error, not something to silently decode.

use roxmltree::{Document, ParsingOptions};

use crate::error::ParseError;

/// ZIP local-file-header magic — the MXL container signature.
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Validate the raw bytes and return them as an XML string.
///
/// `hint` is the caller's format hint, typically a file extension
/// (`"musicxml"`, `"xml"`, `"mxl"`). Without a hint the content is
/// sniffed.
pub fn sniff<'a>(bytes: &'a [u8], hint: Option<&str>) -> Result<&'a str, ParseError> {
    if hint == Some("mxl") || bytes.starts_with(ZIP_MAGIC) {
        return Err(ParseError::CompressedInput);
    }

    let text = std::str::from_utf8(bytes).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

    if !text.trim_start().starts_with('<') {
        return Err(ParseError::NotMarkup);
    }

    Ok(text)
}

/// Parse an XML string into an element tree and check the root element.
pub fn parse_xml(xml: &str) -> Result<Document<'_>, ParseError> {
    // MusicXML documents carry a DOCTYPE declaration.
    let options = ParsingOptions { allow_dtd: true, ..Default::default() };
    let doc = Document::parse_with_options(xml, options)
        .map_err(|e| ParseError::MalformedXml(e.to_string()))?;

    let root = doc.root_element();
    if root.tag_name().name() != "score-partwise" {
        return Err(ParseError::UnsupportedRoot(root.tag_name().name().to_string()));
    }

    Ok(doc)
}
