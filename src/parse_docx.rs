//! DOCX paragraph extraction.
//!
//! A DOCX file is a ZIP archive whose main part is `word/document.xml`;
//! paragraphs are `w:p` elements and their text lives in `w:t` runs. The
//! reader is namespace-agnostic (matches on local names) and bounds the
//! decompressed size of the entry it reads.

use std::io::Read;

use quick_xml::events::Event;

use crate::error::{EngineError, Result};

/// Maximum decompressed bytes read from `word/document.xml` (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extracts the paragraph texts of a DOCX byte stream, in document order.
/// Empty paragraphs are preserved as empty strings; callers decide whether
/// they matter.
pub fn extract_paragraphs(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| EngineError::validation(format!("not a DOCX (zip) file: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| EngineError::validation("word/document.xml not found in archive"))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| EngineError::internal(format!("reading word/document.xml: {}", e)))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(EngineError::validation(
                "word/document.xml exceeds size limit",
            ));
        }
    }

    paragraphs_from_xml(&doc_xml)
}

fn paragraphs_from_xml(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => current = Some(String::new()),
                b"t" => in_text_run = current.is_some(),
                // w:tab and w:br inside a run materialize as whitespace.
                b"br" => {
                    if let Some(p) = current.as_mut() {
                        p.push(' ');
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" | b"br" => {
                    if let Some(p) = current.as_mut() {
                        p.push(' ');
                    }
                }
                _ => {}
            },
            Ok(Event::Text(te)) => {
                if in_text_run {
                    if let Some(p) = current.as_mut() {
                        let text = te
                            .unescape()
                            .map_err(|e| EngineError::validation(format!("bad XML text: {}", e)))?;
                        p.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"p" => {
                    if let Some(p) = current.take() {
                        paragraphs.push(p);
                    }
                }
                b"t" => in_text_run = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::validation(format!(
                    "malformed document.xml: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_body(body_xml: &str) -> Vec<u8> {
        let document = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>{}</w:body></w:document>"#,
            body_xml
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(document.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn paragraphs_in_order() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t>[1] Premier.</w:t></w:r></w:p>\
             <w:p><w:r><w:t>[2] Second.</w:t></w:r></w:p>",
        );
        let paras = extract_paragraphs(&bytes).unwrap();
        assert_eq!(paras, vec!["[1] Premier.", "[2] Second."]);
    }

    #[test]
    fn split_runs_are_joined() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t>[3] Bon</w:t></w:r><w:r><w:t>jour</w:t></w:r></w:p>",
        );
        let paras = extract_paragraphs(&bytes).unwrap();
        assert_eq!(paras, vec!["[3] Bonjour"]);
    }

    #[test]
    fn empty_paragraph_preserved() {
        let bytes = docx_with_body("<w:p/><w:p><w:r><w:t>x</w:t></w:r></w:p>");
        let paras = extract_paragraphs(&bytes).unwrap();
        // Self-closing w:p yields no Start event; only the real one lands.
        assert_eq!(paras, vec!["x"]);
    }

    #[test]
    fn not_a_zip_is_validation_error() {
        let err = extract_paragraphs(b"plainly not a zip").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn zip_without_document_xml_is_validation_error() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("other.txt", options).unwrap();
            zip.write_all(b"hi").unwrap();
            zip.finish().unwrap();
        }
        let err = extract_paragraphs(&cursor.into_inner()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
