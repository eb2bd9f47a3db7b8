//! Lightly-structured XML (TEI-like) parsing.
//!
//! The unit element is `<p>` by default, `<s>` as an option. Language is
//! resolved from `xml:lang` on the root or the `<text>` element, the title
//! from the first `<title>` inside `<teiHeader>`. The reader matches local
//! names only, so any namespace prefix (or none) works. `<head>` elements
//! become structure units; a unit whose `xml:id` ends in digits gets those
//! digits as its `external_id`.

use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{EngineError, Result};
use crate::models::UnitKind;
use crate::parse_numbered::ParsedUnit;

/// Which element delimits a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeiUnitElement {
    Paragraph,
    Sentence,
}

impl TeiUnitElement {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "p" => Ok(TeiUnitElement::Paragraph),
            "s" => Ok(TeiUnitElement::Sentence),
            other => Err(EngineError::validation(format!(
                "unknown unit element: '{}'. Use p or s.",
                other
            ))),
        }
    }

    fn local_name(&self) -> &'static [u8] {
        match self {
            TeiUnitElement::Paragraph => b"p",
            TeiUnitElement::Sentence => b"s",
        }
    }
}

/// Parsed TEI document: header metadata plus the unit sequence.
#[derive(Debug, Default)]
pub struct TeiDocument {
    pub title: Option<String>,
    pub language: Option<String>,
    pub units: Vec<ParsedUnit>,
    pub warnings: Vec<String>,
}

fn trailing_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)$").unwrap())
}

/// Parses a decoded TEI-like document into units.
pub fn parse(text: &str, unit_element: TeiUnitElement) -> Result<TeiDocument> {
    let mut reader = quick_xml::Reader::from_str(text);
    let mut buf = Vec::new();

    let mut doc = TeiDocument::default();
    let mut root_lang: Option<String> = None;
    let mut text_lang: Option<String> = None;
    let mut saw_root = false;

    let mut header_depth = 0usize;
    let mut in_header_title = false;
    let mut title_text = String::new();

    // Current capture: Some((kind, external_id, text)) while inside a unit
    // or head element. Nested unit starts only deepen the counter.
    let mut capture: Option<(UnitKind, Option<i64>, String)> = None;
    let mut capture_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name().as_ref().to_vec();
                if !saw_root {
                    saw_root = true;
                    root_lang = attr_value(&e, b"lang");
                }
                if local == b"text" && text_lang.is_none() {
                    text_lang = attr_value(&e, b"lang");
                }
                if local == b"teiHeader" {
                    header_depth += 1;
                } else if header_depth > 0 && local == b"title" && doc.title.is_none() {
                    in_header_title = true;
                    title_text.clear();
                }

                if capture.is_some() {
                    capture_depth += 1;
                } else if header_depth == 0 {
                    if local == unit_element.local_name() {
                        let external_id = attr_value(&e, b"id")
                            .and_then(|id| extract_trailing_digits(&id, &mut doc.warnings));
                        capture = Some((UnitKind::Line, external_id, String::new()));
                        capture_depth = 0;
                    } else if local == b"head" {
                        capture = Some((UnitKind::Structure, None, String::new()));
                        capture_depth = 0;
                    }
                }
            }
            Ok(Event::End(e)) => {
                let local = e.local_name().as_ref().to_vec();
                if local == b"teiHeader" && header_depth > 0 {
                    header_depth -= 1;
                } else if in_header_title && local == b"title" {
                    in_header_title = false;
                    let t = title_text.trim();
                    if !t.is_empty() {
                        doc.title = Some(t.to_string());
                    }
                }

                if capture.is_some() {
                    if capture_depth > 0 {
                        capture_depth -= 1;
                    } else if local == unit_element.local_name() || local == b"head" {
                        let (kind, external_id, text) = capture.take().unwrap();
                        doc.units.push(ParsedUnit {
                            kind,
                            external_id,
                            text: collapse_whitespace(&text),
                        });
                    }
                }
            }
            Ok(Event::Text(te)) => {
                let t = te
                    .unescape()
                    .map_err(|e| EngineError::validation(format!("bad XML text: {}", e)))?;
                if in_header_title {
                    title_text.push_str(&t);
                } else if let Some((_, _, text)) = capture.as_mut() {
                    text.push_str(&t);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::validation(format!("malformed XML: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    doc.language = text_lang.or(root_lang);
    Ok(doc)
}

/// Reads an attribute by local name, so `xml:lang`, `lang`, and prefixed
/// variants all resolve.
fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        let key = attr.key.as_ref();
        let key_local = key.rsplit(|&b| b == b':').next().unwrap_or(key);
        if key_local == local {
            return attr
                .unescape_value()
                .ok()
                .map(|v| v.into_owned())
                .filter(|v| !v.is_empty());
        }
    }
    None
}

fn extract_trailing_digits(id: &str, warnings: &mut Vec<String>) -> Option<i64> {
    let caps = trailing_digits().captures(id)?;
    match caps[1].parse::<i64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warnings.push(format!("xml:id '{}' has out-of-range trailing digits", id));
            None
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<TEI xmlns="http://www.tei-c.org/ns/1.0" xml:lang="grc">
  <teiHeader>
    <fileDesc>
      <titleStmt><title>Odyssée, chant I</title></titleStmt>
    </fileDesc>
  </teiHeader>
  <text xml:lang="fr">
    <body>
      <head>Chant premier</head>
      <p xml:id="p1">Dis-moi, Muse, cet homme subtil.</p>
      <p xml:id="p2">Qui erra si longtemps.</p>
      <p>Sans ancre aucune.</p>
    </body>
  </text>
</TEI>"#;

    #[test]
    fn header_title_and_text_lang_resolved() {
        let doc = parse(SAMPLE, TeiUnitElement::Paragraph).unwrap();
        assert_eq!(doc.title.as_deref(), Some("Odyssée, chant I"));
        assert_eq!(doc.language.as_deref(), Some("fr"));
    }

    #[test]
    fn root_lang_used_when_text_has_none() {
        let xml = r#"<TEI xml:lang="grc"><text><body><p>a</p></body></text></TEI>"#;
        let doc = parse(xml, TeiUnitElement::Paragraph).unwrap();
        assert_eq!(doc.language.as_deref(), Some("grc"));
    }

    #[test]
    fn units_and_anchors() {
        let doc = parse(SAMPLE, TeiUnitElement::Paragraph).unwrap();
        assert_eq!(doc.units.len(), 4);
        assert_eq!(doc.units[0].kind, UnitKind::Structure);
        assert_eq!(doc.units[0].text, "Chant premier");
        assert_eq!(doc.units[1].external_id, Some(1));
        assert_eq!(doc.units[2].external_id, Some(2));
        assert_eq!(doc.units[3].external_id, None);
    }

    #[test]
    fn sentence_mode_selects_s_elements() {
        let xml = r#"<TEI><text><body><p><s xml:id="s1">Un.</s> <s xml:id="s2">Deux.</s></p></body></text></TEI>"#;
        let doc = parse(xml, TeiUnitElement::Sentence).unwrap();
        assert_eq!(doc.units.len(), 2);
        assert_eq!(doc.units[0].text, "Un.");
        assert_eq!(doc.units[1].external_id, Some(2));
    }

    #[test]
    fn prefixed_namespace_is_handled() {
        let xml = r#"<tei:TEI xmlns:tei="http://www.tei-c.org/ns/1.0" xml:lang="la">
            <tei:text><tei:body><tei:p tei:id="u9">Arma virumque cano.</tei:p></tei:body></tei:text>
        </tei:TEI>"#;
        let doc = parse(xml, TeiUnitElement::Paragraph).unwrap();
        assert_eq!(doc.units.len(), 1);
        assert_eq!(doc.units[0].external_id, Some(9));
        assert_eq!(doc.language.as_deref(), Some("la"));
    }

    #[test]
    fn mismatched_end_tag_is_validation_error() {
        let err = parse("<TEI><p>a</q></TEI>", TeiUnitElement::Paragraph).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
