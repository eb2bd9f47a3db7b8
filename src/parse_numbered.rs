//! Numbered-line parsing shared by the TXT and DOCX importers.
//!
//! Each source paragraph is matched against `[N] content`. Matches become
//! `line` units carrying `external_id = N`; everything else becomes a
//! `structure` unit. Ordering `n` is the 1-based paragraph index regardless
//! of kind. Duplicate anchors, non-monotonic sequences, and holes are
//! reported as warnings, never as errors.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::models::UnitKind;

/// A parsed unit before normalization and storage.
#[derive(Debug, Clone)]
pub struct ParsedUnit {
    pub kind: UnitKind,
    pub external_id: Option<i64>,
    pub text: String,
}

/// Outcome of parsing one source into units.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub units: Vec<ParsedUnit>,
    pub warnings: Vec<String>,
}

fn numbered_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\[(\d+)\]\s+(.*)$").unwrap())
}

/// Parses a sequence of paragraphs in numbered-line form.
pub fn parse_paragraphs<I, S>(paragraphs: I) -> ParseOutcome
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let re = numbered_pattern();
    let mut outcome = ParseOutcome::default();
    let mut seen_ids: HashSet<i64> = HashSet::new();
    let mut last_id: Option<i64> = None;
    let mut non_monotonic = false;

    for para in paragraphs {
        let para = para.as_ref();
        match re.captures(para) {
            Some(caps) => {
                // Anchors beyond i64 range are treated as unnumbered text.
                let id: i64 = match caps[1].parse() {
                    Ok(v) => v,
                    Err(_) => {
                        outcome.warnings.push(format!(
                            "anchor out of range, kept as structure: {}",
                            truncate(para, 60)
                        ));
                        outcome.units.push(ParsedUnit {
                            kind: UnitKind::Structure,
                            external_id: None,
                            text: para.to_string(),
                        });
                        continue;
                    }
                };
                let duplicate = !seen_ids.insert(id);
                if duplicate {
                    outcome
                        .warnings
                        .push(format!("duplicate external_id {}", id));
                }
                if let Some(prev) = last_id {
                    if id <= prev && !duplicate {
                        non_monotonic = true;
                    }
                }
                last_id = Some(id);
                outcome.units.push(ParsedUnit {
                    kind: UnitKind::Line,
                    external_id: Some(id),
                    text: caps[2].to_string(),
                });
            }
            None => {
                outcome.units.push(ParsedUnit {
                    kind: UnitKind::Structure,
                    external_id: None,
                    text: para.to_string(),
                });
            }
        }
    }

    if non_monotonic {
        outcome
            .warnings
            .push("external_id sequence is not monotonically increasing".to_string());
    }

    if let Some(holes) = find_holes(&seen_ids) {
        outcome.warnings.push(holes);
    }

    outcome
}

/// Parses decoded plain text: one line per paragraph, empty lines become
/// structure units so `n` stays the physical line index.
pub fn parse_text(text: &str) -> ParseOutcome {
    parse_paragraphs(text.lines())
}

fn find_holes(ids: &HashSet<i64>) -> Option<String> {
    if ids.len() < 2 {
        return None;
    }
    let mut sorted: Vec<i64> = ids.iter().copied().collect();
    sorted.sort_unstable();
    let mut missing: Vec<i64> = Vec::new();
    for pair in sorted.windows(2) {
        for id in pair[0] + 1..pair[1] {
            missing.push(id);
            if missing.len() >= 20 {
                break;
            }
        }
        if missing.len() >= 20 {
            break;
        }
    }
    if missing.is_empty() {
        None
    } else {
        let shown: Vec<String> = missing.iter().map(|i| i.to_string()).collect();
        Some(format!(
            "holes in external_id sequence: missing {}",
            shown.join(", ")
        ))
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_lines_become_line_units() {
        let out = parse_text("[1] Bonjour le monde.\n[2] Deuxième ligne.");
        assert_eq!(out.units.len(), 2);
        assert_eq!(out.units[0].kind, UnitKind::Line);
        assert_eq!(out.units[0].external_id, Some(1));
        assert_eq!(out.units[0].text, "Bonjour le monde.");
        assert_eq!(out.units[1].external_id, Some(2));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn unnumbered_paragraphs_become_structure() {
        let out = parse_text("ACT I\n[1] First line.\nScene heading");
        assert_eq!(out.units[0].kind, UnitKind::Structure);
        assert_eq!(out.units[0].external_id, None);
        assert_eq!(out.units[1].kind, UnitKind::Line);
        assert_eq!(out.units[2].kind, UnitKind::Structure);
    }

    #[test]
    fn leading_whitespace_before_anchor_is_accepted() {
        let out = parse_text("  [7] indented");
        assert_eq!(out.units[0].external_id, Some(7));
        assert_eq!(out.units[0].text, "indented");
    }

    #[test]
    fn duplicates_warn_but_are_kept() {
        let out = parse_text("[1] a\n[1] b");
        assert_eq!(out.units.len(), 2);
        assert_eq!(out.units[1].external_id, Some(1));
        assert!(out.warnings.iter().any(|w| w.contains("duplicate")));
    }

    #[test]
    fn non_monotonic_sequence_warns() {
        let out = parse_text("[2] b\n[1] a");
        assert!(out.warnings.iter().any(|w| w.contains("monotonically")));
    }

    #[test]
    fn holes_are_reported() {
        let out = parse_text("[1] a\n[4] d");
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("missing 2, 3")));
    }

    #[test]
    fn bracket_without_space_is_structure() {
        let out = parse_text("[12]no space after bracket");
        assert_eq!(out.units[0].kind, UnitKind::Structure);
    }
}
