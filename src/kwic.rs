//! Segment and KWIC projections of a matched unit.
//!
//! The query engine asks FTS5 to wrap matches in private-use sentinel
//! characters that cannot appear in normalized text, then projects the
//! marked string into one of two shapes: segment (full text, matches
//! wrapped in the literal markers `<<` and `>>`) or KWIC (left context /
//! match / right context, bounded by a token window on each side).

/// Sentinels handed to FTS5 `highlight()`. Private-use codepoints, so they
/// survive intact next to literal `<` and `>` in corpus text.
pub const MARK_OPEN: char = '\u{E000}';
pub const MARK_CLOSE: char = '\u{E001}';

/// Inline markers of the segment shape (frozen wire format).
pub const SEGMENT_OPEN: &str = "<<";
pub const SEGMENT_CLOSE: &str = ">>";

/// Marked text decomposed into plain text plus match byte ranges.
#[derive(Debug, Clone)]
pub struct MarkedText {
    pub plain: String,
    /// Byte ranges into `plain`, in order of occurrence.
    pub matches: Vec<(usize, usize)>,
}

/// Strips the sentinels out of a highlighted string, recording where each
/// match lives in the remaining text.
pub fn parse_marked(marked: &str) -> MarkedText {
    let mut plain = String::with_capacity(marked.len());
    let mut matches = Vec::new();
    let mut open_at: Option<usize> = None;

    for c in marked.chars() {
        match c {
            MARK_OPEN => open_at = Some(plain.len()),
            MARK_CLOSE => {
                if let Some(start) = open_at.take() {
                    matches.push((start, plain.len()));
                }
            }
            c => plain.push(c),
        }
    }

    MarkedText { plain, matches }
}

/// Segment shape: the full unit text with every match wrapped in `<<`/`>>`.
pub fn segment_text(marked: &str) -> String {
    let mut out = String::with_capacity(marked.len() + 8);
    for c in marked.chars() {
        match c {
            MARK_OPEN => out.push_str(SEGMENT_OPEN),
            MARK_CLOSE => out.push_str(SEGMENT_CLOSE),
            c => out.push(c),
        }
    }
    out
}

/// One KWIC row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct KwicParts {
    pub left: String,
    #[serde(rename = "match")]
    pub match_text: String,
    pub right: String,
}

/// KWIC shape: one row per occurrence (or only the first when `all` is
/// false), context bounded by `window` whitespace tokens on each side.
pub fn kwic_rows(marked: &str, window: usize, all: bool) -> Vec<KwicParts> {
    let parsed = parse_marked(marked);
    let mut rows = Vec::new();

    for &(start, end) in &parsed.matches {
        let left_tokens: Vec<&str> = parsed.plain[..start].split_whitespace().collect();
        let left_keep = left_tokens.len().saturating_sub(window);
        let left = left_tokens[left_keep..].join(" ");

        let right = parsed.plain[end..]
            .split_whitespace()
            .take(window)
            .collect::<Vec<&str>>()
            .join(" ");

        rows.push(KwicParts {
            left,
            match_text: parsed.plain[start..end].to_string(),
            right,
        });

        if !all {
            break;
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(s: &str) -> String {
        // Test helper: «term» marks a match.
        s.replace('«', &MARK_OPEN.to_string())
            .replace('»', &MARK_CLOSE.to_string())
    }

    #[test]
    fn segment_wraps_matches() {
        let marked = mark("«Bonjour» le monde.");
        assert_eq!(segment_text(&marked), "<<Bonjour>> le monde.");
    }

    #[test]
    fn parse_marked_finds_ranges() {
        let marked = mark("a «b» c «d»");
        let parsed = parse_marked(&marked);
        assert_eq!(parsed.plain, "a b c d");
        assert_eq!(parsed.matches.len(), 2);
        assert_eq!(&parsed.plain[parsed.matches[0].0..parsed.matches[0].1], "b");
        assert_eq!(&parsed.plain[parsed.matches[1].0..parsed.matches[1].1], "d");
    }

    #[test]
    fn kwic_window_one_all_occurrences() {
        let marked = mark("«needle» haystack «needle» «needle» haystack");
        let rows = kwic_rows(&marked, 1, true);
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            KwicParts {
                left: "".into(),
                match_text: "needle".into(),
                right: "haystack".into()
            }
        );
        assert_eq!(
            rows[1],
            KwicParts {
                left: "haystack".into(),
                match_text: "needle".into(),
                right: "needle".into()
            }
        );
        assert_eq!(
            rows[2],
            KwicParts {
                left: "needle".into(),
                match_text: "needle".into(),
                right: "haystack".into()
            }
        );
    }

    #[test]
    fn kwic_first_occurrence_only() {
        let marked = mark("«x» a «x» b");
        let rows = kwic_rows(&marked, 5, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].right, "a x b");
    }

    #[test]
    fn kwic_window_bounds_context() {
        let marked = mark("one two three «four» five six seven");
        let rows = kwic_rows(&marked, 2, true);
        assert_eq!(rows[0].left, "two three");
        assert_eq!(rows[0].right, "five six");
    }

    #[test]
    fn phrase_match_stays_whole() {
        let marked = mark("avant «le monde» après");
        let rows = kwic_rows(&marked, 3, true);
        assert_eq!(rows[0].match_text, "le monde");
        assert_eq!(rows[0].left, "avant");
        assert_eq!(rows[0].right, "après");
    }
}
