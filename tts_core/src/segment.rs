//! Splits input text into ordered synthesis units.
//!
//! A unit ends at a run of sentence-terminal punctuation (`.`, `!`, `?`, `…`,
//! with any closing quotes or brackets) followed by whitespace or end of
//! text, or at a line break. Common abbreviations such as "Dr." do not end a
//! unit. Units are trimmed and empty ones dropped; indices are dense and
//! 0-based.

use crate::unit::SynthesisUnit;

const ABBREVIATIONS: &[&str] = &[
    "Dr", "Mr", "Mrs", "Ms", "Prof", "etc", "vs", "e.g", "i.e", "a.m", "p.m", "Inc", "Ltd",
    "Corp",
];

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '»')
}

fn ends_with_abbreviation(before_dot: &str) -> bool {
    let word = before_dot
        .rsplit(|c: char| c.is_whitespace() || c == '(' || c == '"')
        .next()
        .unwrap_or("");
    ABBREVIATIONS.iter().any(|a| a.eq_ignore_ascii_case(word))
}

/// Pure function of `text`: calling it twice yields identical units.
pub fn segment(text: &str) -> Vec<SynthesisUnit> {
    let mut units = Vec::new();
    let mut push = |span: &str| {
        let span = span.trim();
        if !span.is_empty() {
            units.push(SynthesisUnit {
                index: units.len(),
                text: span.to_string(),
            });
        }
    };

    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' || c == '\r' {
            push(&text[start..i]);
            start = i + c.len_utf8();
            continue;
        }
        if !is_terminal(c) {
            continue;
        }

        // absorb "?!", "...", closing quotes
        let mut end = i + c.len_utf8();
        while let Some(&(j, n)) = chars.peek() {
            if is_terminal(n) || is_closing(n) {
                end = j + n.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        let at_boundary = chars.peek().map_or(true, |&(_, n)| n.is_whitespace());
        if !at_boundary {
            continue;
        }
        if &text[i..end] == "." && ends_with_abbreviation(&text[start..i]) {
            continue;
        }

        push(&text[start..end]);
        start = end;
    }
    push(&text[start..]);

    units
}
