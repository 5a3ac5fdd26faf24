//! Parser for the header phase's `key: value1 value2 …` lines.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("malformed header line")]
pub struct HeaderParseError;

/// One parsed header line: a key and its (non-empty) value list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub key: String,
    pub values: Vec<String>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_ident_char)
}

/// Parses a header line. The key is an identifier (`[A-Za-z0-9_]+`) directly
/// followed by a colon; values are whitespace-separated identifiers, at least
/// one of which must be present.
pub fn parse(line: &str) -> Result<HeaderEntry, HeaderParseError> {
    let line = line.trim_start();
    let colon = line.find(':').ok_or(HeaderParseError)?;
    let key = &line[..colon];
    if !is_ident(key) {
        return Err(HeaderParseError);
    }

    let values: Vec<String> = line[colon + 1..]
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if values.is_empty() || !values.iter().all(|v| is_ident(v)) {
        return Err(HeaderParseError);
    }

    Ok(HeaderEntry {
        key: key.to_string(),
        values,
    })
}
