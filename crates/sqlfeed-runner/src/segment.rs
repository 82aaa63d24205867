//! Splits a raw test definition into the units fed to the child.

use regex::{CaptureMatches, Regex};

use crate::error::ConfigError;

/// A run of `(<digits>)` markers at the start of the text or after
/// whitespace or `;`. Only capture group 1 is cut out, so the `;` stays with
/// the preceding unit.
pub const DEFAULT_MARKER: &str = r"(?:^|[\s;])((?:\(\d+\)\s*)+)";

/// Matches the marker anywhere, including inside literals like `VALUES(1)`.
pub const ANYWHERE_MARKER: &str = r"\(\d+\)";

pub fn compile_marker(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Marker {
        pattern: pattern.to_string(),
        source,
    })
}

/// Lazy view over the units of `raw`. Iterating twice yields the same units.
///
/// When the marker has a capture group, group 1 is the delimiter; otherwise
/// the whole match is.
#[derive(Debug, Clone)]
pub struct Segments<'h> {
    marker: Regex,
    raw: &'h str,
}

impl<'h> Segments<'h> {
    pub fn new(raw: &'h str, marker: &Regex) -> Self {
        Self {
            marker: marker.clone(),
            raw,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'h str> + '_ {
        Spans {
            raw: self.raw,
            delimiters: self.marker.captures_iter(self.raw),
            cursor: 0,
            finished: false,
        }
        .map(str::trim)
        .filter(|s| !s.is_empty())
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

struct Spans<'r, 'h> {
    raw: &'h str,
    delimiters: CaptureMatches<'r, 'h>,
    cursor: usize,
    finished: bool,
}

impl<'r, 'h> Iterator for Spans<'r, 'h> {
    type Item = &'h str;

    fn next(&mut self) -> Option<&'h str> {
        if self.finished {
            return None;
        }
        for caps in self.delimiters.by_ref() {
            let Some(delimiter) = caps.get(1).or_else(|| caps.get(0)) else {
                continue;
            };
            let span = &self.raw[self.cursor..delimiter.start()];
            self.cursor = delimiter.end();
            return Some(span);
        }
        self.finished = true;
        Some(&self.raw[self.cursor..])
    }
}

pub fn segment_units(raw: &str, marker: &Regex) -> Vec<String> {
    Segments::new(raw, marker)
        .iter()
        .map(str::to_string)
        .collect()
}
