//! Marker grammar for signals embedded in agent free text.
//!
//! ```text
//! [EVENT:<level>(:<service>)?] <message>        level ∈ info | warning | critical
//! [MEMORY:<category>(:<service>)?] <observation>
//! ```
//!
//! Parsing works on one line at a time and knows nothing about the stream
//! around it; the classifier decides which text is eligible.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::MarkerError;
use crate::event::EventLevel;
use crate::memory::{MemoryCategory, normalize_service};

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(EVENT|MEMORY):([A-Za-z_-]+)(?::([^\]\s]+))?\][ \t]*(.*)$")
        .expect("marker regex is valid")
});

/// A notable event the agent wants surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMarker {
    pub level: EventLevel,
    pub service: Option<String>,
    pub message: String,
}

/// A piece of knowledge the agent wants remembered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMarker {
    pub category: MemoryCategory,
    pub service: Option<String>,
    pub observation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Event(EventMarker),
    Memory(MemoryMarker),
}

/// Parse the first marker on a single line.
///
/// `Ok(None)` means the line carries no marker. A marker whose level or
/// category is not recognised is an error for the caller to log and drop.
pub fn parse_marker(line: &str) -> Result<Option<Marker>, MarkerError> {
    let Some(caps) = MARKER_RE.captures(line) else {
        return Ok(None);
    };

    let kind = &caps[1];
    let tag = &caps[2];
    let service = caps.get(3).and_then(|m| normalize_service(m.as_str()));
    let body = caps.get(4).map(|m| m.as_str().trim()).unwrap_or_default();

    match kind {
        "EVENT" => {
            let level = tag.parse::<EventLevel>()?;
            if body.is_empty() {
                return Err(MarkerError::EmptyBody { kind: "event" });
            }
            Ok(Some(Marker::Event(EventMarker {
                level,
                service,
                message: body.to_string(),
            })))
        }
        _ => {
            let category = tag.parse::<MemoryCategory>()?;
            if body.is_empty() {
                return Err(MarkerError::EmptyBody { kind: "memory" });
            }
            Ok(Some(Marker::Memory(MemoryMarker {
                category,
                service,
                observation: body.to_string(),
            })))
        }
    }
}

/// Scan every line of a block of text.
pub fn scan_markers(text: &str) -> (Vec<Marker>, Vec<MarkerError>) {
    let mut markers = Vec::new();
    let mut rejected = Vec::new();
    for line in text.lines() {
        match parse_marker(line) {
            Ok(Some(marker)) => markers.push(marker),
            Ok(None) => {}
            Err(e) => rejected.push(e),
        }
    }
    (markers, rejected)
}
