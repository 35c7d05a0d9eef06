//! Interpretation of the agent's line-delimited output stream.

mod classifier;
mod marker;

pub use classifier::{
    Classified, INIT_BANNER, PREVIEW_CHARS, ResultSummary, classify, render_log, truncate_preview,
};
pub use marker::{EventMarker, Marker, MemoryMarker, parse_marker, scan_markers};
