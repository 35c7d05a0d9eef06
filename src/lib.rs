//! vigil: supervises autonomous infrastructure investigation sessions.
//!
//! An external agent process is spawned for each session. Its stream-json
//! output is logged verbatim, classified into display lines for live viewers,
//! and scanned for embedded `[EVENT:...]` and `[MEMORY:...]` markers. Those
//! markers feed a confidence-scored operational memory and an event log,
//! while a per-service cooldown ledger rate-limits remediation attempts.

pub mod config;
pub mod cooldown;
pub mod db;
pub mod error;
pub mod event;
pub mod memory;
pub mod session;
pub mod stream;

pub use config::Config;
pub use error::{ConfigError, DatabaseError, MarkerError, SupervisorError};
