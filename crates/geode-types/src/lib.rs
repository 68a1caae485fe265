//! Shared type definitions for the Geode session reconciler.
//!
//! This crate is the single source of truth for the record shape that
//! flows through the workspace: raw observations pulled from the
//! telemetry source, the normalized [`EventRecord`], and the stored
//! session rows built from it. Nothing in here performs I/O.
//!
//! # Modules
//!
//! - [`ids`] -- Store-assigned session identifiers
//! - [`kinds`] -- Event-kind tags and the bidirectional tag/code table
//! - [`raw`] -- Untyped observation values as delivered by the source
//! - [`record`] -- [`EventRecord`], intervals, match and merge primitives
//! - [`normalize`] -- The only constructor that accepts untyped input

pub mod ids;
pub mod kinds;
pub mod normalize;
pub mod raw;
pub mod record;

// Re-export all public types at crate root for convenience.
pub use ids::SessionId;
pub use kinds::{EventKind, KindTable, KindTableError};
pub use normalize::{ConstructionError, TIMESTAMP_FORMAT, format_timestamp, normalize};
pub use raw::{RawObservation, RawValue};
pub use record::{
    AttributeKey, Attributes, DEFAULT_DURATION_SECS, EventRecord, IdentityKey, IdentityLookup,
    Interval, IntervalError, KeyComparison, MATCH_KEYS, compare_keys, default_duration, matches,
    merge,
};
