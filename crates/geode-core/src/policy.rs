//! Per-stream reconciliation policies.
//!
//! A [`StreamPolicy`] is a small value that parameterizes the single
//! [`Reconciler`](crate::reconcile::Reconciler): how the lookup window is
//! shaped around an observation, how a candidate is compared with it, and
//! what happens on a match or a conflict. The three historical stream
//! classifications are available as constructors.

use std::collections::BTreeSet;

use chrono::TimeDelta;
use geode_types::{AttributeKey, EventKind, EventRecord, Interval, IntervalError};
use serde::{Deserialize, Serialize};

use crate::store::OrderPolicy;

/// Default symmetric lookup buffer for the generic policy (seconds).
pub const DEFAULT_GENERIC_BUFFER_SECS: i64 = 30;

/// Default trailing latency buffer for the lease policy (seconds).
pub const DEFAULT_LEASE_BUFFER_SECS: i64 = 600;

/// Default lookahead window for latency-sensitive info kinds (seconds).
pub const DEFAULT_INFO_WINDOW_SECS: i64 = 600;

/// Keys compared by the info policy when none are configured.
pub const DEFAULT_INFO_KEYS: [AttributeKey; 2] = [AttributeKey::Netid, AttributeKey::Hostname];

/// Stream classification selecting a policy family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Interval-bearing records correlated on mac/ip.
    #[default]
    Generic,
    /// Lease-style records that renew or rebind an address.
    Lease,
    /// Momentary facts (authentication pings) that enrich a session.
    Info,
}

impl core::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Generic => "generic",
            Self::Lease => "lease",
            Self::Info => "info",
        };
        f.write_str(name)
    }
}

/// Shape of the interval used to look up candidate sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupWindow {
    /// `[start - buffer, stop + buffer]`.
    Symmetric {
        /// Buffer applied on both sides.
        buffer: TimeDelta,
    },
    /// `[start - buffer, stop]`.
    Trailing {
        /// Buffer applied before the start.
        buffer: TimeDelta,
    },
    /// `[start, start + window]` for latency-sensitive kinds, else the
    /// single instant `[start, start]`.
    Lookahead {
        /// Lookahead length.
        window: TimeDelta,
        /// Kinds that get the lookahead.
        latency_kinds: BTreeSet<EventKind>,
    },
}

impl LookupWindow {
    /// Compute the lookup interval for an observation.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError`] if the widened interval leaves the
    /// representable time range.
    pub fn around(&self, observation: &EventRecord) -> Result<Interval, IntervalError> {
        match self {
            Self::Symmetric { buffer } => observation.interval.widened(*buffer, *buffer),
            Self::Trailing { buffer } => observation.interval.widened(*buffer, TimeDelta::zero()),
            Self::Lookahead {
                window,
                latency_kinds,
            } => {
                let start = observation.start();
                let sensitive = observation
                    .kinds
                    .iter()
                    .any(|kind| latency_kinds.contains(kind));
                if sensitive {
                    let stop = start
                        .checked_add_signed(*window)
                        .ok_or(IntervalError::Overflow)?;
                    Interval::new(start, stop)
                } else {
                    Interval::new(start, start)
                }
            }
        }
    }
}

/// How a found candidate is compared with the observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// [`geode_types::matches`] over the standard match keys.
    Full,
    /// Same `ip`; an observation without an `ip` counts as the same.
    SameIp,
    /// Tri-state [`geode_types::compare_keys`] over the given keys.
    Keys(Vec<AttributeKey>),
}

/// What to do when the candidate is consistent with the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMatch {
    /// Write `merge(candidate, observation)` back wholesale.
    Merge,
    /// Advance only the stored `stop`.
    ExtendStop,
    /// Patch exactly the keys the observation adds.
    PatchNewKeys,
}

/// How the successor session is built on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Successor inherits the candidate's attributes, overridden by the
    /// observation where it has values.
    Inherit,
    /// Like [`OnConflict::Inherit`], but `start`, `stop`, `ip` and `kinds`
    /// come wholesale from the observation.
    Rebind,
}

/// Complete reconciliation policy for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPolicy {
    /// The family this policy was built from.
    pub kind: PolicyKind,
    /// Lookup window shape.
    pub window: LookupWindow,
    /// Candidate comparison.
    pub comparison: Comparison,
    /// Action on a match.
    pub on_match: OnMatch,
    /// Successor construction on a conflict.
    pub on_conflict: OnConflict,
    /// Candidate preference when several sessions overlap.
    pub order: OrderPolicy,
}

impl StreamPolicy {
    /// Generic policy with a symmetric `buffer`.
    pub const fn generic(buffer: TimeDelta) -> Self {
        Self {
            kind: PolicyKind::Generic,
            window: LookupWindow::Symmetric { buffer },
            comparison: Comparison::Full,
            on_match: OnMatch::Merge,
            on_conflict: OnConflict::Inherit,
            order: OrderPolicy::LatestStop,
        }
    }

    /// Lease policy with a trailing latency `buffer`.
    pub const fn lease(buffer: TimeDelta) -> Self {
        Self {
            kind: PolicyKind::Lease,
            window: LookupWindow::Trailing { buffer },
            comparison: Comparison::SameIp,
            on_match: OnMatch::ExtendStop,
            on_conflict: OnConflict::Rebind,
            order: OrderPolicy::LatestStop,
        }
    }

    /// Instantaneous-info policy.
    ///
    /// Observations tagged with one of `latency_kinds` look ahead by
    /// `window`; the others are looked up at their exact start instant.
    /// Candidates are compared on `keys` only.
    pub const fn info(
        window: TimeDelta,
        latency_kinds: BTreeSet<EventKind>,
        keys: Vec<AttributeKey>,
    ) -> Self {
        Self {
            kind: PolicyKind::Info,
            window: LookupWindow::Lookahead {
                window,
                latency_kinds,
            },
            comparison: Comparison::Keys(keys),
            on_match: OnMatch::PatchNewKeys,
            on_conflict: OnConflict::Inherit,
            order: OrderPolicy::NewestFirst,
        }
    }
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self::generic(TimeDelta::seconds(DEFAULT_GENERIC_BUFFER_SECS))
    }
}
