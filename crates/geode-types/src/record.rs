//! The canonical observation/session record and its primitives.
//!
//! An [`EventRecord`] is both the unit of incoming evidence (a normalized
//! observation) and the shape of a stored session. The functions here are
//! pure: [`matches`] decides whether two records can describe the same
//! session, [`merge`] folds one into the other, and [`Interval::overlaps`]
//! is the predicate stores use for candidate lookup.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::kinds::EventKind;

/// Minimum duration (seconds) assumed for an instantaneous observation.
pub const DEFAULT_DURATION_SECS: i64 = 30;

/// Minimum duration assumed for an instantaneous observation.
pub fn default_duration() -> TimeDelta {
    TimeDelta::seconds(DEFAULT_DURATION_SECS)
}

/// Errors raised when building or adjusting an [`Interval`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    /// The stop time precedes the start time.
    #[error("interval stop {stop} precedes start {start}")]
    Inverted {
        /// Requested start.
        start: DateTime<Utc>,
        /// Requested stop.
        stop: DateTime<Utc>,
    },

    /// Time arithmetic left the representable range.
    #[error("interval arithmetic overflowed")]
    Overflow,
}

/// A closed time interval with `start <= stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Interval {
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
}

impl Interval {
    /// Create an interval.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Inverted`] if `stop < start`.
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<Self, IntervalError> {
        if stop < start {
            return Err(IntervalError::Inverted { start, stop });
        }
        Ok(Self { start, stop })
    }

    /// Create the interval of an instantaneous event: `[start, start + 30s]`.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Overflow`] at the edge of the time range.
    pub fn instant(start: DateTime<Utc>) -> Result<Self, IntervalError> {
        let stop = start
            .checked_add_signed(default_duration())
            .ok_or(IntervalError::Overflow)?;
        Ok(Self { start, stop })
    }

    /// Start of the interval.
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Stop of the interval.
    pub const fn stop(&self) -> DateTime<Utc> {
        self.stop
    }

    /// Whether `instant` lies inside the interval (inclusive).
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.stop
    }

    /// Whether two intervals overlap.
    ///
    /// True when either endpoint of `other` falls inside `self`, or when
    /// `self` lies entirely inside `other`. Endpoints are inclusive, so
    /// touching intervals overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other.start)
            || self.contains(other.stop)
            || (other.start <= self.start && self.stop <= other.stop)
    }

    /// Extend the interval by `before` at the start and `after` at the stop.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Overflow`] if either bound leaves the
    /// representable range, or [`IntervalError::Inverted`] if negative
    /// deltas would invert the interval.
    pub fn widened(&self, before: TimeDelta, after: TimeDelta) -> Result<Self, IntervalError> {
        let start = self
            .start
            .checked_sub_signed(before)
            .ok_or(IntervalError::Overflow)?;
        let stop = self
            .stop
            .checked_add_signed(after)
            .ok_or(IntervalError::Overflow)?;
        Self::new(start, stop)
    }

    /// The smallest interval covering both `self` and `other`.
    #[must_use]
    pub fn hull(&self, other: &Self) -> Self {
        Self {
            start: self.start.min(other.start),
            stop: self.stop.max(other.stop),
        }
    }

    /// The same interval with a different stop.
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Inverted`] if `stop` precedes the start.
    pub fn with_stop(&self, stop: DateTime<Utc>) -> Result<Self, IntervalError> {
        Self::new(self.start, stop)
    }
}

/// The network identity an observation is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct IdentityKey {
    /// Hardware address, lower-cased.
    pub mac: Option<String>,
    /// IP address.
    pub ip: Option<String>,
}

impl IdentityKey {
    /// The key used to look up candidate sessions: `mac` if known, else `ip`.
    pub fn lookup(&self) -> Option<IdentityLookup> {
        self.mac
            .as_ref()
            .map(|mac| IdentityLookup::Mac(mac.clone()))
            .or_else(|| self.ip.as_ref().map(|ip| IdentityLookup::Ip(ip.clone())))
    }

    /// Whether at least one of `mac`/`ip` is known.
    pub const fn is_known(&self) -> bool {
        self.mac.is_some() || self.ip.is_some()
    }
}

/// A single-column identity lookup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum IdentityLookup {
    /// Look up by hardware address.
    Mac(String),
    /// Look up by IP address.
    Ip(String),
}

impl IdentityLookup {
    /// The looked-up value.
    pub fn value(&self) -> &str {
        match self {
            Self::Mac(value) | Self::Ip(value) => value,
        }
    }
}

impl core::fmt::Display for IdentityLookup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Mac(mac) => write!(f, "mac={mac}"),
            Self::Ip(ip) => write!(f, "ip={ip}"),
        }
    }
}

/// Auxiliary attributes bound to an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Attributes {
    /// User id.
    pub netid: Option<String>,
    /// Host name.
    pub hostname: Option<String>,
    /// Browser user-agent string.
    pub user_agent: Option<String>,
    /// Operating system.
    pub os: Option<String>,
}

/// Names of the scalar fields of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKey {
    /// Hardware address.
    Mac,
    /// IP address.
    Ip,
    /// User id.
    Netid,
    /// Host name.
    Hostname,
    /// Browser user-agent string.
    UserAgent,
    /// Operating system.
    Os,
}

impl AttributeKey {
    /// Every scalar field, in storage column order.
    pub const ALL: [Self; 6] = [
        Self::Mac,
        Self::Ip,
        Self::Netid,
        Self::Hostname,
        Self::UserAgent,
        Self::Os,
    ];

    /// The field name as used in raw observations and config.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mac => "mac",
            Self::Ip => "ip",
            Self::Netid => "netid",
            Self::Hostname => "hostname",
            Self::UserAgent => "user_agent",
            Self::Os => "os",
        }
    }
}

impl core::fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys compared by [`matches`]. `user_agent` and `os` vary too much
/// between sources describing the same session to count as conflicts.
pub const MATCH_KEYS: [AttributeKey; 4] = [
    AttributeKey::Mac,
    AttributeKey::Ip,
    AttributeKey::Netid,
    AttributeKey::Hostname,
];

/// An observation or a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Store id; `None` on fresh observations.
    pub id: Option<SessionId>,
    /// Identity the record is about.
    pub identity: IdentityKey,
    /// Time span the record covers.
    pub interval: Interval,
    /// Auxiliary attributes.
    pub attributes: Attributes,
    /// Event-kind tags.
    pub kinds: BTreeSet<EventKind>,
}

impl EventRecord {
    /// Create a record with no identity, attributes, or kinds.
    pub fn new(interval: Interval) -> Self {
        Self {
            id: None,
            identity: IdentityKey::default(),
            interval,
            attributes: Attributes::default(),
            kinds: BTreeSet::new(),
        }
    }

    /// Start of the record's interval.
    pub const fn start(&self) -> DateTime<Utc> {
        self.interval.start()
    }

    /// Stop of the record's interval.
    pub const fn stop(&self) -> DateTime<Utc> {
        self.interval.stop()
    }

    /// Read a scalar field.
    pub fn get(&self, key: AttributeKey) -> Option<&str> {
        let slot = match key {
            AttributeKey::Mac => &self.identity.mac,
            AttributeKey::Ip => &self.identity.ip,
            AttributeKey::Netid => &self.attributes.netid,
            AttributeKey::Hostname => &self.attributes.hostname,
            AttributeKey::UserAgent => &self.attributes.user_agent,
            AttributeKey::Os => &self.attributes.os,
        };
        slot.as_deref()
    }

    /// Overwrite a scalar field. Empty strings are stored as `None`.
    pub fn set(&mut self, key: AttributeKey, value: Option<String>) {
        let slot = match key {
            AttributeKey::Mac => &mut self.identity.mac,
            AttributeKey::Ip => &mut self.identity.ip,
            AttributeKey::Netid => &mut self.attributes.netid,
            AttributeKey::Hostname => &mut self.attributes.hostname,
            AttributeKey::UserAgent => &mut self.attributes.user_agent,
            AttributeKey::Os => &mut self.attributes.os,
        };
        *slot = value.filter(|v| !v.is_empty());
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: AttributeKey, value: &str) -> Self {
        self.set(key, Some(value.to_owned()));
        self
    }

    /// Builder-style kind insertion.
    #[must_use]
    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// See [`matches`].
    pub fn matches(&self, other: &Self) -> bool {
        matches(self, other)
    }

    /// [`matches`] plus a buffer-less interval overlap check, for comparing
    /// records that did not come out of a store lookup.
    pub fn matches_overlapping(&self, other: &Self) -> bool {
        self.interval.overlaps(&other.interval) && matches(self, other)
    }

    /// See [`merge`].
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        merge(self, other)
    }
}

/// Whether two records carry no conflicting evidence.
///
/// For each key in [`MATCH_KEYS`], a value missing on either side is not a
/// conflict; two present values that differ are. Symmetric.
pub fn matches(a: &EventRecord, b: &EventRecord) -> bool {
    MATCH_KEYS
        .iter()
        .all(|&key| match (a.get(key), b.get(key)) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        })
}

/// Fold `b` into `a`, producing a new record.
///
/// The interval becomes the hull of both, kinds are unioned, and for every
/// scalar field (and the id) `b` wins when it has a value.
pub fn merge(a: &EventRecord, b: &EventRecord) -> EventRecord {
    let mut merged = a.clone();
    merged.interval = a.interval.hull(&b.interval);
    merged.kinds.extend(b.kinds.iter().cloned());
    if b.id.is_some() {
        merged.id = b.id;
    }
    for key in AttributeKey::ALL {
        if let Some(value) = b.get(key) {
            merged.set(key, Some(value.to_owned()));
        }
    }
    merged
}

/// Result of comparing an observation against a candidate on a key subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyComparison {
    /// A key present on both sides differs.
    Conflict(Vec<AttributeKey>),
    /// The observation supplies keys the candidate lacks, with no conflict.
    NewInformation(Vec<AttributeKey>),
    /// Nothing in the observation is new to the candidate.
    NoNewInformation,
}

/// Tri-state comparison of `observation` against `candidate` on `keys`.
pub fn compare_keys(
    candidate: &EventRecord,
    observation: &EventRecord,
    keys: &[AttributeKey],
) -> KeyComparison {
    let mut conflicts = Vec::new();
    let mut additions = Vec::new();

    for &key in keys {
        match (candidate.get(key), observation.get(key)) {
            (Some(stored), Some(seen)) if stored != seen => conflicts.push(key),
            (None, Some(_)) => additions.push(key),
            _ => {}
        }
    }

    if !conflicts.is_empty() {
        KeyComparison::Conflict(conflicts)
    } else if !additions.is_empty() {
        KeyComparison::NewInformation(additions)
    } else {
        KeyComparison::NoNewInformation
    }
}
