//! Construction of [`EventRecord`]s from raw observations.
//!
//! [`normalize`] is the only place in the workspace that accepts untyped
//! input. Everything downstream works on the typed record.
//!
//! Rules:
//!
//! - `start` is required; a record without it is [`ConstructionError::MissingStartTime`].
//! - Timestamp strings use exactly [`TIMESTAMP_FORMAT`] and are read as UTC.
//! - Empty strings are unset, never a distinct value.
//! - A missing `stop` defaults to `start + 30s`; a `stop` before `start` is
//!   treated the same way.
//! - Kinds may be tags or codes, scalar or list, and must be known to the
//!   [`KindTable`].
//! - Hardware addresses are rewritten to lower-case `aa:bb:cc:dd:ee:ff`
//!   whatever separators they arrived with; IP addresses to their shortest
//!   textual form. Either one failing to parse is an invalid field.
//! - Unrecognized fields are ignored.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::ids::SessionId;
use crate::kinds::{EventKind, KindTable};
use crate::raw::{RawObservation, RawValue};
use crate::record::{AttributeKey, EventRecord, Interval, IntervalError};

/// The single accepted timestamp string format.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Errors raised when a raw observation cannot become an [`EventRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstructionError {
    /// The observation has no start time.
    #[error("observation has no start time")]
    MissingStartTime,

    /// A timestamp field could not be read.
    #[error("invalid timestamp in {field}: {value}")]
    InvalidTimestamp {
        /// The offending field.
        field: &'static str,
        /// The value as received.
        value: String,
    },

    /// A scalar field had an unusable shape.
    #[error("invalid value in {field}: {reason}")]
    InvalidField {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A kind tag is not registered in the kind table.
    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    /// A kind code is not registered in the kind table.
    #[error("unknown event kind code: {0}")]
    UnknownKindCode(i64),

    /// The start time is at the edge of the representable range.
    #[error("interval out of range: {0}")]
    Interval(#[from] IntervalError),
}

/// Format a timestamp in [`TIMESTAMP_FORMAT`].
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

/// Build an [`EventRecord`] from a raw observation.
///
/// # Errors
///
/// Returns a [`ConstructionError`] describing the first unusable field.
pub fn normalize(raw: &RawObservation, kinds: &KindTable) -> Result<EventRecord, ConstructionError> {
    let start = timestamp_field(raw, "start")?.ok_or(ConstructionError::MissingStartTime)?;
    let interval = match timestamp_field(raw, "stop")? {
        Some(stop) if stop >= start => Interval::new(start, stop)?,
        _ => Interval::instant(start)?,
    };

    let mut record = EventRecord::new(interval);
    record.id = id_field(raw)?;

    record.set(
        AttributeKey::Mac,
        text_field(raw, "mac")?.as_deref().map(canonical_mac).transpose()?,
    );
    record.set(
        AttributeKey::Ip,
        text_field(raw, "ip")?.as_deref().map(canonical_ip).transpose()?,
    );
    record.set(AttributeKey::Netid, text_field(raw, "netid")?);
    record.set(AttributeKey::Hostname, text_field(raw, "hostname")?);
    record.set(AttributeKey::Os, text_field(raw, "os")?);
    let user_agent = match text_field(raw, "useragent")? {
        Some(value) => Some(value),
        None => text_field(raw, "user_agent")?,
    };
    record.set(AttributeKey::UserAgent, user_agent);

    for field in ["event_type", "kind"] {
        if let Some(value) = raw.get(field) {
            collect_kinds(value, kinds, &mut record.kinds)?;
        }
    }

    Ok(record)
}

/// Read an optional timestamp field.
fn timestamp_field(
    raw: &RawObservation,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ConstructionError> {
    let Some(value) = raw.get(field) else {
        return Ok(None);
    };
    if value.is_unset() {
        return Ok(None);
    }
    match value {
        RawValue::Timestamp(instant) => Ok(Some(*instant)),
        RawValue::Text(text) => NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(|_parse| ConstructionError::InvalidTimestamp {
                field,
                value: text.clone(),
            }),
        other => Err(ConstructionError::InvalidTimestamp {
            field,
            value: format!("{other:?}"),
        }),
    }
}

/// Read an optional scalar text field. Multi-valued fields take their
/// first set element; integers are rendered as text.
fn text_field(
    raw: &RawObservation,
    field: &'static str,
) -> Result<Option<String>, ConstructionError> {
    raw.get(field).map_or(Ok(None), |value| scalar_text(value, field))
}

fn scalar_text(value: &RawValue, field: &'static str) -> Result<Option<String>, ConstructionError> {
    match value {
        RawValue::Null => Ok(None),
        RawValue::Text(text) => {
            let trimmed = text.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
        }
        RawValue::Int(number) => Ok(Some(number.to_string())),
        RawValue::List(items) => {
            for item in items {
                if let Some(text) = scalar_text(item, field)? {
                    return Ok(Some(text));
                }
            }
            Ok(None)
        }
        RawValue::Timestamp(_) | RawValue::Other(_) => Err(ConstructionError::InvalidField {
            field,
            reason: format!("expected text, got {value:?}"),
        }),
    }
}

/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff`, and
/// bare hex digits in any case.
fn canonical_mac(text: &str) -> Result<String, ConstructionError> {
    let digits: Vec<char> = text
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if digits.len() != 12 || !digits.iter().all(char::is_ascii_hexdigit) {
        return Err(ConstructionError::InvalidField {
            field: "mac",
            reason: format!("not a 48-bit hardware address: {text}"),
        });
    }

    let mut canonical = String::with_capacity(17);
    for (index, digit) in digits.iter().enumerate() {
        if index > 0 && index % 2 == 0 {
            canonical.push(':');
        }
        canonical.push(digit.to_ascii_lowercase());
    }
    Ok(canonical)
}

fn canonical_ip(text: &str) -> Result<String, ConstructionError> {
    text.parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|e| ConstructionError::InvalidField {
            field: "ip",
            reason: format!("{text}: {e}"),
        })
}

fn id_field(raw: &RawObservation) -> Result<Option<SessionId>, ConstructionError> {
    match raw.get("id") {
        None | Some(RawValue::Null) => Ok(None),
        Some(RawValue::Int(id)) => Ok(Some(SessionId(*id))),
        Some(RawValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(RawValue::Text(text)) => text.trim().parse().map(|id| Some(SessionId(id))).map_err(
            |e: std::num::ParseIntError| ConstructionError::InvalidField {
                field: "id",
                reason: e.to_string(),
            },
        ),
        Some(other) => Err(ConstructionError::InvalidField {
            field: "id",
            reason: format!("expected integer, got {other:?}"),
        }),
    }
}

fn collect_kinds(
    value: &RawValue,
    table: &KindTable,
    into: &mut BTreeSet<EventKind>,
) -> Result<(), ConstructionError> {
    match value {
        RawValue::Null => Ok(()),
        RawValue::Text(tag) if tag.trim().is_empty() => Ok(()),
        RawValue::Text(tag) => {
            let kind = table
                .resolve_tag(tag.trim())
                .ok_or_else(|| ConstructionError::UnknownKind(tag.clone()))?;
            into.insert(kind);
            Ok(())
        }
        RawValue::Int(code) => {
            let kind = i16::try_from(*code)
                .ok()
                .and_then(|short| table.kind_of(short))
                .ok_or(ConstructionError::UnknownKindCode(*code))?;
            into.insert(kind.clone());
            Ok(())
        }
        RawValue::List(items) => items
            .iter()
            .try_for_each(|item| collect_kinds(item, table, into)),
        RawValue::Timestamp(_) | RawValue::Other(_) => Err(ConstructionError::InvalidField {
            field: "event_type",
            reason: format!("expected tag or code, got {value:?}"),
        }),
    }
}
