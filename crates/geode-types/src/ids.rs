//! Type-safe identifier for stored session records.
//!
//! Session ids are assigned by the store (`BIGSERIAL` in `PostgreSQL`, a
//! counter in the in-memory store) and grow monotonically, so a larger id
//! always means a more recently created session. Fresh observations carry
//! no id at all.

use serde::{Deserialize, Serialize};

/// Unique identifier for a session record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    /// Return the inner store value.
    pub const fn into_inner(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<SessionId> for i64 {
    fn from(id: SessionId) -> Self {
        id.0
    }
}
