//! Event-kind tags and the bidirectional tag/code table.
//!
//! Observations describe their provenance with one or more kind tags
//! (`DHCPACK`, `wireless_authentication`, ...). The store persists kinds as
//! small integer codes, so every tag that reaches the store must have a code.
//! [`KindTable`] owns that mapping. It ships with the historical vocabulary
//! and is extended from configuration; the reconciliation logic never names
//! a specific kind.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Vocabulary registered by [`KindTable::default`].
const DEFAULT_KINDS: [(&str, i16); 9] = [
    ("DHCPACK", 1),
    ("DHCPEXPIRE", 2),
    ("DHCPRELEASE", 3),
    ("RELEASE", 4),
    ("tomcat", 5),
    ("wireless_authentication", 6),
    ("saappsrv", 7),
    ("WinEventLog:Security", 8),
    ("access_combined", 9),
];

/// A canonical event-kind tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(String);

impl EventKind {
    /// Create a kind from its tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Return the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised when registering or translating kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KindTableError {
    /// The tag is already bound to a different code.
    #[error("kind {tag} is already bound to code {existing}, cannot rebind to {requested}")]
    TagConflict {
        /// The tag being registered.
        tag: String,
        /// The code it already maps to.
        existing: i16,
        /// The code that was requested.
        requested: i16,
    },

    /// The code is already bound to a different tag.
    #[error("code {code} is already bound to kind {existing}, cannot rebind to {requested}")]
    CodeConflict {
        /// The code being registered.
        code: i16,
        /// The tag it already maps to.
        existing: String,
        /// The tag that was requested.
        requested: String,
    },

    /// A tag has no code in the table.
    #[error("unknown kind tag: {0}")]
    UnknownTag(String),

    /// A code has no tag in the table.
    #[error("unknown kind code: {0}")]
    UnknownCode(i16),
}

/// Bidirectional mapping between kind tags and their stored codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindTable {
    by_tag: BTreeMap<EventKind, i16>,
    by_code: BTreeMap<i16, EventKind>,
}

impl KindTable {
    /// Create a table with no registered kinds.
    pub const fn empty() -> Self {
        Self {
            by_tag: BTreeMap::new(),
            by_code: BTreeMap::new(),
        }
    }

    /// Register a tag/code pair.
    ///
    /// Registering an identical pair again is a no-op. Binding a known tag
    /// to another code, or a known code to another tag, is rejected so that
    /// already-stored codes never change meaning.
    ///
    /// # Errors
    ///
    /// Returns [`KindTableError::TagConflict`] or
    /// [`KindTableError::CodeConflict`] when either side is already bound.
    pub fn register(&mut self, tag: &str, code: i16) -> Result<(), KindTableError> {
        let kind = EventKind::new(tag);

        if let Some(&existing) = self.by_tag.get(&kind) {
            if existing == code {
                return Ok(());
            }
            return Err(KindTableError::TagConflict {
                tag: tag.to_owned(),
                existing,
                requested: code,
            });
        }

        if let Some(existing) = self.by_code.get(&code) {
            return Err(KindTableError::CodeConflict {
                code,
                existing: existing.as_str().to_owned(),
                requested: tag.to_owned(),
            });
        }

        self.by_tag.insert(kind.clone(), code);
        self.by_code.insert(code, kind);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// See [`KindTable::register`].
    pub fn with_kind(mut self, tag: &str, code: i16) -> Result<Self, KindTableError> {
        self.register(tag, code)?;
        Ok(self)
    }

    /// Return the kind for a tag, if the tag is registered.
    pub fn resolve_tag(&self, tag: &str) -> Option<EventKind> {
        self.by_tag
            .get_key_value(&EventKind::new(tag))
            .map(|(kind, _)| kind.clone())
    }

    /// Return the kind for a stored code.
    pub fn kind_of(&self, code: i16) -> Option<&EventKind> {
        self.by_code.get(&code)
    }

    /// Return the stored code for a kind.
    pub fn code_of(&self, kind: &EventKind) -> Option<i16> {
        self.by_tag.get(kind).copied()
    }

    /// Encode a kind set into stored codes, in ascending code order.
    ///
    /// # Errors
    ///
    /// Returns [`KindTableError::UnknownTag`] for a kind with no code.
    pub fn encode(&self, kinds: &BTreeSet<EventKind>) -> Result<Vec<i16>, KindTableError> {
        let mut codes = kinds
            .iter()
            .map(|kind| {
                self.code_of(kind)
                    .ok_or_else(|| KindTableError::UnknownTag(kind.as_str().to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        codes.sort_unstable();
        Ok(codes)
    }

    /// Decode stored codes into a kind set.
    ///
    /// # Errors
    ///
    /// Returns [`KindTableError::UnknownCode`] for a code with no tag.
    pub fn decode(&self, codes: &[i16]) -> Result<BTreeSet<EventKind>, KindTableError> {
        codes
            .iter()
            .map(|&code| {
                self.kind_of(code)
                    .cloned()
                    .ok_or(KindTableError::UnknownCode(code))
            })
            .collect()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    /// Whether no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

impl Default for KindTable {
    fn default() -> Self {
        let by_tag = DEFAULT_KINDS
            .iter()
            .map(|&(tag, code)| (EventKind::new(tag), code))
            .collect();
        let by_code = DEFAULT_KINDS
            .iter()
            .map(|&(tag, code)| (code, EventKind::new(tag)))
            .collect();
        Self { by_tag, by_code }
    }
}
