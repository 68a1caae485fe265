//! The reconciliation orchestrator.
//!
//! Every observation goes through `lookup -> decide -> act`:
//!
//! - [`lookup_query`] turns the observation into an [`OverlapQuery`] using
//!   the stream's [`LookupWindow`](crate::policy::LookupWindow) and rejects observations with no identity.
//! - [`decide`] is a pure function of the policy, the candidate the store
//!   returned, and the observation.
//! - [`Reconciler::apply`] issues exactly one store operation for the
//!   decision. A split is a single atomic store call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use geode_types::{EventRecord, Interval, KeyComparison, SessionId, compare_keys, merge};
use tokio::sync::OwnedMutexGuard;

use crate::locks::IdentityLocks;
use crate::policy::{Comparison, OnConflict, OnMatch, StreamPolicy};
use crate::store::{FieldPatch, OverlapQuery, SessionStore, StoreError};

/// Errors raised while reconciling one observation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    /// The observation has neither a mac nor an ip.
    #[error("observation has no mac or ip to look up")]
    AmbiguousIdentity,

    /// The store failed; surfaced unmodified.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Interval arithmetic produced an impossible result.
    #[error("inconsistent time comparison: {detail}")]
    TimeComparisonInconsistent {
        /// What went wrong.
        detail: String,
    },
}

impl ReconcileError {
    fn time(detail: impl core::fmt::Display) -> Self {
        Self::TimeComparisonInconsistent {
            detail: detail.to_string(),
        }
    }
}

/// The store operation chosen for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No candidate: store the observation as a new session.
    Insert,
    /// Overwrite the candidate with the merged record.
    Merge {
        /// Candidate id.
        id: SessionId,
        /// Record to write back wholesale.
        record: Box<EventRecord>,
    },
    /// Advance the candidate's stop.
    Extend {
        /// Candidate id.
        id: SessionId,
        /// New stop.
        stop: DateTime<Utc>,
    },
    /// Patch a few fields of the candidate.
    Patch {
        /// Candidate id.
        id: SessionId,
        /// Fields to write.
        patch: FieldPatch,
    },
    /// Terminate the candidate and insert a successor.
    Split {
        /// Candidate id.
        id: SessionId,
        /// Candidate's new stop.
        stop: DateTime<Utc>,
        /// Session starting where the candidate now ends.
        successor: Box<EventRecord>,
    },
    /// The observation is already incorporated.
    NoOp {
        /// Candidate id.
        id: SessionId,
    },
}

/// What [`Reconciler::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new session was stored.
    Inserted(SessionId),
    /// A session was overwritten with a merge.
    Merged(SessionId),
    /// A session's stop was advanced.
    Extended(SessionId),
    /// A session was patched in place.
    Patched(SessionId),
    /// A session was terminated and a successor stored.
    Split {
        /// The terminated session.
        terminated: SessionId,
        /// The new successor session.
        successor: SessionId,
    },
    /// Nothing was written.
    Unchanged(SessionId),
}

/// Build the candidate lookup for `observation`.
///
/// # Errors
///
/// Returns [`ReconcileError::AmbiguousIdentity`] when the observation has no
/// mac and no ip, or [`ReconcileError::TimeComparisonInconsistent`] if the
/// lookup window cannot be represented.
pub fn lookup_query(
    policy: &StreamPolicy,
    observation: &EventRecord,
) -> Result<OverlapQuery, ReconcileError> {
    let key = observation
        .identity
        .lookup()
        .ok_or(ReconcileError::AmbiguousIdentity)?;
    let window = policy
        .window
        .around(observation)
        .map_err(ReconcileError::time)?;
    Ok(OverlapQuery {
        key,
        window,
        order: policy.order,
    })
}

/// Decide what to do with `observation` given the store's `candidate`.
///
/// # Errors
///
/// Returns [`ReconcileError::Store`] if the candidate carries no id, or
/// [`ReconcileError::TimeComparisonInconsistent`] if a successor interval
/// cannot be built.
pub fn decide(
    policy: &StreamPolicy,
    candidate: Option<&EventRecord>,
    observation: &EventRecord,
) -> Result<Decision, ReconcileError> {
    let Some(candidate) = candidate else {
        return Ok(Decision::Insert);
    };
    let id = candidate
        .id
        .ok_or_else(|| StoreError::Corrupt("stored candidate has no id".to_owned()))?;

    match &policy.comparison {
        Comparison::Full if geode_types::matches(candidate, observation) => {
            Ok(on_match(policy.on_match, id, candidate, observation, &[]))
        }
        Comparison::SameIp if same_ip(candidate, observation) => {
            Ok(on_match(policy.on_match, id, candidate, observation, &[]))
        }
        Comparison::Keys(keys) => match compare_keys(candidate, observation, keys) {
            KeyComparison::NoNewInformation => Ok(Decision::NoOp { id }),
            KeyComparison::NewInformation(added) => {
                Ok(on_match(policy.on_match, id, candidate, observation, &added))
            }
            KeyComparison::Conflict(_) => split(policy.on_conflict, id, candidate, observation),
        },
        Comparison::Full | Comparison::SameIp => {
            split(policy.on_conflict, id, candidate, observation)
        }
    }
}

fn same_ip(candidate: &EventRecord, observation: &EventRecord) -> bool {
    match (&candidate.identity.ip, &observation.identity.ip) {
        (Some(stored), Some(seen)) => stored == seen,
        _ => true,
    }
}

fn on_match(
    strategy: OnMatch,
    id: SessionId,
    candidate: &EventRecord,
    observation: &EventRecord,
    added: &[geode_types::AttributeKey],
) -> Decision {
    match strategy {
        OnMatch::Merge => {
            let record = merge(candidate, observation);
            if record == *candidate {
                Decision::NoOp { id }
            } else {
                Decision::Merge {
                    id,
                    record: Box::new(record),
                }
            }
        }
        OnMatch::ExtendStop => {
            if observation.stop() > candidate.stop() {
                Decision::Extend {
                    id,
                    stop: observation.stop(),
                }
            } else {
                Decision::NoOp { id }
            }
        }
        OnMatch::PatchNewKeys => {
            let mut patch = FieldPatch::default();
            for &key in added {
                if let Some(value) = observation.get(key) {
                    patch.fields.insert(key, value.to_owned());
                }
            }
            if patch.is_empty() {
                Decision::NoOp { id }
            } else {
                Decision::Patch { id, patch }
            }
        }
    }
}

fn split(
    style: OnConflict,
    id: SessionId,
    candidate: &EventRecord,
    observation: &EventRecord,
) -> Result<Decision, ReconcileError> {
    let boundary = observation.start().max(candidate.start());
    let stop = candidate.stop().min(boundary);

    let successor = match style {
        OnConflict::Inherit => {
            let mut successor = merge(candidate, observation);
            successor.interval = Interval::new(boundary, observation.stop().max(boundary))
                .map_err(ReconcileError::time)?;
            successor.kinds.clone_from(&observation.kinds);
            successor
        }
        OnConflict::Rebind => {
            let mut successor = candidate.clone();
            successor.interval = observation.interval;
            successor.identity.ip.clone_from(&observation.identity.ip);
            successor.kinds.clone_from(&observation.kinds);
            successor
        }
    };

    Ok(Decision::Split {
        id,
        stop,
        successor: Box::new(EventRecord {
            id: None,
            ..successor
        }),
    })
}

/// Applies observations for one stream to a [`SessionStore`].
#[derive(Debug)]
pub struct Reconciler<S> {
    store: S,
    policy: StreamPolicy,
    locks: Option<Arc<IdentityLocks>>,
}

impl<S: SessionStore> Reconciler<S> {
    /// Create a reconciler with no cross-stream identity locking.
    pub const fn new(store: S, policy: StreamPolicy) -> Self {
        Self {
            store,
            policy,
            locks: None,
        }
    }

    /// Serialize access per identity and per stored session through a
    /// shared lock registry.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<IdentityLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// The policy this reconciler applies.
    pub const fn policy(&self) -> &StreamPolicy {
        &self.policy
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Reconcile one observation into the store.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::AmbiguousIdentity`] before touching the
    /// store if the observation has no identity, and surfaces store failures
    /// unmodified. No retries are attempted.
    pub async fn apply(&self, observation: &EventRecord) -> Result<Outcome, ReconcileError> {
        let query = lookup_query(&self.policy, observation)?;

        let (candidate, _guards) = match &self.locks {
            Some(locks) => {
                let identity = locks.acquire(&query.key).await;
                let (candidate, session) = self.lock_candidate(locks, &query).await?;
                (candidate, Some((identity, session)))
            }
            None => (self.store.find_overlapping(&query).await?, None),
        };
        let decision = decide(&self.policy, candidate.as_ref(), observation)?;

        tracing::debug!(
            key = %query.key,
            policy = %self.policy.kind,
            decision = ?DecisionKind::from(&decision),
            "Reconciling observation"
        );

        let outcome = match decision {
            Decision::Insert => Outcome::Inserted(self.store.insert(observation).await?),
            Decision::Merge { id, record } => {
                self.store.overwrite(id, &record).await?;
                Outcome::Merged(id)
            }
            Decision::Extend { id, stop } => {
                self.store
                    .patch_fields(id, &FieldPatch::stop_at(stop))
                    .await?;
                Outcome::Extended(id)
            }
            Decision::Patch { id, patch } => {
                self.store.patch_fields(id, &patch).await?;
                Outcome::Patched(id)
            }
            Decision::Split {
                id,
                stop,
                successor,
            } => {
                let successor = self
                    .store
                    .terminate_and_insert(id, stop, &successor)
                    .await?;
                Outcome::Split {
                    terminated: id,
                    successor,
                }
            }
            Decision::NoOp { id } => Outcome::Unchanged(id),
        };
        Ok(outcome)
    }

    /// Look up the candidate and hold its session lock.
    ///
    /// Another stream may reach the same row through a different key, so the
    /// candidate is read again once its lock is held. If the preferred row
    /// changed meanwhile (a split added a successor), the lock moves to the
    /// new candidate.
    async fn lock_candidate(
        &self,
        locks: &IdentityLocks,
        query: &OverlapQuery,
    ) -> Result<(Option<EventRecord>, Option<OwnedMutexGuard<()>>), ReconcileError> {
        let mut candidate = self.store.find_overlapping(query).await?;
        loop {
            let Some(id) = candidate.as_ref().and_then(|record| record.id) else {
                return Ok((candidate, None));
            };
            let guard = locks.acquire_session(id).await;
            let current = self.store.find_overlapping(query).await?;
            if current.as_ref().and_then(|record| record.id) == Some(id) {
                return Ok((current, Some(guard)));
            }
            candidate = current;
        }
    }
}

/// Field-free view of a [`Decision`] for logging.
#[derive(Debug)]
enum DecisionKind {
    Insert,
    Merge,
    Extend,
    Patch,
    Split,
    NoOp,
}

impl From<&Decision> for DecisionKind {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Insert => Self::Insert,
            Decision::Merge { .. } => Self::Merge,
            Decision::Extend { .. } => Self::Extend,
            Decision::Patch { .. } => Self::Patch,
            Decision::Split { .. } => Self::Split,
            Decision::NoOp { .. } => Self::NoOp,
        }
    }
}
