//! Per-identity and per-session serialization across concurrently running
//! streams.
//!
//! The reconciler's lookup-then-act sequence is not atomic. Streams that can
//! observe the same identity share one [`IdentityLocks`]. An identity lock
//! keeps two observations keyed by the same mac (or ip) from racing to
//! insert. A session lock keeps streams that reach the same stored row
//! through different keys from writing it from a stale read.
//!
//! Identity locks are always taken before session locks, and a session lock
//! is never held while waiting for an identity.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use geode_types::{IdentityLookup, SessionId};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Identity(IdentityLookup),
    Session(SessionId),
}

/// A registry of async locks keyed by identity or stored session.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    slots: Mutex<BTreeMap<Slot, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// The returned guard releases the identity when dropped. Entries no
    /// longer held by anyone are pruned on each acquisition.
    pub async fn acquire(&self, key: &IdentityLookup) -> OwnedMutexGuard<()> {
        self.lock(Slot::Identity(key.clone())).await
    }

    /// Wait for exclusive access to the stored session `id`.
    pub async fn acquire_session(&self, id: SessionId) -> OwnedMutexGuard<()> {
        self.lock(Slot::Session(id)).await
    }

    async fn lock(&self, slot: Slot) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            Arc::clone(slots.entry(slot).or_default())
        };
        mutex.lock_owned().await
    }

    /// Number of identities and sessions currently tracked.
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_identity_waits() {
        let locks = Arc::new(IdentityLocks::new());
        let key = IdentityLookup::Mac("aa:bb".to_owned());

        let guard = locks.acquire(&key).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        assert!(contender.await.is_ok());
    }

    #[tokio::test]
    async fn same_session_waits() {
        let locks = Arc::new(IdentityLocks::new());

        let guard = locks.acquire_session(SessionId(7)).await;
        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire_session(SessionId(7)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        assert!(contender.await.is_ok());
    }

    #[tokio::test]
    async fn different_identities_do_not_block() {
        let locks = IdentityLocks::new();
        let _mac = locks.acquire(&IdentityLookup::Mac("aa".to_owned())).await;
        let _ip = locks.acquire(&IdentityLookup::Ip("10.0.0.1".to_owned())).await;
        let _row = locks.acquire_session(SessionId(1)).await;
        assert_eq!(locks.tracked(), 3);
    }

    #[tokio::test]
    async fn released_identities_are_pruned() {
        let locks = IdentityLocks::new();
        drop(locks.acquire(&IdentityLookup::Mac("aa".to_owned())).await);
        drop(locks.acquire_session(SessionId(1)).await);
        drop(locks.acquire(&IdentityLookup::Mac("bb".to_owned())).await);
        assert_eq!(locks.tracked(), 1);
    }
}
