//! Lock storage
//!
//! `LockStore` is the durable table of active locks, keyed uniquely by block
//! id. `insert_if_absent` is the one atomic primitive the lock manager relies
//! on: of several concurrent inserts for the same block exactly one returns
//! `Inserted`. Every delete returns the rows it removed so that callers can
//! emit events exactly once per lock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use coedit_core::{Actor, Lock, Result, SessionKey, MAX_LOCK_TTL_MS};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row for the block already exists (live or not yet pruned).
    Conflict,
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert unless a row with the same block id exists.
    async fn insert_if_absent(&self, lock: Lock) -> Result<InsertOutcome>;

    async fn get(&self, block_id: &str) -> Result<Option<Lock>>;

    async fn list(&self) -> Result<Vec<Lock>>;

    async fn list_document(&self, document_id: &str) -> Result<Vec<Lock>>;

    /// Delete the block's row only if `holder` holds it.
    async fn delete_held(&self, block_id: &str, holder: &Actor) -> Result<Option<Lock>>;

    /// Delete the block's row whoever holds it.
    async fn delete(&self, block_id: &str) -> Result<Option<Lock>>;

    async fn delete_session(&self, session: &SessionKey) -> Result<Vec<Lock>>;

    /// Delete the block's row only if it has expired at `now`.
    async fn delete_if_expired(&self, block_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>>;

    /// Delete every row expired at `now`, optionally limited to one document.
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        document_id: Option<&str>,
    ) -> Result<Vec<Lock>>;

    /// Push `expires_at` forward on a live lock held by `holder`. The
    /// extension is capped at `MAX_LOCK_TTL_MS`.
    async fn extend(
        &self,
        block_id: &str,
        holder: &Actor,
        additional_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Lock>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store. The DashMap entry API gives the uniqueness guarantee.
#[derive(Default)]
pub struct MemoryLockStore {
    locks: DashMap<String, Lock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn drain_where(&self, mut pred: impl FnMut(&Lock) -> bool) -> Vec<Lock> {
        let mut removed = Vec::new();
        self.locks.retain(|_, lock| {
            if pred(lock) {
                removed.push(lock.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn insert_if_absent(&self, lock: Lock) -> Result<InsertOutcome> {
        match self.locks.entry(lock.block_id.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(lock);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn get(&self, block_id: &str) -> Result<Option<Lock>> {
        Ok(self.locks.get(block_id).map(|l| l.clone()))
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        Ok(self.locks.iter().map(|e| e.value().clone()).collect())
    }

    async fn list_document(&self, document_id: &str) -> Result<Vec<Lock>> {
        Ok(self
            .locks
            .iter()
            .filter(|e| e.document_id == document_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn delete_held(&self, block_id: &str, holder: &Actor) -> Result<Option<Lock>> {
        Ok(self
            .locks
            .remove_if(block_id, |_, lock| &lock.locked_by == holder)
            .map(|(_, lock)| lock))
    }

    async fn delete(&self, block_id: &str) -> Result<Option<Lock>> {
        Ok(self.locks.remove(block_id).map(|(_, lock)| lock))
    }

    async fn delete_session(&self, session: &SessionKey) -> Result<Vec<Lock>> {
        Ok(self.drain_where(|lock| &lock.session_id == session))
    }

    async fn delete_if_expired(&self, block_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>> {
        Ok(self
            .locks
            .remove_if(block_id, |_, lock| !lock.is_live(now))
            .map(|(_, lock)| lock))
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        document_id: Option<&str>,
    ) -> Result<Vec<Lock>> {
        Ok(self.drain_where(|lock| {
            !lock.is_live(now) && document_id.map_or(true, |d| lock.document_id == d)
        }))
    }

    async fn extend(
        &self,
        block_id: &str,
        holder: &Actor,
        additional_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Lock>> {
        let Some(mut lock) = self.locks.get_mut(block_id) else {
            return Ok(None);
        };
        if &lock.locked_by != holder || !lock.is_live(now) {
            return Ok(None);
        }
        lock.expires_at += Duration::milliseconds(additional_ms.min(MAX_LOCK_TTL_MS) as i64);
        Ok(Some(lock.clone()))
    }
}
