//! Block lock manager: lease-based exclusive locks with a watchdog
//!
//! Every requested block is handled independently: a multi-block acquire can
//! come back partially granted. Mutual exclusion is delegated to the store's
//! atomic `insert_if_absent`; the manager never does check-then-write.
//!
//! Whoever deletes an expired lock (the watchdog, or an acquire pruning before
//! it inserts) publishes its `lock:expired`, so each expiry is reported once.

use crate::events::EventBus;
use crate::store::{InsertOutcome, LockStore};
use chrono::{DateTime, Utc};
use coedit_core::{
    AcquireOutcome, Actor, CoordinationEvent, DeniedBlock, Lock, LockConfig, LockStats,
    LockStatus, LockType, Result, SessionKey,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one watchdog pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub warned: usize,
}

struct Watchdog {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    events: EventBus,
    config: LockConfig,
    watchdog: Mutex<Option<Watchdog>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, events: EventBus, config: LockConfig) -> Self {
        Self {
            store,
            events,
            config,
            watchdog: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Acquire / release
    // -----------------------------------------------------------------------

    /// Try to lock each block for `requested_by`. Held blocks are denied with
    /// their holder; a storage failure denies the block without a holder.
    pub async fn acquire_locks(
        &self,
        block_ids: &[String],
        document_id: &str,
        session: &SessionKey,
        requested_by: &Actor,
        ttl_ms: Option<u64>,
    ) -> AcquireOutcome {
        let ttl_ms = ttl_ms.unwrap_or(self.config.default_ttl_ms);
        let mut outcome = AcquireOutcome::default();

        if let Err(e) = self.prune_expired(None).await {
            warn!("Expired-lock prune failed before acquire: {}", e);
        }

        for block_id in block_ids {
            match self
                .acquire_one(block_id, document_id, session, requested_by, ttl_ms)
                .await
            {
                Ok(Ok(lock)) => {
                    debug!(block = %block_id, holder = %requested_by, "lock acquired");
                    self.events.publish(CoordinationEvent::LockAcquired { lock: lock.clone() });
                    outcome.granted.push(lock);
                }
                Ok(Err(held_by)) => {
                    debug!(block = %block_id, holder = ?held_by, "lock denied");
                    outcome.denied.push(DeniedBlock {
                        block_id: block_id.clone(),
                        held_by,
                    });
                }
                Err(e) => {
                    warn!(block = %block_id, "Lock acquire failed: {}", e);
                    outcome.denied.push(DeniedBlock {
                        block_id: block_id.clone(),
                        held_by: None,
                    });
                }
            }
        }

        outcome
    }

    /// `Ok(Ok(lock))` when granted, `Ok(Err(holder))` when someone else has it.
    async fn acquire_one(
        &self,
        block_id: &str,
        document_id: &str,
        session: &SessionKey,
        requested_by: &Actor,
        ttl_ms: u64,
    ) -> Result<std::result::Result<Lock, Option<Actor>>> {
        let now = Utc::now();
        if let Some(existing) = self.store.get(block_id).await? {
            if existing.is_live(now) {
                return Ok(Err(Some(existing.locked_by)));
            }
            if let Some(expired) = self.store.delete_if_expired(block_id, now).await? {
                self.publish_expired(expired);
            }
        }

        let lock = Lock::new(
            block_id,
            document_id,
            session.clone(),
            requested_by.clone(),
            now,
            ttl_ms,
        );
        match self.store.insert_if_absent(lock.clone()).await? {
            InsertOutcome::Inserted => Ok(Ok(lock)),
            InsertOutcome::Conflict => {
                let holder = self.store.get(block_id).await?.map(|l| l.locked_by);
                Ok(Err(holder))
            }
        }
    }

    /// Release the listed blocks that `locked_by` holds. Returns the ids
    /// actually released.
    pub async fn release_locks(
        &self,
        block_ids: &[String],
        locked_by: &Actor,
    ) -> Result<Vec<String>> {
        let mut released = Vec::new();
        for block_id in block_ids {
            if let Some(lock) = self.store.delete_held(block_id, locked_by).await? {
                self.events.publish(CoordinationEvent::LockReleased {
                    block_id: lock.block_id.clone(),
                    locked_by: Some(lock.locked_by),
                });
                released.push(lock.block_id);
            }
        }
        Ok(released)
    }

    /// Drop every lock the session holds, e.g. on disconnect.
    pub async fn release_session_locks(&self, session: &SessionKey) -> Result<Vec<Lock>> {
        let released = self.store.delete_session(session).await?;
        for lock in &released {
            self.events.publish(CoordinationEvent::LockReleased {
                block_id: lock.block_id.clone(),
                locked_by: Some(lock.locked_by.clone()),
            });
        }
        if !released.is_empty() {
            info!("Released {} lock(s) held by session {}", released.len(), session);
        }
        Ok(released)
    }

    /// Extend live locks that `locked_by` holds. `acquired_at` is unchanged.
    pub async fn extend_locks(
        &self,
        block_ids: &[String],
        locked_by: &Actor,
        additional_ms: u64,
    ) -> Result<Vec<Lock>> {
        let now = Utc::now();
        let mut extended = Vec::new();
        for block_id in block_ids {
            if let Some(lock) = self
                .store
                .extend(block_id, locked_by, additional_ms, now)
                .await?
            {
                extended.push(lock);
            }
        }
        Ok(extended)
    }

    /// Release a lock whoever holds it (admin override). `lock:released` is
    /// published even when the block was not locked.
    pub async fn force_release_lock(&self, block_id: &str) -> Result<Option<Lock>> {
        let removed = self.store.delete(block_id).await?;
        if let Some(lock) = &removed {
            warn!(block = %block_id, holder = %lock.locked_by, "Lock force-released");
        }
        self.events.publish(CoordinationEvent::LockReleased {
            block_id: block_id.to_string(),
            locked_by: removed.as_ref().map(|l| l.locked_by.clone()),
        });
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn is_block_locked(&self, block_id: &str) -> Result<LockStatus> {
        let now = Utc::now();
        Ok(match self.store.get(block_id).await? {
            Some(lock) if lock.is_live(now) => LockStatus {
                locked: true,
                locked_by: Some(lock.locked_by),
            },
            _ => LockStatus {
                locked: false,
                locked_by: None,
            },
        })
    }

    /// Live locks on one document, after pruning that document's expired ones.
    pub async fn get_document_locks(&self, document_id: &str) -> Result<Vec<Lock>> {
        self.prune_expired(Some(document_id)).await?;
        self.store.list_document(document_id).await
    }

    pub async fn get_lock_stats(&self) -> Result<LockStats> {
        let now = Utc::now();
        let threshold = self.config.warning_threshold_ms as i64;
        let mut stats = LockStats::default();
        for lock in self.store.list().await?.into_iter().filter(|l| l.is_live(now)) {
            stats.total += 1;
            match lock.lock_type {
                LockType::Human => stats.human_held += 1,
                LockType::Agent => stats.agent_held += 1,
            }
            if lock.remaining_ms(now) < threshold {
                stats.expiring_soon += 1;
            }
            *stats.by_document.entry(lock.document_id).or_insert(0) += 1;
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    async fn prune_expired(&self, document_id: Option<&str>) -> Result<usize> {
        let expired = self.store.delete_expired(Utc::now(), document_id).await?;
        let count = expired.len();
        for lock in expired {
            self.publish_expired(lock);
        }
        Ok(count)
    }

    fn publish_expired(&self, lock: Lock) {
        info!(block = %lock.block_id, holder = %lock.locked_by, "Lock expired");
        self.events.publish(CoordinationEvent::LockExpired { lock });
    }

    /// One watchdog pass: delete and report expired locks, warn on locks
    /// about to expire.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        sweep(
            self.store.as_ref(),
            &self.events,
            self.config.warning_threshold_ms,
            Utc::now(),
        )
        .await
    }

    /// Start the periodic watchdog. Returns false if it is already running.
    pub fn start_watchdog(&self, interval: Duration) -> bool {
        let mut slot = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let store = self.store.clone();
        let events = self.events.clone();
        let warning_ms = self.config.warning_threshold_ms;
        let token = cancel.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweep(store.as_ref(), &events, warning_ms, Utc::now()).await {
                            warn!("Lock watchdog sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Lock watchdog stopped");
        });

        info!("Lock watchdog started ({}ms interval)", interval.as_millis());
        *slot = Some(Watchdog { cancel, handle });
        true
    }

    /// Stop the watchdog and wait for its task to exit.
    pub async fn stop_watchdog(&self) {
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Watchdog { cancel, handle }) = watchdog {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    pub fn watchdog_running(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }
}

async fn sweep(
    store: &dyn LockStore,
    events: &EventBus,
    warning_threshold_ms: u64,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let threshold = warning_threshold_ms as i64;

    for lock in store.list().await? {
        let remaining = lock.remaining_ms(now);
        if remaining <= 0 {
            // Only the deleter reports, so a concurrent prune can't double up.
            if let Some(expired) = store.delete_if_expired(&lock.block_id, now).await? {
                info!(block = %expired.block_id, holder = %expired.locked_by, "Lock expired");
                events.publish(CoordinationEvent::LockExpired { lock: expired });
                report.expired += 1;
            }
        } else if remaining < threshold {
            events.publish(CoordinationEvent::LockTimeoutWarning {
                lock,
                ms_remaining: remaining,
            });
            report.warned += 1;
        }
    }

    Ok(report)
}
