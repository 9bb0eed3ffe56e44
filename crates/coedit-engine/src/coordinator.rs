//! Coordinator: owns the lock manager, intent queue and pipeline coordinator
//!
//! Built once from a `CoordinatorConfig` and shared behind an `Arc`. Intents
//! are granted by taking the block lock on behalf of the pipeline. While
//! started, a grant pump watches lock releases and expiries: a granted intent
//! whose lock went away is cancelled, and the block is re-offered to its
//! queue. A janitor drops old finished intents on a fixed interval.

use crate::events::EventBus;
use crate::intents::{GrantHandler, IntentQueue};
use crate::locks::LockManager;
use crate::pipeline::PipelineCoordinator;
use crate::sqlite::SqliteLockStore;
use crate::store::{LockStore, MemoryLockStore};
use async_trait::async_trait;
use coedit_core::{
    CoordinationEvent, CoordinatorConfig, EditIntent, Result, SessionKey, StorageBackend,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grants an intent by locking its block for the intent's pipeline.
pub struct LockGrants {
    locks: Arc<LockManager>,
    session: SessionKey,
    ttl_ms: u64,
}

impl LockGrants {
    pub fn new(locks: Arc<LockManager>, session: SessionKey, ttl_ms: u64) -> Self {
        Self {
            locks,
            session,
            ttl_ms,
        }
    }
}

#[async_trait]
impl GrantHandler for LockGrants {
    async fn try_grant(&self, intent: &EditIntent) -> bool {
        self.locks
            .acquire_locks(
                std::slice::from_ref(&intent.block_id),
                &intent.document_id,
                &self.session,
                &intent.actor(),
                Some(self.ttl_ms),
            )
            .await
            .all_granted()
    }

    async fn release(&self, intent: &EditIntent) {
        if let Err(e) = self
            .locks
            .release_locks(std::slice::from_ref(&intent.block_id), &intent.actor())
            .await
        {
            warn!(intent = %intent.id, "Failed to release granted lock: {}", e);
        }
    }

    async fn still_held(&self, intent: &EditIntent) -> bool {
        match self.locks.is_block_locked(&intent.block_id).await {
            Ok(status) => status.locked_by == Some(intent.actor()),
            Err(e) => {
                warn!(intent = %intent.id, "Failed to read granted lock: {}", e);
                true
            }
        }
    }
}

/// What a closed connection left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    pub locks_released: usize,
    pub analysis_cancelled: bool,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    events: EventBus,
    locks: Arc<LockManager>,
    intents: Arc<IntentQueue>,
    pipelines: Arc<PipelineCoordinator>,
    background: Mutex<Option<Background>>,
}

/// Grant pump and intent janitor, stopped together.
struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Build with the storage backend named in the config.
    pub async fn from_config(config: CoordinatorConfig) -> Result<Self> {
        let store: Arc<dyn LockStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryLockStore::new()),
            StorageBackend::Sqlite => match &config.storage.path {
                Some(path) => Arc::new(SqliteLockStore::open(path).await?),
                None => Arc::new(SqliteLockStore::in_memory().await?),
            },
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: CoordinatorConfig, store: Arc<dyn LockStore>) -> Self {
        let events = EventBus::default();
        let locks = Arc::new(LockManager::new(store, events.clone(), config.locks.clone()));
        let grants = Arc::new(LockGrants::new(
            locks.clone(),
            SessionKey::new(config.intents.grant_session.clone()),
            config.intents.grant_ttl_ms,
        ));
        let intents = Arc::new(
            IntentQueue::new(config.pipelines.clone(), events.clone()).with_grant_handler(grants),
        );
        let pipelines = Arc::new(PipelineCoordinator::new(config.pipelines.clone()));
        Self {
            config,
            events,
            locks,
            intents,
            pipelines,
            background: Mutex::new(None),
        }
    }

    /// Swap the turn executor (e.g. a real model backend or a test double).
    pub fn with_pipelines(mut self, pipelines: PipelineCoordinator) -> Self {
        self.pipelines = Arc::new(pipelines);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn intents(&self) -> &Arc<IntentQueue> {
        &self.intents
    }

    pub fn pipelines(&self) -> &Arc<PipelineCoordinator> {
        &self.pipelines
    }

    /// Start background work: the lock watchdog, the grant pump and the
    /// intent janitor. Calling it again while running is a no-op.
    pub fn start(&self) {
        self.locks
            .start_watchdog(Duration::from_millis(self.config.locks.watchdog_interval_ms));

        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if background
            .as_ref()
            .is_some_and(|b| b.handles.iter().any(|h| !h.is_finished()))
        {
            return;
        }
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(grant_pump(
            self.events.subscribe(),
            self.intents.clone(),
            cancel.clone(),
        ));
        let janitor = tokio::spawn(intent_janitor(
            self.intents.clone(),
            Duration::from_millis(self.config.intents.cleanup_interval_ms),
            Duration::from_millis(self.config.intents.cleanup_max_age_ms),
            cancel.clone(),
        ));
        *background = Some(Background {
            cancel,
            handles: vec![pump, janitor],
        });
    }

    /// Cancel running analyses, then stop the watchdog, the grant pump and
    /// the janitor.
    pub async fn shutdown(&self) {
        let cancelled = self.pipelines.cancel_all();
        self.locks.stop_watchdog().await;
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Background { cancel, handles }) = background {
            cancel.cancel();
            for handle in handles {
                let _ = handle.await;
            }
        }
        info!("Coordinator shut down ({} analysis session(s) cancelled)", cancelled);
    }

    /// Clean up after a closed connection: its locks go, its analysis stops.
    pub async fn disconnect_session(&self, session: &SessionKey) -> Result<DisconnectReport> {
        let analysis_cancelled = self.pipelines.cancel_session(session);
        let released = self.locks.release_session_locks(session).await?;
        Ok(DisconnectReport {
            locks_released: released.len(),
            analysis_cancelled,
        })
    }

    /// Drop finished intents older than the configured age.
    pub async fn cleanup_intents(&self) -> usize {
        self.intents
            .cleanup(Duration::from_millis(self.config.intents.cleanup_max_age_ms))
            .await
    }
}

async fn grant_pump(
    mut rx: tokio::sync::broadcast::Receiver<CoordinationEvent>,
    intents: Arc<IntentQueue>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let block_id = match event {
            Ok(CoordinationEvent::LockReleased { block_id, .. }) => block_id,
            Ok(CoordinationEvent::LockExpired { lock }) => lock.block_id,
            Ok(_) => continue,
            Err(RecvError::Lagged(n)) => {
                warn!("Grant pump lagged by {} events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        intents.revoke_lost_grants(&block_id).await;
        intents.retry_block(&block_id).await;
    }
    debug!("Grant pump stopped");
}

async fn intent_janitor(
    intents: Arc<IntentQueue>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                intents.cleanup(max_age).await;
            }
        }
    }
    debug!("Intent janitor stopped");
}
