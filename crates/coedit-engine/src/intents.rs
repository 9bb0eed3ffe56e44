//! Intent queue: priority-ordered claims on blocks
//!
//! Pipelines declare an intent to edit a block, then queue it. Each
//! (document, block) pair has its own queue ordered by score, descending:
//!
//! ```text
//! score = priority * 10 + affinity * 5 + min(age_ms / 10000, 5)
//! ```
//!
//! The score is fixed at queue time. A new entry goes in front of the first
//! entry with a strictly lower score, so equal scores keep arrival order.
//!
//! Intents live in one map keyed by id; queues hold ids only. When an entry
//! reaches the head of its queue the `GrantHandler` is asked to grant it
//! (normally by taking the block lock). Without a handler every head is
//! granted immediately.

use crate::events::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coedit_core::{
    CoordinationEvent, EditIntent, Error, IntentStatus, PipelineConfig, QueueEntry, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const AGE_BONUS_CAP: f64 = 5.0;

/// Decides whether the head of a block queue may proceed.
#[async_trait]
pub trait GrantHandler: Send + Sync {
    /// Called when an intent reaches the head of its queue.
    async fn try_grant(&self, intent: &EditIntent) -> bool;

    /// Called when a granted intent completes or is cancelled.
    async fn release(&self, _intent: &EditIntent) {}

    /// Whether a granted intent still holds what it was granted.
    async fn still_held(&self, _intent: &EditIntent) -> bool {
        true
    }
}

/// Queue score of `intent` if it were queued at `now`.
pub fn score(intent: &EditIntent, now: DateTime<Utc>) -> f64 {
    let age_ms = (now - intent.timestamp).num_milliseconds().max(0) as f64;
    f64::from(intent.priority) * 10.0
        + f64::from(intent.affinity_score) * 5.0
        + (age_ms / 10_000.0).min(AGE_BONUS_CAP)
}

type BlockKey = (String, String);

fn block_key(intent: &EditIntent) -> BlockKey {
    (intent.document_id.clone(), intent.block_id.clone())
}

#[derive(Default)]
struct QueueState {
    intents: HashMap<String, EditIntent>,
    queues: HashMap<BlockKey, Vec<QueueEntry>>,
}

impl QueueState {
    fn position(&self, intent: &EditIntent) -> Option<usize> {
        self.queues
            .get(&block_key(intent))?
            .iter()
            .position(|e| e.intent_id == intent.id)
    }

    fn dequeue(&mut self, intent: &EditIntent) {
        let key = block_key(intent);
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.retain(|e| e.intent_id != intent.id);
            if queue.is_empty() {
                self.queues.remove(&key);
            }
        }
    }

    fn status_of(&self, id: &str) -> Option<IntentStatus> {
        self.intents.get(id).map(|i| i.status)
    }
}

pub struct IntentQueue {
    pipelines: PipelineConfig,
    events: EventBus,
    grants: Option<Arc<dyn GrantHandler>>,
    state: Mutex<QueueState>,
}

impl IntentQueue {
    pub fn new(pipelines: PipelineConfig, events: EventBus) -> Self {
        Self {
            pipelines,
            events,
            grants: None,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn with_grant_handler(mut self, grants: Arc<dyn GrantHandler>) -> Self {
        self.grants = Some(grants);
        self
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Record a pending intent. Priority comes from the pipeline catalog,
    /// affinity from the section type's place in the pipeline's preferences.
    pub async fn declare_intent(
        &self,
        pipeline: &str,
        document_id: &str,
        section_id: &str,
        block_id: &str,
        section_type: Option<&str>,
    ) -> EditIntent {
        let intent = EditIntent {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_name: pipeline.to_string(),
            document_id: document_id.to_string(),
            section_id: section_id.to_string(),
            block_id: block_id.to_string(),
            priority: self.pipelines.priority_for(pipeline),
            affinity_score: self.pipelines.affinity_for(pipeline, section_type),
            timestamp: Utc::now(),
            status: IntentStatus::Pending,
        };

        self.state
            .lock()
            .await
            .intents
            .insert(intent.id.clone(), intent.clone());

        debug!(
            intent = %intent.id,
            pipeline,
            block = block_id,
            priority = intent.priority,
            affinity = intent.affinity_score,
            "intent declared"
        );
        self.events.publish(CoordinationEvent::IntentDeclared {
            intent: intent.clone(),
        });
        intent
    }

    /// Queue a pending intent and return its 0-based position.
    pub async fn queue_intent(&self, intent_id: &str) -> Result<usize> {
        self.queue_intent_at(intent_id, Utc::now()).await
    }

    /// `queue_intent` with an explicit clock, which fixes the age bonus.
    pub async fn queue_intent_at(&self, intent_id: &str, now: DateTime<Utc>) -> Result<usize> {
        let (intent, position) = {
            let mut state = self.state.lock().await;
            let intent = state
                .intents
                .get(intent_id)
                .cloned()
                .ok_or_else(|| Error::IntentNotFound(intent_id.to_string()))?;

            match intent.status {
                IntentStatus::Pending => {}
                IntentStatus::Queued | IntentStatus::Granted => {
                    return state
                        .position(&intent)
                        .ok_or_else(|| Error::Internal(format!("intent {} not in its queue", intent_id)));
                }
                status => {
                    return Err(Error::InvalidMessage(format!(
                        "intent {} is {} and cannot be queued",
                        intent_id, status
                    )));
                }
            }

            let entry = QueueEntry {
                intent_id: intent.id.clone(),
                score: score(&intent, now),
                queued_at: now,
            };
            let queue = state.queues.entry(block_key(&intent)).or_default();
            let position = queue
                .iter()
                .position(|e| e.score < entry.score)
                .unwrap_or(queue.len());
            queue.insert(position, entry);

            let Some(stored) = state.intents.get_mut(intent_id) else {
                return Err(Error::IntentNotFound(intent_id.to_string()));
            };
            stored.status = IntentStatus::Queued;
            (stored.clone(), position)
        };

        debug!(intent = %intent.id, block = %intent.block_id, position, "intent queued");
        self.events.publish(CoordinationEvent::IntentQueued {
            intent: intent.clone(),
            position,
        });

        if position == 0 {
            self.grant_head(&intent.document_id, &intent.block_id).await;
        }
        Ok(position)
    }

    /// Mark an intent completed and hand the block to the next in line.
    /// Completing an already finished intent is a no-op.
    pub async fn complete_intent(&self, intent_id: &str) -> Result<()> {
        let (intent, was_granted) = {
            let mut state = self.state.lock().await;
            let Some(stored) = state.intents.get_mut(intent_id) else {
                return Err(Error::IntentNotFound(intent_id.to_string()));
            };
            if stored.status.is_terminal() {
                return Ok(());
            }
            let was_granted = stored.status == IntentStatus::Granted;
            stored.status = IntentStatus::Completed;
            let intent = stored.clone();
            state.dequeue(&intent);
            (intent, was_granted)
        };

        if was_granted {
            if let Some(grants) = &self.grants {
                grants.release(&intent).await;
            }
        }
        debug!(intent = %intent.id, block = %intent.block_id, "intent completed");
        self.events.publish(CoordinationEvent::IntentCompleted {
            intent: intent.clone(),
        });

        self.grant_head(&intent.document_id, &intent.block_id).await;
        Ok(())
    }

    /// Cancel and forget an intent. Returns false if it was unknown or
    /// already finished, so repeated cancels are harmless.
    pub async fn cancel_intent(&self, intent_id: &str, reason: &str) -> bool {
        let (intent, was_granted) = {
            let mut state = self.state.lock().await;
            let Some(mut intent) = state.intents.remove(intent_id) else {
                return false;
            };
            if intent.status.is_terminal() {
                state.intents.insert(intent.id.clone(), intent);
                return false;
            }
            let was_granted = intent.status == IntentStatus::Granted;
            intent.status = IntentStatus::Cancelled;
            state.dequeue(&intent);
            (intent, was_granted)
        };

        if was_granted {
            if let Some(grants) = &self.grants {
                grants.release(&intent).await;
            }
        }
        debug!(intent = %intent.id, block = %intent.block_id, reason, "intent cancelled");
        self.events.publish(CoordinationEvent::IntentCancelled {
            intent: intent.clone(),
            reason: reason.to_string(),
        });

        self.grant_head(&intent.document_id, &intent.block_id).await;
        true
    }

    /// Cancel every unfinished intent a pipeline holds.
    pub async fn cancel_pipeline_intents(&self, pipeline: &str, reason: &str) -> usize {
        let ids = self
            .unfinished_ids(|intent| intent.pipeline_name == pipeline)
            .await;
        self.cancel_all(ids, reason).await
    }

    /// Cancel every unfinished intent on a document.
    pub async fn cancel_document_intents(&self, document_id: &str, reason: &str) -> usize {
        let ids = self
            .unfinished_ids(|intent| intent.document_id == document_id)
            .await;
        self.cancel_all(ids, reason).await
    }

    async fn unfinished_ids(&self, pred: impl Fn(&EditIntent) -> bool) -> Vec<String> {
        self.state
            .lock()
            .await
            .intents
            .values()
            .filter(|i| !i.status.is_terminal() && pred(i))
            .map(|i| i.id.clone())
            .collect()
    }

    async fn cancel_all(&self, ids: Vec<String>, reason: &str) -> usize {
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_intent(&id, reason).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drop completed intents declared longer than `max_age` ago.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let mut state = self.state.lock().await;
        let before = state.intents.len();
        state
            .intents
            .retain(|_, i| !(i.status.is_terminal() && i.timestamp < cutoff));
        let removed = before - state.intents.len();
        if removed > 0 {
            info!("Cleaned up {} finished intent(s)", removed);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Granting
    // -----------------------------------------------------------------------

    /// Offer the block to the head of its queue. Nothing happens while
    /// another entry of the same queue already holds a grant.
    async fn grant_head(&self, document_id: &str, block_id: &str) -> bool {
        let key: BlockKey = (document_id.to_string(), block_id.to_string());
        let candidate = {
            let state = self.state.lock().await;
            let Some(queue) = state.queues.get(&key) else {
                return false;
            };
            if queue
                .iter()
                .any(|e| state.status_of(&e.intent_id) == Some(IntentStatus::Granted))
            {
                return false;
            }
            let Some(head) = queue.first() else {
                return false;
            };
            match state.intents.get(&head.intent_id) {
                Some(intent) if intent.status == IntentStatus::Queued => intent.clone(),
                _ => return false,
            }
        };

        let granted = match &self.grants {
            Some(grants) => grants.try_grant(&candidate).await,
            None => true,
        };
        if !granted {
            debug!(intent = %candidate.id, block = block_id, "grant refused, intent stays queued");
            return false;
        }

        let outcome = {
            let mut state = self.state.lock().await;
            match state.intents.get_mut(&candidate.id) {
                Some(intent) if intent.status == IntentStatus::Queued => {
                    intent.status = IntentStatus::Granted;
                    Ok(intent.clone())
                }
                Some(intent) => Err(intent.status),
                None => Err(IntentStatus::Cancelled),
            }
        };

        match outcome {
            Ok(intent) => {
                info!(intent = %intent.id, pipeline = %intent.pipeline_name, block = block_id, "intent granted");
                self.events.publish(CoordinationEvent::IntentGranted { intent });
                true
            }
            Err(status) => {
                // Finished while the grant was in flight; give the block back.
                if status.is_terminal() {
                    if let Some(grants) = &self.grants {
                        grants.release(&candidate).await;
                    }
                }
                false
            }
        }
    }

    /// Offer `block_id` to the head of each of its queues again, e.g. after
    /// a lock the queue does not own went away. Returns how many were granted.
    pub async fn retry_block(&self, block_id: &str) -> usize {
        let keys: Vec<BlockKey> = self
            .state
            .lock()
            .await
            .queues
            .keys()
            .filter(|(_, block)| block == block_id)
            .cloned()
            .collect();
        let mut granted = 0;
        for (document_id, block_id) in keys {
            if self.grant_head(&document_id, &block_id).await {
                granted += 1;
            }
        }
        granted
    }

    /// Cancel granted intents on `block_id` that the grant handler reports
    /// as no longer held, handing the block to the next head. Returns how
    /// many were cancelled.
    pub async fn revoke_lost_grants(&self, block_id: &str) -> usize {
        let Some(grants) = &self.grants else {
            return 0;
        };
        // Candidates are taken before the holder is checked: a grant made
        // after this point is not a candidate.
        let granted: Vec<EditIntent> = self
            .state
            .lock()
            .await
            .intents
            .values()
            .filter(|i| i.block_id == block_id && i.status == IntentStatus::Granted)
            .cloned()
            .collect();

        let mut lost = Vec::new();
        for intent in granted {
            if !grants.still_held(&intent).await {
                lost.push(intent.id);
            }
        }
        if !lost.is_empty() {
            warn!(block = block_id, count = lost.len(), "granted intent lost its lock");
        }
        self.cancel_all(lost, "lock lost").await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// 0-based position in the block queue; `None` when not queued.
    pub async fn get_queue_position(&self, intent_id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        let intent = state.intents.get(intent_id)?;
        state.position(intent)
    }

    pub async fn get_intent(&self, intent_id: &str) -> Option<EditIntent> {
        self.state.lock().await.intents.get(intent_id).cloned()
    }

    /// All known intents on a document, oldest first.
    pub async fn get_document_intents(&self, document_id: &str) -> Vec<EditIntent> {
        let state = self.state.lock().await;
        let mut intents: Vec<_> = state
            .intents
            .values()
            .filter(|i| i.document_id == document_id)
            .cloned()
            .collect();
        intents.sort_by_key(|i| i.timestamp);
        intents
    }

    /// Queued and granted intents on a block, in queue order.
    pub async fn get_block_intents(&self, document_id: &str, block_id: &str) -> Vec<EditIntent> {
        let state = self.state.lock().await;
        let key: BlockKey = (document_id.to_string(), block_id.to_string());
        state
            .queues
            .get(&key)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|e| state.intents.get(&e.intent_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_block_queue(&self, document_id: &str, block_id: &str) -> Vec<QueueEntry> {
        let key: BlockKey = (document_id.to_string(), block_id.to_string());
        self.state
            .lock()
            .await
            .queues
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.intents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
