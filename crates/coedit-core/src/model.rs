//! Data model shared by the lock manager, intent queue and pipeline coordinator

use crate::types::{Actor, LockType, SessionKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Upper bound on a single lease (one day).
pub const MAX_LOCK_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// A time-bounded exclusive claim on one block. At most one exists per block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub block_id: String,
    pub document_id: String,
    pub session_id: SessionKey,
    pub locked_by: Actor,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_type: LockType,
}

impl Lock {
    /// Build a lock that starts at `now` and lives for `ttl_ms`, clamped to
    /// `1..=MAX_LOCK_TTL_MS` so `expires_at` is strictly after `acquired_at`.
    pub fn new(
        block_id: impl Into<String>,
        document_id: impl Into<String>,
        session_id: SessionKey,
        locked_by: Actor,
        now: DateTime<Utc>,
        ttl_ms: u64,
    ) -> Self {
        let ttl = Duration::milliseconds(ttl_ms.clamp(1, MAX_LOCK_TTL_MS) as i64);
        let lock_type = locked_by.lock_type();
        Self {
            block_id: block_id.into(),
            document_id: document_id.into(),
            session_id,
            locked_by,
            acquired_at: now,
            expires_at: now + ttl,
            lock_type,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Milliseconds until expiry; zero or negative once expired.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_milliseconds()
    }
}

/// A block that could not be locked, with its current holder when known.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedBlock {
    pub block_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_by: Option<Actor>,
}

/// Mixed result of a multi-block acquire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireOutcome {
    pub granted: Vec<Lock>,
    pub denied: Vec<DeniedBlock>,
}

impl AcquireOutcome {
    pub fn all_granted(&self) -> bool {
        self.denied.is_empty()
    }

    pub fn is_granted(&self, block_id: &str) -> bool {
        self.granted.iter().any(|l| l.block_id == block_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<Actor>,
}

/// Aggregate view over live locks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStats {
    pub total: usize,
    pub human_held: usize,
    pub agent_held: usize,
    pub expiring_soon: usize,
    pub by_document: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Queued,
    Granted,
    Completed,
    Cancelled,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Granted => write!(f, "granted"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A pipeline's declared wish to edit one block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditIntent {
    pub id: String,
    pub pipeline_name: String,
    pub document_id: String,
    pub section_id: String,
    pub block_id: String,
    pub priority: u32,
    pub affinity_score: u32,
    pub timestamp: DateTime<Utc>,
    pub status: IntentStatus,
}

impl EditIntent {
    pub fn actor(&self) -> Actor {
        Actor::pipeline(&self.pipeline_name)
    }
}

/// One slot in a block's queue. References its intent by id only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub intent_id: String,
    pub score: f64,
    pub queued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Error,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub name: String,
    pub status: PipelineStatus,
    pub current_turn: u32,
    pub max_turns: u32,
    pub allocated_blocks: Vec<String>,
}

impl PipelineState {
    pub fn new(name: impl Into<String>, max_turns: u32) -> Self {
        Self {
            name: name.into(),
            status: PipelineStatus::Pending,
            current_turn: 0,
            max_turns,
            allocated_blocks: Vec::new(),
        }
    }
}

/// Control actions accepted by the pipeline coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
    Redirect {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::Cancel => write!(f, "cancel"),
            Self::Redirect { .. } => write!(f, "redirect"),
        }
    }
}
