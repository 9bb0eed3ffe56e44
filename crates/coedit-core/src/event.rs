//! Typed events emitted by the coordinator
//!
//! `CoordinationEvent` covers lock and intent lifecycle and is fanned out to
//! every subscriber. `AnalysisEvent` is the per-session stream produced by a
//! running analysis. Both serialize with a `type` tag carrying the wire name,
//! so a gateway can forward them 1:1.

use crate::model::{EditIntent, Lock};
use crate::types::{Actor, SessionKey};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Lock + intent lifecycle
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinationEvent {
    #[serde(rename = "lock:acquired")]
    LockAcquired { lock: Lock },

    #[serde(rename = "lock:released", rename_all = "camelCase")]
    LockReleased {
        block_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        locked_by: Option<Actor>,
    },

    #[serde(rename = "lock:expired")]
    LockExpired { lock: Lock },

    #[serde(rename = "lock:timeout_warning", rename_all = "camelCase")]
    LockTimeoutWarning { lock: Lock, ms_remaining: i64 },

    #[serde(rename = "intent:declared")]
    IntentDeclared { intent: EditIntent },

    #[serde(rename = "intent:queued")]
    IntentQueued { intent: EditIntent, position: usize },

    #[serde(rename = "intent:granted")]
    IntentGranted { intent: EditIntent },

    #[serde(rename = "intent:completed")]
    IntentCompleted { intent: EditIntent },

    #[serde(rename = "intent:cancelled")]
    IntentCancelled { intent: EditIntent, reason: String },
}

impl CoordinationEvent {
    /// Wire name of the event, e.g. `lock:expired`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LockAcquired { .. } => "lock:acquired",
            Self::LockReleased { .. } => "lock:released",
            Self::LockExpired { .. } => "lock:expired",
            Self::LockTimeoutWarning { .. } => "lock:timeout_warning",
            Self::IntentDeclared { .. } => "intent:declared",
            Self::IntentQueued { .. } => "intent:queued",
            Self::IntentGranted { .. } => "intent:granted",
            Self::IntentCompleted { .. } => "intent:completed",
            Self::IntentCancelled { .. } => "intent:cancelled",
        }
    }

    /// Block the event is about.
    pub fn block_id(&self) -> &str {
        match self {
            Self::LockAcquired { lock }
            | Self::LockExpired { lock }
            | Self::LockTimeoutWarning { lock, .. } => &lock.block_id,
            Self::LockReleased { block_id, .. } => block_id,
            Self::IntentDeclared { intent }
            | Self::IntentQueued { intent, .. }
            | Self::IntentGranted { intent }
            | Self::IntentCompleted { intent }
            | Self::IntentCancelled { intent, .. } => &intent.block_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis stream
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisEvent {
    AnalysisStarted {
        session: SessionKey,
        document_id: String,
        pipelines: Vec<String>,
    },
    Progress {
        session: SessionKey,
        pipeline: String,
        turn: u32,
        max_turns: u32,
    },
    Content {
        session: SessionKey,
        pipeline: String,
        turn: u32,
        content: String,
    },
    Complete {
        session: SessionKey,
        pipeline: String,
        result: String,
    },
    Error {
        session: SessionKey,
        pipeline: String,
        message: String,
    },
    AnalysisComplete {
        session: SessionKey,
        document_id: String,
    },
}

impl AnalysisEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AnalysisStarted { .. } => "analysis_started",
            Self::Progress { .. } => "progress",
            Self::Content { .. } => "content",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::AnalysisComplete { .. } => "analysis_complete",
        }
    }

    pub fn session(&self) -> &SessionKey {
        match self {
            Self::AnalysisStarted { session, .. }
            | Self::Progress { session, .. }
            | Self::Content { session, .. }
            | Self::Complete { session, .. }
            | Self::Error { session, .. }
            | Self::AnalysisComplete { session, .. } => session,
        }
    }

    /// Pipeline the event belongs to; `None` for session-level events.
    pub fn pipeline(&self) -> Option<&str> {
        match self {
            Self::Progress { pipeline, .. }
            | Self::Content { pipeline, .. }
            | Self::Complete { pipeline, .. }
            | Self::Error { pipeline, .. } => Some(pipeline),
            Self::AnalysisStarted { .. } | Self::AnalysisComplete { .. } => None,
        }
    }
}
