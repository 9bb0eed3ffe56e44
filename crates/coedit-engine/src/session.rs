//! Analysis session bookkeeping
//!
//! One `AnalysisSession` per running analysis: a cancellation token shared by
//! all of its pipeline tasks, plus a state slot and pause gate per pipeline.

use coedit_core::{Error, PipelineState, PipelineStatus, Result, SessionKey};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct PipelineSlot {
    state: PipelineState,
    pause_gate: Arc<Notify>,
}

pub struct AnalysisSession {
    pub key: SessionKey,
    pub document_id: String,
    cancel: CancellationToken,
    pipelines: DashMap<String, PipelineSlot>,
    order: Vec<String>,
}

impl AnalysisSession {
    fn new(key: SessionKey, document_id: &str, pipelines: &[String], max_turns: u32) -> Self {
        let slots = DashMap::new();
        for name in pipelines {
            slots.insert(
                name.clone(),
                PipelineSlot {
                    state: PipelineState::new(name, max_turns),
                    pause_gate: Arc::new(Notify::new()),
                },
            );
        }
        Self {
            key,
            document_id: document_id.to_string(),
            cancel: CancellationToken::new(),
            pipelines: slots,
            order: pipelines.to_vec(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Trip the session token. Paused pipelines wake and observe it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn has_pipeline(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<PipelineState> {
        self.pipelines.get(name).map(|slot| slot.state.clone())
    }

    /// States in classification order.
    pub fn states(&self) -> Vec<PipelineState> {
        self.order.iter().filter_map(|name| self.state(name)).collect()
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut PipelineState)) {
        if let Some(mut slot) = self.pipelines.get_mut(name) {
            f(&mut slot.state);
        }
    }

    pub fn set_status(&self, name: &str, status: PipelineStatus) {
        self.update(name, |state| state.status = status);
    }

    pub fn is_paused(&self, name: &str) -> bool {
        self.pipelines
            .get(name)
            .map(|slot| slot.state.status == PipelineStatus::Paused)
            .unwrap_or(false)
    }

    /// Pause takes effect at the pipeline's next turn boundary. Finished
    /// pipelines are left as they are.
    pub fn pause(&self, name: &str) -> Result<()> {
        let mut slot = self.slot_mut(name)?;
        if !slot.state.status.is_finished() {
            slot.state.status = PipelineStatus::Paused;
            debug!(session = %self.key, pipeline = name, "pipeline paused");
        }
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        let gate = {
            let mut slot = self.slot_mut(name)?;
            if slot.state.status != PipelineStatus::Paused {
                return Ok(());
            }
            slot.state.status = PipelineStatus::Running;
            debug!(session = %self.key, pipeline = name, "pipeline resumed");
            slot.pause_gate.clone()
        };
        gate.notify_one();
        Ok(())
    }

    /// Block while the pipeline is paused. Returns false if the session was
    /// cancelled instead.
    pub async fn wait_while_paused(&self, name: &str) -> bool {
        let Some(gate) = self.pipelines.get(name).map(|s| s.pause_gate.clone()) else {
            return !self.is_cancelled();
        };
        while self.is_paused(name) {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = gate.notified() => {}
            }
        }
        !self.is_cancelled()
    }

    fn slot_mut(
        &self,
        name: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, PipelineSlot>> {
        self.pipelines
            .get_mut(name)
            .ok_or_else(|| Error::pipeline_not_found(self.key.as_str(), name))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AnalysisRegistry {
    sessions: DashMap<SessionKey, Arc<AnalysisSession>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new analysis. Fails if the session already runs one.
    pub fn begin(
        &self,
        key: &SessionKey,
        document_id: &str,
        pipelines: &[String],
        max_turns: u32,
    ) -> Result<Arc<AnalysisSession>> {
        match self.sessions.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::SessionBusy(key.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let session = Arc::new(AnalysisSession::new(
                    key.clone(),
                    document_id,
                    pipelines,
                    max_turns,
                ));
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<AnalysisSession>> {
        self.sessions.get(key).map(|s| s.clone())
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<AnalysisSession>> {
        self.sessions.remove(key).map(|(_, s)| s)
    }

    /// Remove `session` only if it is still the one registered under its key.
    pub fn finish(&self, session: &Arc<AnalysisSession>) {
        self.sessions
            .remove_if(&session.key, |_, current| Arc::ptr_eq(current, session));
    }

    pub fn list(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn begin_rejects_a_second_analysis() {
        let registry = AnalysisRegistry::new();
        let key = SessionKey::new("s1");
        registry.begin(&key, "doc", &names(&["tableau"]), 6).unwrap();
        let err = registry.begin(&key, "doc", &names(&["tableau"]), 6).err().unwrap();
        assert!(matches!(err, Error::SessionBusy(_)));
    }

    #[test]
    fn finish_leaves_a_newer_session_alone() {
        let registry = AnalysisRegistry::new();
        let key = SessionKey::new("s1");
        let old = registry.begin(&key, "doc", &names(&["tableau"]), 6).unwrap();
        registry.remove(&key);
        let new = registry.begin(&key, "doc", &names(&["tableau"]), 6).unwrap();

        registry.finish(&old);
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &new));
        registry.finish(&new);
        assert!(registry.is_empty());
    }

    #[test]
    fn pause_does_not_touch_finished_pipelines() {
        let registry = AnalysisRegistry::new();
        let session = registry
            .begin(&SessionKey::new("s1"), "doc", &names(&["tableau"]), 6)
            .unwrap();
        session.set_status("tableau", PipelineStatus::Complete);
        session.pause("tableau").unwrap();
        assert_eq!(session.state("tableau").unwrap().status, PipelineStatus::Complete);
        assert!(session.pause("nope").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cancel_wakes_a_paused_waiter() {
        let registry = AnalysisRegistry::new();
        let session = registry
            .begin(&SessionKey::new("s1"), "doc", &names(&["tableau"]), 6)
            .unwrap();
        session.pause("tableau").unwrap();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_while_paused("tableau").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        session.cancel();
        let proceed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!proceed);
    }
}
