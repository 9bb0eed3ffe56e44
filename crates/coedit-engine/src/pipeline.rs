//! Pipeline coordinator: concurrent analysis with cooperative control
//!
//! An analysis classifies the query into pipelines and runs each as its own
//! task. Every task checks the session's cancellation token and its pause
//! gate at each turn boundary; a turn in flight is never interrupted. A
//! failing (or panicking) pipeline reports an `error` event and leaves its
//! siblings running.

use crate::session::{AnalysisRegistry, AnalysisSession};
use async_trait::async_trait;
use coedit_core::{
    AnalysisEvent, ControlAction, Error, PipelineConfig, PipelineState, PipelineStatus, Result,
    SessionKey,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Inputs to one pipeline turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session: SessionKey,
    pub document_id: String,
    pub pipeline: String,
    pub query: String,
    pub turn: u32,
    pub max_turns: u32,
}

/// Does the work of a single pipeline turn.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn run_turn(&self, ctx: &TurnContext) -> Result<String>;

    /// Final result reported in the pipeline's `complete` event.
    fn summarize(&self, ctx: &TurnContext, outputs: &[String]) -> String {
        format!(
            "{} finished {} turn(s) on {}: {}",
            ctx.pipeline,
            outputs.len(),
            ctx.document_id,
            outputs.last().map(String::as_str).unwrap_or("no output")
        )
    }
}

/// Stand-in executor that sleeps for a fixed delay and describes the turn.
pub struct SimulatedTurns {
    delay: Duration,
}

impl SimulatedTurns {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TurnExecutor for SimulatedTurns {
    async fn run_turn(&self, ctx: &TurnContext) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok(format!(
            "[{}] turn {}/{}: reviewed {} for \"{}\"",
            ctx.pipeline, ctx.turn, ctx.max_turns, ctx.document_id, ctx.query
        ))
    }
}

/// Final per-pipeline states of a finished analysis.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub session: SessionKey,
    pub document_id: String,
    pub pipelines: Vec<PipelineState>,
}

impl AnalysisReport {
    pub fn status_of(&self, pipeline: &str) -> Option<PipelineStatus> {
        self.pipelines
            .iter()
            .find(|p| p.name == pipeline)
            .map(|p| p.status)
    }
}

/// An analysis registered for its session whose pipelines have not started.
pub struct PreparedAnalysis {
    analysis: Arc<AnalysisSession>,
    pipelines: Vec<String>,
    query: String,
}

impl PreparedAnalysis {
    pub fn session(&self) -> &SessionKey {
        &self.analysis.key
    }

    /// Selected pipelines, in catalog order.
    pub fn pipelines(&self) -> &[String] {
        &self.pipelines
    }
}

pub struct PipelineCoordinator {
    config: PipelineConfig,
    executor: Arc<dyn TurnExecutor>,
    sessions: AnalysisRegistry,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig) -> Self {
        let executor = Arc::new(SimulatedTurns::new(Duration::from_millis(config.turn_delay_ms)));
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: PipelineConfig, executor: Arc<dyn TurnExecutor>) -> Self {
        Self {
            config,
            executor,
            sessions: AnalysisRegistry::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pipelines whose keywords appear in the query, in catalog order.
    /// Falls back to the configured default when nothing matches.
    pub fn classify(&self, query: &str) -> Vec<String> {
        let query = query.to_lowercase();
        let selected: Vec<String> = self
            .config
            .catalog
            .iter()
            .filter(|p| p.keywords.iter().any(|k| query.contains(&k.to_lowercase())))
            .map(|p| p.name.clone())
            .collect();
        if selected.is_empty() {
            vec![self.config.fallback.clone()]
        } else {
            selected
        }
    }

    /// Register an analysis for `session` without starting it, so a busy
    /// session is refused before anything runs.
    pub fn begin_analysis(
        &self,
        session: &SessionKey,
        document_id: &str,
        query: &str,
    ) -> Result<PreparedAnalysis> {
        let pipelines = self.classify(query);
        let analysis =
            self.sessions
                .begin(session, document_id, &pipelines, self.config.max_turns)?;
        info!(
            "Analysis started: session={} document={} pipelines={:?}",
            session, document_id, pipelines
        );
        Ok(PreparedAnalysis {
            analysis,
            pipelines,
            query: query.to_string(),
        })
    }

    /// Run every pipeline of a registered analysis concurrently and stream
    /// progress to `events`. Resolves once all pipelines have settled.
    pub async fn run_analysis(
        &self,
        prepared: PreparedAnalysis,
        events: mpsc::Sender<AnalysisEvent>,
    ) -> AnalysisReport {
        let PreparedAnalysis {
            analysis,
            pipelines,
            query,
        } = prepared;
        let session = analysis.key.clone();
        let document_id = analysis.document_id.clone();

        let _ = events
            .send(AnalysisEvent::AnalysisStarted {
                session: session.clone(),
                document_id: document_id.clone(),
                pipelines: pipelines.clone(),
            })
            .await;

        let tasks = pipelines.iter().map(|name| {
            let run = PipelineRun {
                session: analysis.clone(),
                executor: self.executor.clone(),
                events: events.clone(),
                name: name.clone(),
                query: query.clone(),
                max_turns: self.config.max_turns,
                content_every: self.config.content_every,
            };
            let handle = tokio::spawn(run.run());
            let name = name.clone();
            async move { (name, handle.await) }
        });

        for (name, joined) in join_all(tasks).await {
            if let Err(e) = joined {
                error!("Pipeline {} task failed: {}", name, e);
                analysis.set_status(&name, PipelineStatus::Error);
                let _ = events
                    .send(AnalysisEvent::Error {
                        session: session.clone(),
                        pipeline: name,
                        message: format!("pipeline task failed: {}", e),
                    })
                    .await;
            }
        }

        let report = AnalysisReport {
            session: session.clone(),
            document_id: document_id.clone(),
            pipelines: analysis.states(),
        };
        self.sessions.finish(&analysis);

        let _ = events
            .send(AnalysisEvent::AnalysisComplete {
                session: session.clone(),
                document_id,
            })
            .await;
        info!("Analysis complete: session={}", session);
        report
    }

    /// `begin_analysis` followed by `run_analysis`.
    pub async fn execute_analysis(
        &self,
        session: &SessionKey,
        document_id: &str,
        query: &str,
        events: mpsc::Sender<AnalysisEvent>,
    ) -> Result<AnalysisReport> {
        let prepared = self.begin_analysis(session, document_id, query)?;
        Ok(self.run_analysis(prepared, events).await)
    }

    /// Pause, resume or cancel a running pipeline. Cancel applies to the
    /// whole session.
    pub fn control_pipeline(
        &self,
        session: &SessionKey,
        pipeline: &str,
        action: &ControlAction,
    ) -> Result<()> {
        let analysis = self
            .sessions
            .get(session)
            .ok_or_else(|| Error::SessionNotFound(session.to_string()))?;
        if !analysis.has_pipeline(pipeline) {
            return Err(Error::pipeline_not_found(session.as_str(), pipeline));
        }

        debug!(session = %session, pipeline, action = %action, "pipeline control");
        match action {
            ControlAction::Pause => analysis.pause(pipeline),
            ControlAction::Resume => analysis.resume(pipeline),
            ControlAction::Cancel => {
                analysis.cancel();
                Ok(())
            }
            ControlAction::Redirect { .. } => Err(Error::Unsupported(
                "redirect is not supported for running pipelines".into(),
            )),
        }
    }

    /// Cancel a session's analysis and forget it. Returns false if none ran.
    pub fn cancel_session(&self, session: &SessionKey) -> bool {
        match self.sessions.remove(session) {
            Some(analysis) => {
                analysis.cancel();
                info!("Analysis cancelled: session={}", session);
                true
            }
            None => false,
        }
    }

    pub fn pipeline_states(&self, session: &SessionKey) -> Option<Vec<PipelineState>> {
        self.sessions.get(session).map(|a| a.states())
    }

    pub fn active_sessions(&self) -> Vec<SessionKey> {
        self.sessions.list()
    }

    /// Cancel every running analysis.
    pub fn cancel_all(&self) -> usize {
        let keys = self.sessions.list();
        keys.iter().filter(|k| self.cancel_session(k)).count()
    }
}

// ---------------------------------------------------------------------------
// Pipeline task
// ---------------------------------------------------------------------------

struct PipelineRun {
    session: Arc<AnalysisSession>,
    executor: Arc<dyn TurnExecutor>,
    events: mpsc::Sender<AnalysisEvent>,
    name: String,
    query: String,
    max_turns: u32,
    content_every: u32,
}

impl PipelineRun {
    async fn run(self) {
        if let Err(e) = self.turns().await {
            warn!("Pipeline {} failed: {}", self.name, e);
            self.session.set_status(&self.name, PipelineStatus::Error);
            let _ = self
                .events
                .send(AnalysisEvent::Error {
                    session: self.session.key.clone(),
                    pipeline: self.name.clone(),
                    message: e.to_string(),
                })
                .await;
        }
    }

    async fn turns(&self) -> Result<()> {
        let name = self.name.as_str();
        self.session.update(name, |state| {
            if state.status == PipelineStatus::Pending {
                state.status = PipelineStatus::Running;
            }
        });

        let mut ctx = TurnContext {
            session: self.session.key.clone(),
            document_id: self.session.document_id.clone(),
            pipeline: self.name.clone(),
            query: self.query.clone(),
            turn: 0,
            max_turns: self.max_turns,
        };
        let mut outputs = Vec::with_capacity(self.max_turns as usize);

        for turn in 1..=self.max_turns {
            if !self.session.wait_while_paused(name).await || self.session.is_cancelled() {
                self.session.set_status(name, PipelineStatus::Cancelled);
                debug!(pipeline = name, turn, "pipeline cancelled at turn boundary");
                return Ok(());
            }

            ctx.turn = turn;
            self.session.update(name, |state| state.current_turn = turn);
            let _ = self
                .events
                .send(AnalysisEvent::Progress {
                    session: ctx.session.clone(),
                    pipeline: self.name.clone(),
                    turn,
                    max_turns: self.max_turns,
                })
                .await;

            let output = self
                .executor
                .run_turn(&ctx)
                .await
                .map_err(|e| match e {
                    Error::Pipeline { .. } => e,
                    other => Error::pipeline(name, other.to_string()),
                })?;

            if self.content_every > 0 && turn % self.content_every == 0 {
                let _ = self
                    .events
                    .send(AnalysisEvent::Content {
                        session: ctx.session.clone(),
                        pipeline: self.name.clone(),
                        turn,
                        content: output.clone(),
                    })
                    .await;
            }
            outputs.push(output);
        }

        let result = self.executor.summarize(&ctx, &outputs);
        self.session.set_status(name, PipelineStatus::Complete);
        let _ = self
            .events
            .send(AnalysisEvent::Complete {
                session: ctx.session.clone(),
                pipeline: self.name.clone(),
                result,
            })
            .await;
        Ok(())
    }
}
