//! RPC router: dispatches JSON-RPC method calls to the coordinator
//!
//! Methods are grouped by component: `locks.*` for the lock manager,
//! `intents.*` for the intent queue and `analysis.*` for the pipeline
//! coordinator. Params are camelCase objects; results are JSON values.

use coedit_core::{
    Actor, AnalysisEvent, ControlAction, Error, RpcError, RpcResponse, SessionKey, INTERNAL_ERROR,
    INVALID_PARAMS, METHOD_NOT_FOUND,
};
use coedit_engine::Coordinator;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Connection context passed to RPC handlers.
pub struct ConnectionContext {
    pub session: SessionKey,
    pub coordinator: Arc<Coordinator>,
    /// Analysis events for this connection's analyses.
    pub analysis_tx: mpsc::Sender<AnalysisEvent>,
}

impl ConnectionContext {
    /// The actor named in the params, or the connection's own user. A
    /// connection may act as itself or as any pipeline, never as another
    /// user.
    fn actor(&self, locked_by: Option<Actor>) -> Result<Actor, RpcError> {
        match locked_by {
            None => Ok(Actor::user(self.session.as_str())),
            Some(Actor::User(id)) if id != self.session.as_str() => Err(RpcError {
                code: INVALID_PARAMS,
                message: format!("lockedBy user:{} is not this connection's user", id),
            }),
            Some(actor) => Ok(actor),
        }
    }
}

/// Result type for RPC handlers.
pub type RpcResult = Result<Value, RpcError>;

/// Route an RPC method call to the appropriate handler.
pub async fn route_rpc(method: &str, params: Value, ctx: &ConnectionContext) -> RpcResult {
    match method {
        "locks.acquire" => handle_locks_acquire(params, ctx).await,
        "locks.release" => handle_locks_release(params, ctx).await,
        "locks.extend" => handle_locks_extend(params, ctx).await,
        "locks.status" => handle_locks_status(params, ctx).await,
        "locks.document" => handle_locks_document(params, ctx).await,
        "locks.force_release" => handle_locks_force_release(params, ctx).await,
        "locks.stats" => handle_locks_stats(ctx).await,
        "intents.declare" => handle_intents_declare(params, ctx).await,
        "intents.queue" => handle_intents_queue(params, ctx).await,
        "intents.complete" => handle_intents_complete(params, ctx).await,
        "intents.cancel" => handle_intents_cancel(params, ctx).await,
        "intents.position" => handle_intents_position(params, ctx).await,
        "intents.document" => handle_intents_document(params, ctx).await,
        "intents.block" => handle_intents_block(params, ctx).await,
        "analysis.start" => handle_analysis_start(params, ctx).await,
        "analysis.control" => handle_analysis_control(params, ctx),
        "analysis.cancel" => handle_analysis_cancel(ctx),
        "analysis.status" => handle_analysis_status(ctx),
        "echo" => Ok(params),
        _ => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
        }),
    }
}

/// Convert an RPC result to an RpcResponse.
pub fn to_response(id: &str, result: RpcResult) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => RpcResponse::err(id, e.code, e.message),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {}", e),
    })
}

fn to_json<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| RpcError {
        code: INTERNAL_ERROR,
        message: e.to_string(),
    })
}

fn fail(error: Error) -> RpcError {
    RpcError::from(&error)
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireParams {
    document_id: String,
    block_ids: Vec<String>,
    #[serde(default)]
    locked_by: Option<Actor>,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseParams {
    block_ids: Vec<String>,
    #[serde(default)]
    locked_by: Option<Actor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendParams {
    block_ids: Vec<String>,
    #[serde(default)]
    locked_by: Option<Actor>,
    #[serde(default)]
    additional_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockParams {
    block_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentParams {
    document_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeclareParams {
    pipeline: String,
    document_id: String,
    section_id: String,
    block_id: String,
    #[serde(default)]
    section_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentParams {
    intent_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockQueueParams {
    document_id: String,
    block_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisParams {
    document_id: String,
    query: String,
}

#[derive(Deserialize)]
struct ControlParams {
    pipeline: String,
}

// ---------------------------------------------------------------------------
// locks.*
// ---------------------------------------------------------------------------

async fn handle_locks_acquire(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: AcquireParams = parse(params)?;
    let actor = ctx.actor(p.locked_by)?;
    let outcome = ctx
        .coordinator
        .locks()
        .acquire_locks(&p.block_ids, &p.document_id, &ctx.session, &actor, p.ttl_ms)
        .await;
    to_json(outcome)
}

async fn handle_locks_release(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: ReleaseParams = parse(params)?;
    let actor = ctx.actor(p.locked_by)?;
    let released = ctx
        .coordinator
        .locks()
        .release_locks(&p.block_ids, &actor)
        .await
        .map_err(fail)?;
    Ok(json!({ "released": released }))
}

async fn handle_locks_extend(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: ExtendParams = parse(params)?;
    let actor = ctx.actor(p.locked_by)?;
    let locks = ctx.coordinator.locks();
    let additional_ms = p.additional_ms.unwrap_or(locks.config().default_ttl_ms);
    let extended = locks
        .extend_locks(&p.block_ids, &actor, additional_ms)
        .await
        .map_err(fail)?;
    Ok(json!({ "extended": extended }))
}

async fn handle_locks_status(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: BlockParams = parse(params)?;
    let status = ctx
        .coordinator
        .locks()
        .is_block_locked(&p.block_id)
        .await
        .map_err(fail)?;
    to_json(status)
}

async fn handle_locks_document(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: DocumentParams = parse(params)?;
    let locks = ctx
        .coordinator
        .locks()
        .get_document_locks(&p.document_id)
        .await
        .map_err(fail)?;
    to_json(locks)
}

async fn handle_locks_force_release(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: BlockParams = parse(params)?;
    info!(session = %ctx.session, block = %p.block_id, "locks.force_release");
    let released = ctx
        .coordinator
        .locks()
        .force_release_lock(&p.block_id)
        .await
        .map_err(fail)?;
    Ok(json!({ "released": released }))
}

async fn handle_locks_stats(ctx: &ConnectionContext) -> RpcResult {
    let stats = ctx
        .coordinator
        .locks()
        .get_lock_stats()
        .await
        .map_err(fail)?;
    to_json(stats)
}

// ---------------------------------------------------------------------------
// intents.*
// ---------------------------------------------------------------------------

async fn handle_intents_declare(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: DeclareParams = parse(params)?;
    let intent = ctx
        .coordinator
        .intents()
        .declare_intent(
            &p.pipeline,
            &p.document_id,
            &p.section_id,
            &p.block_id,
            p.section_type.as_deref(),
        )
        .await;
    to_json(intent)
}

async fn handle_intents_queue(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: IntentParams = parse(params)?;
    let intents = ctx.coordinator.intents();
    let position = intents.queue_intent(&p.intent_id).await.map_err(fail)?;
    let status = intents.get_intent(&p.intent_id).await.map(|i| i.status);
    Ok(json!({ "position": position, "status": status }))
}

async fn handle_intents_complete(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: IntentParams = parse(params)?;
    ctx.coordinator
        .intents()
        .complete_intent(&p.intent_id)
        .await
        .map_err(fail)?;
    Ok(json!({ "ok": true }))
}

async fn handle_intents_cancel(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: IntentParams = parse(params)?;
    let reason = p.reason.as_deref().unwrap_or("cancelled by client");
    let cancelled = ctx
        .coordinator
        .intents()
        .cancel_intent(&p.intent_id, reason)
        .await;
    Ok(json!({ "cancelled": cancelled }))
}

async fn handle_intents_position(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: IntentParams = parse(params)?;
    let position = ctx
        .coordinator
        .intents()
        .get_queue_position(&p.intent_id)
        .await;
    Ok(json!({ "position": position }))
}

async fn handle_intents_document(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: DocumentParams = parse(params)?;
    let intents = ctx
        .coordinator
        .intents()
        .get_document_intents(&p.document_id)
        .await;
    to_json(intents)
}

async fn handle_intents_block(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: BlockQueueParams = parse(params)?;
    let queue = ctx.coordinator.intents();
    let intents = queue.get_block_intents(&p.document_id, &p.block_id).await;
    let entries = queue.get_block_queue(&p.document_id, &p.block_id).await;
    Ok(json!({ "intents": intents, "queue": entries }))
}

// ---------------------------------------------------------------------------
// analysis.*
// ---------------------------------------------------------------------------

/// Start an analysis for this connection's session. Returns at once; the
/// events stream back over the socket.
async fn handle_analysis_start(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let p: AnalysisParams = parse(params)?;
    let pipelines = ctx.coordinator.pipelines().clone();
    let prepared = pipelines
        .begin_analysis(&ctx.session, &p.document_id, &p.query)
        .map_err(fail)?;
    let selected = prepared.pipelines().to_vec();

    let events = ctx.analysis_tx.clone();
    tokio::spawn(async move {
        pipelines.run_analysis(prepared, events).await;
    });

    Ok(json!({ "session": ctx.session, "pipelines": selected }))
}

fn handle_analysis_control(params: Value, ctx: &ConnectionContext) -> RpcResult {
    let action: ControlAction = parse(params.clone())?;
    let p: ControlParams = parse(params)?;
    ctx.coordinator
        .pipelines()
        .control_pipeline(&ctx.session, &p.pipeline, &action)
        .map_err(fail)?;
    Ok(json!({ "ok": true, "action": action.to_string() }))
}

fn handle_analysis_cancel(ctx: &ConnectionContext) -> RpcResult {
    let cancelled = ctx.coordinator.pipelines().cancel_session(&ctx.session);
    Ok(json!({ "cancelled": cancelled }))
}

fn handle_analysis_status(ctx: &ConnectionContext) -> RpcResult {
    let states = ctx.coordinator.pipelines().pipeline_states(&ctx.session);
    Ok(json!({ "running": states.is_some(), "pipelines": states.unwrap_or_default() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_core::{CoordinatorConfig, IntentStatus, NOT_FOUND, UNSUPPORTED};
    use coedit_engine::MemoryLockStore;

    fn context(session: &str) -> (ConnectionContext, mpsc::Receiver<AnalysisEvent>) {
        let mut config = CoordinatorConfig::default();
        config.pipelines.turn_delay_ms = 0;
        let coordinator = Coordinator::with_store(config, Arc::new(MemoryLockStore::new()));
        let (tx, rx) = mpsc::channel(256);
        (
            ConnectionContext {
                session: SessionKey::new(session),
                coordinator: Arc::new(coordinator),
                analysis_tx: tx,
            },
            rx,
        )
    }

    fn sibling(ctx: &ConnectionContext, session: &str) -> ConnectionContext {
        let (tx, _rx) = mpsc::channel(1);
        ConnectionContext {
            session: SessionKey::new(session),
            coordinator: ctx.coordinator.clone(),
            analysis_tx: tx,
        }
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (ctx, _rx) = context("s1");
        let err = route_rpc("locks.steal", Value::Null, &ctx).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let (ctx, _rx) = context("s1");
        let params = json!({ "hello": "world" });
        assert_eq!(route_rpc("echo", params.clone(), &ctx).await.unwrap(), params);
    }

    #[tokio::test]
    async fn missing_params_are_invalid() {
        let (ctx, _rx) = context("s1");
        let err = route_rpc("locks.acquire", json!({ "documentId": "d1" }), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn acquire_defaults_to_connection_user() {
        let (alice, _rx) = context("alice");
        let bob = sibling(&alice, "bob");

        let params = json!({ "documentId": "d1", "blockIds": ["b1"] });
        let won = route_rpc("locks.acquire", params.clone(), &alice).await.unwrap();
        assert_eq!(won["granted"][0]["lockedBy"], "user:alice");
        assert_eq!(won["granted"][0]["sessionId"], "alice");

        let lost = route_rpc("locks.acquire", params, &bob).await.unwrap();
        assert_eq!(lost["granted"].as_array().unwrap().len(), 0);
        assert_eq!(lost["denied"][0]["blockId"], "b1");
        assert_eq!(lost["denied"][0]["heldBy"], "user:alice");

        let status = route_rpc("locks.status", json!({ "blockId": "b1" }), &bob)
            .await
            .unwrap();
        assert_eq!(status["locked"], true);
    }

    #[tokio::test]
    async fn release_only_frees_own_locks() {
        let (alice, _rx) = context("alice");
        let bob = sibling(&alice, "bob");
        route_rpc(
            "locks.acquire",
            json!({ "documentId": "d1", "blockIds": ["b1"] }),
            &alice,
        )
        .await
        .unwrap();

        let params = json!({ "blockIds": ["b1"] });
        let by_bob = route_rpc("locks.release", params.clone(), &bob).await.unwrap();
        assert_eq!(by_bob["released"], json!([]));
        let by_alice = route_rpc("locks.release", params, &alice).await.unwrap();
        assert_eq!(by_alice["released"], json!(["b1"]));
    }

    #[tokio::test]
    async fn declared_intent_is_granted_through_queue() {
        let (ctx, _rx) = context("s1");
        let intent = route_rpc(
            "intents.declare",
            json!({
                "pipeline": "tableau",
                "documentId": "d1",
                "sectionId": "sec-1",
                "blockId": "b1",
                "sectionType": "success_metrics"
            }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(intent["priority"], 6);
        assert_eq!(intent["affinityScore"], 3);
        assert_eq!(intent["status"], "pending");

        let id = intent["id"].as_str().unwrap().to_string();
        let queued = route_rpc("intents.queue", json!({ "intentId": id }), &ctx)
            .await
            .unwrap();
        assert_eq!(queued["position"], 0);
        assert_eq!(queued["status"], json!(IntentStatus::Granted));

        let status = route_rpc("locks.status", json!({ "blockId": "b1" }), &ctx)
            .await
            .unwrap();
        assert_eq!(status["lockedBy"], "pipeline:tableau");

        route_rpc("intents.complete", json!({ "intentId": id }), &ctx)
            .await
            .unwrap();
        let again = route_rpc("intents.cancel", json!({ "intentId": id }), &ctx)
            .await
            .unwrap();
        assert_eq!(again["cancelled"], false);
    }

    #[tokio::test]
    async fn unknown_intent_maps_to_not_found() {
        let (ctx, _rx) = context("s1");
        let err = route_rpc("intents.complete", json!({ "intentId": "nope" }), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, NOT_FOUND);
    }

    #[tokio::test]
    async fn control_without_analysis_is_not_found() {
        let (ctx, _rx) = context("s1");
        let err = route_rpc(
            "analysis.control",
            json!({ "pipeline": "reviewer", "action": "pause" }),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, NOT_FOUND);
    }

    #[tokio::test]
    async fn analysis_streams_to_connection() {
        let (ctx, mut rx) = context("s1");
        let started = route_rpc(
            "analysis.start",
            json!({ "documentId": "d1", "query": "check the kpi dashboard" }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(started["pipelines"], json!(["tableau"]));

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, AnalysisEvent::AnalysisComplete { .. });
            names.push(event.name());
            if done {
                break;
            }
        }
        assert_eq!(names.first(), Some(&"analysis_started"));
        assert_eq!(names.last(), Some(&"analysis_complete"));
        assert!(names.contains(&"complete"));
    }

    fn slow_context(session: &str) -> (ConnectionContext, mpsc::Receiver<AnalysisEvent>) {
        let mut config = CoordinatorConfig::default();
        config.pipelines.turn_delay_ms = 60_000;
        let coordinator = Coordinator::with_store(config, Arc::new(MemoryLockStore::new()));
        let (tx, rx) = mpsc::channel(256);
        (
            ConnectionContext {
                session: SessionKey::new(session),
                coordinator: Arc::new(coordinator),
                analysis_tx: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn second_start_on_busy_session_is_refused() {
        let (ctx, _rx) = slow_context("s1");
        let params = json!({ "documentId": "d1", "query": "check the kpi dashboard" });

        let first = route_rpc("analysis.start", params.clone(), &ctx).await.unwrap();
        assert_eq!(first["pipelines"], json!(["tableau"]));

        let second = route_rpc("analysis.start", params, &ctx).await.unwrap_err();
        assert_eq!(second.code, coedit_core::CONFLICT);
        assert_eq!(ctx.coordinator.pipelines().active_sessions().len(), 1);

        let paused = route_rpc(
            "analysis.control",
            json!({ "pipeline": "tableau", "action": "pause" }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(paused["action"], "pause");

        route_rpc("analysis.cancel", Value::Null, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn redirect_is_unsupported() {
        let (ctx, _rx) = slow_context("s1");
        route_rpc(
            "analysis.start",
            json!({ "documentId": "d1", "query": "review" }),
            &ctx,
        )
        .await
        .unwrap();

        let err = route_rpc(
            "analysis.control",
            json!({ "pipeline": "reviewer", "action": "redirect", "payload": {} }),
            &ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, UNSUPPORTED);

        let cancelled = route_rpc("analysis.cancel", Value::Null, &ctx).await.unwrap();
        assert_eq!(cancelled["cancelled"], true);
    }

    #[tokio::test]
    async fn cannot_act_as_another_user() {
        let (alice, _rx) = context("alice");
        let bob = sibling(&alice, "bob");
        route_rpc(
            "locks.acquire",
            json!({ "documentId": "d1", "blockIds": ["b1"] }),
            &alice,
        )
        .await
        .unwrap();

        for method in ["locks.release", "locks.extend"] {
            let err = route_rpc(
                method,
                json!({ "blockIds": ["b1"], "lockedBy": "user:alice" }),
                &bob,
            )
            .await
            .unwrap_err();
            assert_eq!(err.code, INVALID_PARAMS);
        }

        let status = route_rpc("locks.status", json!({ "blockId": "b1" }), &bob)
            .await
            .unwrap();
        assert_eq!(status["lockedBy"], "user:alice");

        let as_pipeline = route_rpc(
            "locks.acquire",
            json!({ "documentId": "d1", "blockIds": ["b2"], "lockedBy": "pipeline:tableau" }),
            &bob,
        )
        .await
        .unwrap();
        assert_eq!(as_pipeline["granted"][0]["lockedBy"], "pipeline:tableau");
    }
}
