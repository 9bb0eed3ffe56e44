//! Tests for coedit-core: identifiers, lock model, events, config, protocol

use chrono::{Duration, Utc};
use coedit_core::*;

// ===========================================================================
// SessionKey
// ===========================================================================

#[test]
fn session_key_new_and_display() {
    let key = SessionKey::new("abc-123");
    assert_eq!(key.as_str(), "abc-123");
    assert_eq!(format!("{}", key), "abc-123");
}

#[test]
fn session_key_generate_is_unique() {
    let a = SessionKey::generate();
    let b = SessionKey::generate();
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), 36);
}

#[test]
fn session_key_serializes_as_plain_string() {
    let key = SessionKey::new("s1");
    assert_eq!(serde_json::to_string(&key).unwrap(), "\"s1\"");
}

// ===========================================================================
// Actor
// ===========================================================================

#[test]
fn actor_display_carries_kind_prefix() {
    assert_eq!(Actor::user("alice").to_string(), "user:alice");
    assert_eq!(Actor::pipeline("tableau").to_string(), "pipeline:tableau");
}

#[test]
fn actor_parses_prefixes_and_bare_ids() {
    assert_eq!(Actor::from("pipeline:tableau"), Actor::pipeline("tableau"));
    assert_eq!(Actor::from("user:alice"), Actor::user("alice"));
    assert_eq!(Actor::from("alice"), Actor::user("alice"));
    // Only the first colon separates the kind
    assert_eq!(Actor::from("user:a:b"), Actor::user("a:b"));
}

#[test]
fn actor_lock_type() {
    assert_eq!(Actor::user("a").lock_type(), LockType::Human);
    assert_eq!(Actor::pipeline("p").lock_type(), LockType::Agent);
    assert!(Actor::pipeline("p").is_agent());
    assert_eq!(Actor::pipeline("p").id(), "p");
}

#[test]
fn actor_serde_roundtrip_through_string() {
    let json = serde_json::to_string(&Actor::pipeline("engineer")).unwrap();
    assert_eq!(json, "\"pipeline:engineer\"");
    let back: Actor = serde_json::from_str(&json).unwrap();
    assert_eq!(back, Actor::pipeline("engineer"));
}

#[test]
fn lock_type_from_str() {
    assert_eq!("human".parse::<LockType>().unwrap(), LockType::Human);
    assert_eq!("agent".parse::<LockType>().unwrap(), LockType::Agent);
    assert!("robot".parse::<LockType>().is_err());
}

// ===========================================================================
// Lock
// ===========================================================================

#[test]
fn lock_new_sets_expiry_from_ttl() {
    let now = Utc::now();
    let lock = Lock::new("b1", "d1", SessionKey::new("s1"), Actor::user("a"), now, 30_000);
    assert_eq!(lock.acquired_at, now);
    assert_eq!(lock.expires_at, now + Duration::milliseconds(30_000));
    assert_eq!(lock.lock_type, LockType::Human);
    assert!(lock.is_live(now));
    assert!(!lock.is_live(lock.expires_at));
    assert_eq!(lock.remaining_ms(now), 30_000);
}

#[test]
fn lock_ttl_is_clamped() {
    let now = Utc::now();
    let zero = Lock::new("b1", "d1", SessionKey::new("s1"), Actor::user("a"), now, 0);
    assert!(zero.expires_at > zero.acquired_at);

    let huge = Lock::new("b1", "d1", SessionKey::new("s1"), Actor::user("a"), now, u64::MAX);
    assert_eq!(
        huge.expires_at,
        now + Duration::milliseconds(MAX_LOCK_TTL_MS as i64)
    );
}

#[test]
fn lock_serializes_camel_case() {
    let lock = Lock::new(
        "b1",
        "d1",
        SessionKey::new("s1"),
        Actor::pipeline("tableau"),
        Utc::now(),
        1_000,
    );
    let value = serde_json::to_value(&lock).unwrap();
    assert_eq!(value["blockId"], "b1");
    assert_eq!(value["documentId"], "d1");
    assert_eq!(value["sessionId"], "s1");
    assert_eq!(value["lockedBy"], "pipeline:tableau");
    assert_eq!(value["lockType"], "agent");
    assert!(value["expiresAt"].is_string());
}

#[test]
fn acquire_outcome_helpers() {
    let lock = Lock::new("b2", "d1", SessionKey::new("s1"), Actor::user("a"), Utc::now(), 1_000);
    let outcome = AcquireOutcome {
        granted: vec![lock],
        denied: vec![DeniedBlock {
            block_id: "b1".into(),
            held_by: Some(Actor::user("bob")),
        }],
    };
    assert!(!outcome.all_granted());
    assert!(outcome.is_granted("b2"));
    assert!(!outcome.is_granted("b1"));
}

// ===========================================================================
// Status enums
// ===========================================================================

#[test]
fn intent_status_terminal() {
    assert!(IntentStatus::Completed.is_terminal());
    assert!(IntentStatus::Cancelled.is_terminal());
    assert!(!IntentStatus::Pending.is_terminal());
    assert!(!IntentStatus::Queued.is_terminal());
    assert!(!IntentStatus::Granted.is_terminal());
    assert_eq!(IntentStatus::Granted.to_string(), "granted");
}

#[test]
fn pipeline_status_finished() {
    assert!(PipelineStatus::Complete.is_finished());
    assert!(PipelineStatus::Error.is_finished());
    assert!(PipelineStatus::Cancelled.is_finished());
    assert!(!PipelineStatus::Paused.is_finished());
    assert_eq!(
        serde_json::to_string(&PipelineStatus::Running).unwrap(),
        "\"running\""
    );
}

#[test]
fn control_action_deserializes_by_tag() {
    let pause: ControlAction = serde_json::from_str(r#"{"action":"pause"}"#).unwrap();
    assert_eq!(pause, ControlAction::Pause);

    let redirect: ControlAction =
        serde_json::from_str(r#"{"action":"redirect","payload":{"to":"engineer"}}"#).unwrap();
    assert_eq!(
        redirect,
        ControlAction::Redirect {
            payload: serde_json::json!({"to": "engineer"})
        }
    );
    assert_eq!(redirect.to_string(), "redirect");

    assert!(serde_json::from_str::<ControlAction>(r#"{"action":"explode"}"#).is_err());
}

// ===========================================================================
// Events
// ===========================================================================

fn sample_intent() -> EditIntent {
    EditIntent {
        id: "i1".into(),
        pipeline_name: "tableau".into(),
        document_id: "d1".into(),
        section_id: "sec1".into(),
        block_id: "b1".into(),
        priority: 6,
        affinity_score: 3,
        timestamp: Utc::now(),
        status: IntentStatus::Queued,
    }
}

#[test]
fn coordination_event_wire_names() {
    let lock = Lock::new("b1", "d1", SessionKey::new("s1"), Actor::user("a"), Utc::now(), 1_000);
    let cases = vec![
        (CoordinationEvent::LockAcquired { lock: lock.clone() }, "lock:acquired"),
        (
            CoordinationEvent::LockReleased {
                block_id: "b1".into(),
                locked_by: None,
            },
            "lock:released",
        ),
        (CoordinationEvent::LockExpired { lock: lock.clone() }, "lock:expired"),
        (
            CoordinationEvent::LockTimeoutWarning {
                lock,
                ms_remaining: 10,
            },
            "lock:timeout_warning",
        ),
        (
            CoordinationEvent::IntentQueued {
                intent: sample_intent(),
                position: 0,
            },
            "intent:queued",
        ),
        (
            CoordinationEvent::IntentCancelled {
                intent: sample_intent(),
                reason: "user".into(),
            },
            "intent:cancelled",
        ),
    ];
    for (event, name) in cases {
        assert_eq!(event.name(), name);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], name, "type tag for {}", name);
        assert_eq!(event.block_id(), "b1");
    }
}

#[test]
fn lock_released_payload_is_camel_case() {
    let event = CoordinationEvent::LockReleased {
        block_id: "b1".into(),
        locked_by: Some(Actor::user("alice")),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["blockId"], "b1");
    assert_eq!(value["lockedBy"], "user:alice");
}

#[test]
fn timeout_warning_carries_remaining_ms() {
    let lock = Lock::new("b1", "d1", SessionKey::new("s1"), Actor::user("a"), Utc::now(), 1_000);
    let event = CoordinationEvent::LockTimeoutWarning {
        lock,
        ms_remaining: 4_200,
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["msRemaining"], 4_200);
    assert_eq!(value["lock"]["blockId"], "b1");
}

#[test]
fn analysis_event_tags_and_accessors() {
    let event = AnalysisEvent::Progress {
        session: SessionKey::new("s1"),
        pipeline: "tableau".into(),
        turn: 2,
        max_turns: 6,
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["type"], "progress");
    assert_eq!(value["turn"], 2);
    assert_eq!(event.name(), "progress");
    assert_eq!(event.pipeline(), Some("tableau"));
    assert_eq!(event.session().as_str(), "s1");

    let done = AnalysisEvent::AnalysisComplete {
        session: SessionKey::new("s1"),
        document_id: "d1".into(),
    };
    assert_eq!(serde_json::to_value(&done).unwrap()["type"], "analysis_complete");
    assert_eq!(done.pipeline(), None);
}

// ===========================================================================
// Config
// ===========================================================================

#[test]
fn config_defaults() {
    let config = CoordinatorConfig::default();
    assert_eq!(config.locks.default_ttl_ms, 30_000);
    assert_eq!(config.locks.warning_threshold_ms, 5_000);
    assert_eq!(config.locks.watchdog_interval_ms, 1_000);
    assert_eq!(config.pipelines.max_turns, 6);
    assert_eq!(config.pipelines.content_every, 3);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.gateway.port, 18800);
    assert_eq!(config.gateway.bind.to_addr(), "127.0.0.1");
}

#[test]
fn pipeline_priorities_and_affinity() {
    let pipelines = PipelineConfig::default();
    assert_eq!(pipelines.priority_for("tableau"), 6);
    assert_eq!(pipelines.priority_for("strategist"), 8);
    assert_eq!(pipelines.priority_for("unknown"), DEFAULT_PIPELINE_PRIORITY);

    assert_eq!(pipelines.affinity_for("tableau", Some("success_metrics")), 3);
    assert_eq!(pipelines.affinity_for("tableau", Some("kpis")), 2);
    assert_eq!(pipelines.affinity_for("tableau", Some("analytics")), 1);
    assert_eq!(pipelines.affinity_for("tableau", Some("risks")), 0);
    assert_eq!(pipelines.affinity_for("tableau", None), 0);
    assert_eq!(pipelines.affinity_for("unknown", Some("risks")), 0);
}

#[test]
fn partial_toml_keeps_other_defaults() {
    let config = CoordinatorConfig::from_toml(
        r#"
        [locks]
        default_ttl_ms = 1000

        [intents]
        cleanup_interval_ms = 250

        [storage]
        backend = "sqlite"
        path = "/tmp/coedit.db"
        "#,
    )
    .unwrap();
    assert_eq!(config.locks.default_ttl_ms, 1_000);
    assert_eq!(config.intents.cleanup_interval_ms, 250);
    assert_eq!(config.intents.cleanup_max_age_ms, 3_600_000);
    assert_eq!(config.locks.warning_threshold_ms, 5_000);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(
        config.storage.path.as_deref(),
        Some(std::path::Path::new("/tmp/coedit.db"))
    );
    assert_eq!(config.pipelines.catalog.len(), 6);
}

#[test]
fn custom_catalog_replaces_default() {
    let config = CoordinatorConfig::from_toml(
        r#"
        [pipelines]
        fallback = "solo"

        [[pipelines.catalog]]
        name = "solo"
        priority = 9
        affinity = ["intro"]
        keywords = ["anything"]
        "#,
    )
    .unwrap();
    assert_eq!(config.pipelines.names(), vec!["solo"]);
    assert_eq!(config.pipelines.priority_for("solo"), 9);
    assert_eq!(config.pipelines.affinity_for("solo", Some("intro")), 3);
}

#[test]
fn invalid_toml_is_a_config_error() {
    let err = CoordinatorConfig::from_toml("[locks]\ndefault_ttl_ms = \"soon\"").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn toml_roundtrip() {
    let config = CoordinatorConfig::default();
    let text = config.to_toml();
    let back = CoordinatorConfig::from_toml(&text).unwrap();
    assert_eq!(back.pipelines.catalog, config.pipelines.catalog);
    assert_eq!(back.locks.default_ttl_ms, config.locks.default_ttl_ms);
}

#[test]
fn load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig::load(&dir.path().join("nope.toml"));
    assert_eq!(config.gateway.port, 18800);
}

#[test]
fn load_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coedit.toml");
    std::fs::write(&path, "[gateway]\nport = 9000\nbind = \"lan\"\n").unwrap();
    let config = CoordinatorConfig::load(&path);
    assert_eq!(config.gateway.port, 9000);
    assert_eq!(config.gateway.bind, BindMode::Lan);
}

// ===========================================================================
// Protocol
// ===========================================================================

#[test]
fn rpc_request_params_default_to_null() {
    let req: RpcRequest = serde_json::from_str(r#"{"id":"1","method":"locks.stats"}"#).unwrap();
    assert_eq!(req.method, "locks.stats");
    assert!(req.params.is_null());
}

#[test]
fn rpc_response_omits_empty_fields() {
    let ok = serde_json::to_value(RpcResponse::ok("1", serde_json::json!({"x": 1}))).unwrap();
    assert!(ok.get("error").is_none());
    assert_eq!(ok["result"]["x"], 1);

    let err = serde_json::to_value(RpcResponse::method_not_found("2", "nope")).unwrap();
    assert!(err.get("result").is_none());
    assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
}

#[test]
fn rpc_error_codes_follow_error_kind() {
    assert_eq!(RpcError::from(&Error::SessionNotFound("s".into())).code, NOT_FOUND);
    assert_eq!(
        RpcError::from(&Error::pipeline_not_found("s", "p")).code,
        NOT_FOUND
    );
    assert_eq!(RpcError::from(&Error::IntentNotFound("i".into())).code, NOT_FOUND);
    assert_eq!(RpcError::from(&Error::SessionBusy("s".into())).code, CONFLICT);
    assert_eq!(RpcError::from(&Error::Unsupported("x".into())).code, UNSUPPORTED);
    assert_eq!(
        RpcError::from(&Error::InvalidMessage("x".into())).code,
        INVALID_PARAMS
    );
    assert_eq!(RpcError::from(&Error::storage("disk")).code, INTERNAL_ERROR);
}

#[test]
fn event_message_uses_wire_name() {
    let event = CoordinationEvent::LockReleased {
        block_id: "b1".into(),
        locked_by: None,
    };
    let msg = EventMessage::coordination(&event);
    assert_eq!(msg.event, "lock:released");
    assert_eq!(msg.data["blockId"], "b1");

    let analysis = EventMessage::analysis(&AnalysisEvent::AnalysisStarted {
        session: SessionKey::new("s1"),
        document_id: "d1".into(),
        pipelines: vec!["tableau".into()],
    });
    assert_eq!(analysis.event, "analysis");
    assert_eq!(analysis.data["type"], "analysis_started");
}
