//! End-to-end scenarios through the tool surface.
//!
//! Every call goes through `Engine::dispatch` exactly as the transport would
//! issue it. The embedding provider is `none` so semantic scores are zero
//! and results are deterministic.

use serde_json::{json, Value};
use tempfile::TempDir;

use latent_context::config::EngineConfig;
use latent_context::engine::Engine;
use latent_context::errors::EngineError;

fn test_engine(cross_session: bool) -> (Engine, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let mut config = EngineConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.embedding.provider = "none".to_string();
    config.retrieval.cross_session = cross_session;
    config.session.auto_start_on_boot = false;
    let engine = Engine::boot(config).expect("engine boot");
    (engine, dir)
}

fn call(engine: &Engine, method: &str, params: Value) -> Value {
    engine
        .dispatch(method, params)
        .unwrap_or_else(|e| panic!("{method} failed: {e}"))
}

#[test]
fn s1_session_reset_isolates_retrieval() {
    let (engine, _dir) = test_engine(false); // strict session isolation

    let first = call(&engine, "session_start", Value::Null);
    let x = first["new_id"].as_str().unwrap().to_string();

    call(
        &engine,
        "memory_store",
        json!({
            "content": "I am testing the alpha build of the memory engine today.",
            "kind": "event",
        }),
    );

    let second = call(&engine, "session_start", Value::Null);
    let y = second["new_id"].as_str().unwrap().to_string();
    assert_ne!(x, y);

    let result = call(&engine, "memory_retrieve", json!({ "query": "alpha build" }));
    let text = result["text"].as_str().unwrap();
    assert!(
        text.starts_with("No relevant memories found"),
        "expected guidance message, got: {text}"
    );
    assert_eq!(result["candidates_selected"], 0);
}

#[test]
fn s2_fact_store_builds_the_graph() {
    let (engine, _dir) = test_engine(true);
    call(&engine, "session_start", Value::Null);

    let stored = call(
        &engine,
        "memory_store",
        json!({
            "content": "User lives in Paris near the river and works remotely from home.",
            "kind": "fact",
            "confidence": 1.0,
            "entities": ["User", "Paris"],
        }),
    );
    assert_eq!(stored["tier"], 1);
    assert_eq!(stored["entities_created"], json!(["User", "Paris"]));
    assert_eq!(stored["facts_stored"], 1);

    let queried = call(&engine, "graph_query", json!({ "entity": "User" }));
    assert_eq!(
        queried["reply"].as_str().unwrap(),
        "Entity: User (unknown)\n  → located_in → Paris"
    );
}

#[test]
fn s3_contradiction_supersedes_the_old_relation() {
    let (engine, _dir) = test_engine(true);
    call(&engine, "session_start", Value::Null);

    call(
        &engine,
        "memory_store",
        json!({
            "content": "User lives in Paris near the river and works remotely from home.",
            "kind": "fact",
            "entities": ["User", "Paris"],
        }),
    );
    call(
        &engine,
        "memory_store",
        json!({
            "content": "User moved to London at the start of this quarter.",
            "kind": "fact",
            "entities": ["User", "London"],
        }),
    );

    let queried = call(&engine, "graph_query", json!({ "entity": "User", "depth": 1 }));
    let reply = queried["reply"].as_str().unwrap();
    assert!(reply.contains("→ located_in → London"), "got: {reply}");
    assert!(!reply.contains("Paris"), "superseded edge must be invisible: {reply}");

    // The old edge survives as history at half confidence.
    let facts = call(
        &engine,
        "graph_query",
        json!({ "entity": "User", "relation": "located_in" }),
    );
    let lines = facts["reply"].as_str().unwrap();
    assert!(lines.contains("User → located_in → London"));
    assert!(!lines.contains("Paris"), "predicate query lists actives only");
}

#[test]
fn s4_overflow_auto_compresses_oldest_half() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.embedding.provider = "none".to_string();
    config.session.auto_start_on_boot = false;
    config.compression.tier0_overflow_threshold = 50;
    let engine = Engine::boot(config).unwrap();
    call(&engine, "session_start", Value::Null);

    for _ in 0..6 {
        call(
            &engine,
            "memory_store",
            json!({
                "content": "one two three four five six seven eight nine ten.",
                "kind": "event",
            }),
        );
        let status = call(&engine, "memory_status", Value::Null);
        let working_tokens = status["tier0"]["token_estimate"].as_u64().unwrap();
        assert!(
            working_tokens <= 50,
            "working tokens must drop back under the threshold, got {working_tokens}"
        );
    }

    let status = call(&engine, "memory_status", Value::Null);
    assert!(
        status["tier1"]["count"].as_u64().unwrap() >= 1,
        "auto-compression must produce a Tier-1 summary"
    );
}

#[test]
fn s5_correct_replaces_content_everywhere() {
    let (engine, _dir) = test_engine(true);
    call(&engine, "session_start", Value::Null);

    let stored = call(
        &engine,
        "memory_store",
        json!({
            "content": "User likes dark mode as the placeholder theme for every editor window.",
            "kind": "preference",
            "entities": ["dark mode"],
        }),
    );
    let memory_id = stored["memory_id"].as_str().unwrap().to_string();

    let corrected = call(
        &engine,
        "memory_forget",
        json!({
            "memory_id": memory_id,
            "action": "correct",
            "correction": "User strongly prefers dark mode with #0a0e27 base and #6c63ff accents.",
        }),
    );
    assert!(corrected["reply"].as_str().unwrap().contains("Corrected"));

    let result = call(&engine, "memory_retrieve", json!({ "query": "dark mode" }));
    let text = result["text"].as_str().unwrap();
    assert!(text.contains("#0a0e27"), "retrieval must surface the corrected text: {text}");
    assert!(!text.contains("placeholder"), "old text must be gone: {text}");
}

#[test]
fn s6_short_content_is_rejected_without_side_effects() {
    let (engine, _dir) = test_engine(true);
    call(&engine, "session_start", Value::Null);

    let error = engine
        .dispatch(
            "memory_store",
            json!({ "content": "too short", "kind": "event" }),
        )
        .expect_err("short content must be rejected");

    assert!(matches!(error, EngineError::Validation { .. }));
    let message = error.message();
    assert!(message.contains("REJECTED"), "got: {message}");
    assert!(message.contains("too short"), "got: {message}");

    let status = call(&engine, "memory_status", Value::Null);
    assert_eq!(status["tier0"]["count"], 0, "no working entry may exist");
    assert_eq!(status["vector_count"], 0, "no vector may exist");
}

#[test]
fn retrieval_footer_has_the_documented_shape() {
    let (engine, _dir) = test_engine(true);
    let started = call(&engine, "session_start", Value::Null);
    let session_id = started["new_id"].as_str().unwrap().to_string();

    call(
        &engine,
        "memory_store",
        json!({
            "content": "User maintains the billing service and owns its deployment pipeline end to end.",
            "kind": "fact",
            "entities": ["User", "billing service"],
        }),
    );

    let result = call(
        &engine,
        "memory_retrieve",
        json!({ "query": "billing service", "token_budget": 500 }),
    );
    let text = result["text"].as_str().unwrap();
    let footer = text.lines().last().unwrap();

    let prefix: String = session_id.chars().take(8).collect();
    assert!(footer.starts_with(&format!("--- Session: {prefix} | Sources: ")));
    assert!(footer.ends_with("---"));
    let used = result["budget_used"].as_u64().unwrap();
    assert!(footer.contains(&format!("| Tokens: {used}/500 ---")));
}

#[test]
fn unknown_method_is_a_not_found_error() {
    let (engine, _dir) = test_engine(true);
    let error = engine.dispatch("memory_explode", Value::Null).unwrap_err();
    assert!(matches!(error, EngineError::NotFound(_)));
}

#[test]
fn forget_unknown_id_is_a_benign_reply() {
    let (engine, _dir) = test_engine(true);
    call(&engine, "session_start", Value::Null);
    let result = call(
        &engine,
        "memory_forget",
        json!({ "memory_id": "no-such-id", "action": "delete" }),
    );
    assert!(result["reply"].as_str().unwrap().contains("No memory found"));
}

#[test]
fn correct_without_correction_is_a_caller_error() {
    let (engine, _dir) = test_engine(true);
    let error = engine
        .dispatch(
            "memory_forget",
            json!({ "memory_id": "m-1", "action": "correct" }),
        )
        .unwrap_err();
    assert!(matches!(error, EngineError::Validation { .. }));
}

#[test]
fn prompt_templates_resolve_by_name() {
    let (engine, _dir) = test_engine(true);
    let prompt = call(&engine, "prompt_get", json!({ "name": "system" }));
    assert!(prompt["reply"].as_str().unwrap().contains("memory_store"));

    let missing = call(&engine, "prompt_get", json!({ "name": "bogus" }));
    assert!(missing["reply"].as_str().unwrap().contains("No prompt template"));
}

#[test]
fn status_reports_session_and_tiers() {
    let (engine, _dir) = test_engine(true);
    let started = call(&engine, "session_start", Value::Null);

    call(
        &engine,
        "memory_store",
        json!({
            "content": "User always signs commits and requires linear history on the main branch.",
            "kind": "core",
        }),
    );

    let status = call(&engine, "memory_status", Value::Null);
    assert_eq!(status["tier3"]["count"], 1);
    assert_eq!(status["session_id"], started["new_id"]);
    assert_eq!(status["vector_count"], 1);
}
