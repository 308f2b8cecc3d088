//! Reflector and curator over HTTP against a local stand-in provider

use ace_service::config::LlmConfig;
use ace_service::types::Reflection;
use ace_service::{
    CapabilityError, Curator, CuratorInput, LlmCapabilities, Operation, Reflector, ReflectorInput,
};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct FakeProvider {
    status: StatusCode,
    reply: Value,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn chat_completions(
    State(fake): State<FakeProvider>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.requests.lock().unwrap().push(body);
    (fake.status, Json(fake.reply.clone()))
}

/// Serve one canned reply; returns a config pointing at it and the request log
async fn serve(status: StatusCode, reply: Value) -> (LlmConfig, Arc<Mutex<Vec<Value>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(FakeProvider {
            status,
            reply,
            requests: requests.clone(),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = LlmConfig {
        base_url: format!("http://{addr}/v1"),
        reflector_model: Some("reflect-model".into()),
        curator_model: Some("curate-model".into()),
        api_key: Some("test-key".into()),
        ..LlmConfig::default()
    };
    (config, requests)
}

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

fn reflector_input(retrieved_playbook: &str) -> ReflectorInput {
    ReflectorInput {
        playbook_id: "pb".into(),
        retrieved_playbook: retrieved_playbook.into(),
        trajectory: "$ make test\n2 failed".into(),
        ground_truth: None,
        evaluation: Some("2 tests failed".into()),
        additional_instructions: None,
    }
}

fn reflection_json(tags: Value) -> String {
    json!({
        "reasoning": "The agent skipped the setup step",
        "error_identification": "Tests ran without fixtures",
        "root_cause_analysis": "Fixtures are generated by make setup",
        "correct_approach": "Run make setup first",
        "key_insight": "Generate fixtures before testing",
        "bullet_tags": tags
    })
    .to_string()
}

#[tokio::test]
async fn reflect_parses_structured_reply() {
    let (config, requests) = serve(StatusCode::OK, completion(&reflection_json(json!([])))).await;
    let capabilities = LlmCapabilities::from_config(&config);

    let reflection = capabilities.reflect(&reflector_input("(None)")).await.unwrap();
    assert_eq!(reflection.key_insight, "Generate fixtures before testing");

    let sent = requests.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "reflect-model");
    assert_eq!(sent["response_format"]["type"], "json_object");
    let prompt = sent["messages"][1]["content"].as_str().unwrap();
    assert!(prompt.contains("make test"));
    assert!(prompt.contains("2 tests failed"));
}

#[tokio::test]
async fn fenced_reply_is_accepted() {
    let fenced = format!("```json\n{}\n```", reflection_json(json!([])));
    let (config, _) = serve(StatusCode::OK, completion(&fenced)).await;

    let reflection: Reflection = LlmCapabilities::from_config(&config)
        .reflect(&reflector_input("(None)"))
        .await
        .unwrap();
    assert_eq!(reflection.correct_approach, "Run make setup first");
}

#[tokio::test]
async fn tag_for_unseen_bullet_is_invalid() {
    let reply = reflection_json(json!([{"id": "ghost-bullet", "tag": "harmful"}]));
    let (config, _) = serve(StatusCode::OK, completion(&reply)).await;

    let err = LlmCapabilities::from_config(&config)
        .reflect(&reflector_input("- [real-bullet] helpful=0 harmful=0 :: Run make setup"))
        .await
        .unwrap_err();
    match err {
        CapabilityError::Invalid { capability, message } => {
            assert_eq!(capability, "reflector");
            assert!(message.contains("ghost-bullet"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn provider_error_is_transport_failure() {
    let (config, _) = serve(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": {"message": "overloaded"}}),
    )
    .await;

    let err = LlmCapabilities::from_config(&config)
        .reflect(&reflector_input("(None)"))
        .await
        .unwrap_err();
    match err {
        CapabilityError::Transport { message, .. } => {
            assert!(message.contains("503"));
            assert!(message.contains("overloaded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn non_json_reply_is_malformed() {
    let (config, _) = serve(StatusCode::OK, completion("I could not decide.")).await;

    let err = LlmCapabilities::from_config(&config)
        .reflect(&reflector_input("(None)"))
        .await
        .unwrap_err();
    assert!(matches!(err, CapabilityError::Malformed { .. }));
}

#[tokio::test]
async fn curate_returns_operations() {
    let reply = json!({
        "reasoning": "One new lesson, one outdated",
        "operations": [
            {"type": "ADD", "content": "Run make setup before make test"},
            {"type": "REMOVE", "bullet_id": "old-1"}
        ]
    })
    .to_string();
    let (config, requests) = serve(StatusCode::OK, completion(&reply)).await;

    let reflection: Reflection = serde_json::from_str(&reflection_json(json!([]))).unwrap();
    let input = CuratorInput {
        playbook_id: "pb".into(),
        user_message: "Fix the failing tests".into(),
        global_playbook: "- [old-1] helpful=0 harmful=3 :: Skip setup to save time".into(),
        trajectory: "$ make test".into(),
        reflection,
        additional_instructions: Some("Keep bullets under 20 words".into()),
    };

    let curation = LlmCapabilities::from_config(&config).curate(&input).await.unwrap();
    assert_eq!(curation.operations.len(), 2);
    assert!(matches!(&curation.operations[1], Operation::Remove { bullet_id } if bullet_id == "old-1"));

    let sent = requests.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "curate-model");
    let prompt = sent["messages"][1]["content"].as_str().unwrap();
    assert!(prompt.contains("Keep bullets under 20 words"));
    assert!(prompt.contains("Fix the failing tests"));
}
