use sandcell_core::{CompilerService, Config, RunState};
use sandcell_sandbox::ErrorKind;
use serde_json::{json, Value};

fn service() -> CompilerService {
    CompilerService::new(&Config::default())
}

fn service_from(toml: &str) -> CompilerService {
    CompilerService::new(&Config::from_toml_str(toml).unwrap())
}

fn body(reply: &sandcell_core::RunReply) -> Value {
    serde_json::to_value(&reply.body).unwrap()
}

#[tokio::test]
async fn test_success_contract() {
    let reply = service()
        .run(&json!({ "sourceCode": "console.log('hi'); ({ total: 3 })" }))
        .await;
    assert_eq!(reply.status, 200);
    assert_eq!(
        body(&reply),
        json!({ "state": "Success", "output": ["hi"], "result": { "total": 3 } })
    );
}

#[tokio::test]
async fn test_missing_code() {
    let reply = service().run(&json!({ "requestedCapabilities": [] })).await;
    assert_eq!(reply.status, 400);
    assert_eq!(
        body(&reply),
        json!({ "state": "Failed", "output": [], "error": "Code parameter is required" })
    );
}

#[tokio::test]
async fn test_blank_code_matches_missing_code() {
    let reply = service().run(&json!({ "sourceCode": "  " })).await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.kind, Some(ErrorKind::ValidationError));
    assert_eq!(body(&reply)["error"], json!("Code parameter is required"));
}

#[tokio::test]
async fn test_malformed_capabilities() {
    let reply = service()
        .run(&json!({ "sourceCode": "1", "requestedCapabilities": { "fs": true } }))
        .await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.body.state, RunState::Failed);
}

#[tokio::test]
async fn test_single_capability_string_grants_it() {
    let reply = service()
        .run(&json!({
            "sourceCode": "require('uuid').v4().length",
            "requestedCapabilities": "uuid"
        }))
        .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body.result, Some(json!(36)));
}

#[tokio::test]
async fn test_permission_error_status() {
    let reply = service()
        .run(&json!({ "sourceCode": "require('fs')" }))
        .await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.kind, Some(ErrorKind::PermissionError));
    assert_eq!(body(&reply)["error"], json!("Capability 'fs' is not permitted"));
}

#[tokio::test]
async fn test_compile_error_status() {
    let reply = service().run(&json!({ "sourceCode": "let = ;" })).await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.kind, Some(ErrorKind::CompileError));
}

#[tokio::test]
async fn test_runtime_error_keeps_logs() {
    let reply = service()
        .run(&json!({ "sourceCode": "console.log('before');\nthrow new Error('boom');" }))
        .await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.kind, Some(ErrorKind::RuntimeError));
    let body = body(&reply);
    assert_eq!(body["output"], json!(["before"]));
    assert!(body["error"].as_str().unwrap().starts_with("boom"));
}

#[tokio::test]
async fn test_timeout_status() {
    let service = service_from(
        r#"
[sandbox]
timeout_ms = 200
loop_iteration_limit = 5000000
"#,
    );
    let reply = service
        .run(&json!({ "sourceCode": "console.log('start'); while (true) {}" }))
        .await;
    assert_eq!(reply.status, 408);
    assert_eq!(reply.kind, Some(ErrorKind::TimeoutError));
    assert_eq!(body(&reply)["output"], json!(["start"]));
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let service = service();
    let first_request = json!({ "sourceCode": "globalThis.shared = 1; console.log('a'); 1" });
    let second_request = json!({ "sourceCode": "console.log('b'); typeof shared" });
    let first = service.run(&first_request);
    let second = service.run(&second_request);
    let (first, second) = tokio::join!(first, second);

    assert_eq!(body(&first)["output"], json!(["a"]));
    assert_eq!(body(&second)["output"], json!(["b"]));
    assert_eq!(second.body.result, Some(json!("undefined")));
}
