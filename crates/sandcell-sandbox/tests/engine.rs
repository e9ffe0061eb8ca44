use sandcell_sandbox::{
    ErrorKind, ExecutionOutcome, ExecutionRequest, Location, SandboxConfig, SandboxEngine,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

async fn run_with(config: SandboxConfig, request: ExecutionRequest) -> ExecutionOutcome {
    SandboxEngine::new(config).execute(&request).await
}

async fn run(source: &str, capabilities: &[&str]) -> ExecutionOutcome {
    let request = ExecutionRequest::new(source).with_capabilities(capabilities.iter().copied());
    run_with(SandboxConfig::default(), request).await
}

fn success(outcome: &ExecutionOutcome) -> (&[Value], &Value) {
    match outcome {
        ExecutionOutcome::Success { logs, result } => (logs.entries(), result),
        ExecutionOutcome::Failure { failure, .. } => panic!("expected success, got {failure}"),
    }
}

fn failure_kind(outcome: &ExecutionOutcome) -> ErrorKind {
    outcome.failure().expect("expected a failure").kind
}

#[tokio::test]
async fn test_logs_and_tail_expression() {
    let outcome = run(r#"console.log("a"); console.log("b"); 1 + 1"#, &[]).await;
    let (logs, result) = success(&outcome);
    assert_eq!(logs, &[json!("a"), json!("b")]);
    assert_eq!(result, &json!(2));
}

#[tokio::test]
async fn test_each_console_argument_is_one_entry() {
    let outcome = run(r#"console.info("x", 1, { k: [true] }); console.error("e"); null"#, &[]).await;
    let (logs, _) = success(&outcome);
    assert_eq!(logs, &[json!("x"), json!(1), json!({ "k": [true] }), json!("e")]);
}

#[tokio::test]
async fn test_empty_source_is_a_validation_error() {
    for source in ["", "   \n"] {
        let outcome = run(source, &["uuid", "fs"]).await;
        assert_eq!(failure_kind(&outcome), ErrorKind::ValidationError);
        assert_eq!(outcome.failure().unwrap().message, "Code parameter is required");
    }
}

#[tokio::test]
async fn test_unknown_module_is_a_permission_error() {
    let outcome = run(r#"const pad = require("nonexistent-module"); pad("x")"#, &[]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::PermissionError);
    assert!(failure.message.contains("nonexistent-module"));
    assert_eq!(failure.location, None);
}

#[tokio::test]
async fn test_failed_capability_is_a_permission_error() {
    // Requested, but `fs` cannot load without a configured root
    let outcome = run(r#"require("fs").readFileSync("a.txt")"#, &["fs"]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::PermissionError);
    assert_eq!(failure.message, "Capability 'fs' is not permitted");
}

#[tokio::test]
async fn test_ungranted_capability_is_a_permission_error() {
    let outcome = run(r#"require("uuid")"#, &[]).await;
    assert_eq!(failure_kind(&outcome), ErrorKind::PermissionError);
}

#[tokio::test]
async fn test_duplicate_requests_behave_like_one() {
    let source = r#"typeof require("uuid").v4()"#;
    let once = run(source, &["uuid"]).await;
    let twice = run(source, &["uuid", "uuid"]).await;
    assert_eq!(success(&once).1, &json!("string"));
    assert_eq!(once, twice);
}

#[tokio::test]
async fn test_thrown_permission_look_alike_is_a_runtime_error() {
    for source in [
        "throw { name: 'PermissionError', message: 'x' }",
        "const e = new Error('x'); e.name = 'PermissionError'; throw e;",
        "await 0; throw { name: 'PermissionError', message: 'x' };",
    ] {
        let outcome = run(source, &[]).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::RuntimeError, "source: {source}");
        assert_eq!(failure.message, "x");
    }
}

#[tokio::test]
async fn test_rethrown_refusal_is_still_a_permission_error() {
    let outcome = run(r#"try { require("fs"); } catch (e) { throw e; }"#, &[]).await;
    assert_eq!(failure_kind(&outcome), ErrorKind::PermissionError);
}

#[tokio::test]
async fn test_permission_error_can_be_caught() {
    let outcome = run(r#"let name; try { require("fs"); } catch (e) { name = e.name; } name"#, &[]).await;
    assert_eq!(success(&outcome).1, &json!("PermissionError"));
}

#[tokio::test]
async fn test_timeout_keeps_earlier_logs() {
    let config = SandboxConfig {
        loop_iteration_limit: 5_000_000,
        ..SandboxConfig::default()
    };
    let request = ExecutionRequest::new(r#"console.log("before"); while (true) {}"#);
    let outcome = SandboxEngine::new(config)
        .execute_with_deadline(&request, Duration::from_millis(200))
        .await;
    assert_eq!(failure_kind(&outcome), ErrorKind::TimeoutError);
    assert_eq!(outcome.logs().entries(), &[json!("before")]);
}

#[tokio::test]
async fn test_microtask_storm_stops_at_deadline() {
    let engine = SandboxEngine::new(SandboxConfig::default());
    let request = ExecutionRequest::new(
        "function f() { Promise.resolve().then(f); } f(); await new Promise(() => {});",
    );
    let outcome = engine
        .execute_with_deadline(&request, Duration::from_millis(200))
        .await;
    assert_eq!(failure_kind(&outcome), ErrorKind::TimeoutError);

    // The worker itself must wind down, not keep spinning on jobs
    let started = Instant::now();
    while engine.active_workers() > 0 {
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "worker still running after the deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_finished_executions_release_their_workers() {
    let engine = SandboxEngine::new(SandboxConfig::default());
    assert!(engine.execute(&ExecutionRequest::new("1")).await.is_success());
    let started = Instant::now();
    while engine.active_workers() > 0 {
        assert!(started.elapsed() < Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_nested_loops_hit_iteration_limit() {
    let config = SandboxConfig {
        loop_iteration_limit: 10_000,
        ..SandboxConfig::default()
    };
    let outcome = run_with(
        config,
        ExecutionRequest::new("for (;;) { for (let j = 0; j < 1; j++) {} }"),
    )
    .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::TimeoutError);
    assert!(failure.message.contains("loop iteration limit"));
}

#[tokio::test]
async fn test_recursion_after_await_is_a_runtime_error() {
    let outcome = run("await 0; function r() { return r(); } r();", &[]).await;
    assert_eq!(failure_kind(&outcome), ErrorKind::RuntimeError);
}

#[tokio::test]
async fn test_errors_mentioning_the_loop_limit_are_runtime_errors() {
    for source in [
        "null['loop iteration limit']",
        "throw new Error('Maximum loop iteration limit 10 exceeded')",
    ] {
        let outcome = run(source, &[]).await;
        assert_eq!(failure_kind(&outcome), ErrorKind::RuntimeError, "source: {source}");
    }
}

#[tokio::test]
async fn test_pending_timer_past_deadline_times_out() {
    let request = ExecutionRequest::new(
        r#"const { sleep } = require("timers"); console.log("waiting"); await sleep(10000); return 1;"#,
    );
    let outcome = SandboxEngine::new(SandboxConfig::default())
        .execute_with_deadline(&request, Duration::from_millis(150))
        .await;
    assert_eq!(failure_kind(&outcome), ErrorKind::TimeoutError);
    assert_eq!(outcome.logs().entries(), &[json!("waiting")]);
}

#[tokio::test]
async fn test_promise_that_never_settles() {
    let outcome = run("await new Promise(() => {}); return 1;", &[]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::TimeoutError);
    assert!(failure.message.contains("stalled"));
}

#[tokio::test]
async fn test_cycles_and_denylisted_fields() {
    let outcome = run(
        r#"const o = { name: "n", config: { secret: 1 }, nested: { request: {} , ok: true } };
           o.self = o;
           console.log(o);
           o"#,
        &[],
    )
    .await;
    let (logs, result) = success(&outcome);
    assert_eq!(result, &json!({ "name": "n", "nested": { "ok": true } }));
    // Console output drops the cycle but keeps denylisted fields
    assert_eq!(
        logs,
        &[json!({ "name": "n", "config": { "secret": 1 }, "nested": { "request": {}, "ok": true } })]
    );
}

#[tokio::test]
async fn test_console_keeps_denylisted_fields() {
    let outcome = run("console.log({ config: 1 }); ({ config: 1, kept: 2 })", &[]).await;
    let (logs, result) = success(&outcome);
    assert_eq!(logs, &[json!({ "config": 1 })]);
    assert_eq!(result, &json!({ "kept": 2 }));
}

#[tokio::test]
async fn test_syntax_error_is_a_compile_error() {
    for source in ["function (", "if (true) { console.log(1)", "let = ;"] {
        let outcome = run(source, &[]).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::CompileError, "source: {source}");
        assert_eq!(failure.location, None);
        assert!(!failure.message.is_empty());
    }
}

#[tokio::test]
async fn test_top_level_await_and_return() {
    let outcome = run(
        r#"const { sleep } = require("timers");
           await sleep(5);
           return "done";"#,
        &[],
    )
    .await;
    assert_eq!(success(&outcome).1, &json!("done"));
}

#[tokio::test]
async fn test_plain_script_promise_is_awaited() {
    let outcome = run("Promise.resolve(5)", &[]).await;
    assert_eq!(success(&outcome).1, &json!(5));
}

#[tokio::test]
async fn test_logs_follow_scheduling_order() {
    let outcome = run(
        r#"const { setTimeout } = require("timers");
           setTimeout(() => console.log("timeout"), 0);
           Promise.resolve().then(() => console.log("micro"));
           console.log("sync");
           await new Promise((resolve) => setTimeout(resolve, 5));
           console.log("after");
           return null;"#,
        &[],
    )
    .await;
    let (logs, _) = success(&outcome);
    assert_eq!(logs, &[json!("sync"), json!("micro"), json!("timeout"), json!("after")]);
}

#[tokio::test]
async fn test_clear_timeout() {
    let outcome = run(
        r#"const { setTimeout, clearTimeout } = require("timers");
           const id = setTimeout(() => console.log("never"), 1);
           clearTimeout(id);
           await new Promise((resolve) => setTimeout(resolve, 10));
           return "cleared";"#,
        &[],
    )
    .await;
    let (logs, result) = success(&outcome);
    assert!(logs.is_empty());
    assert_eq!(result, &json!("cleared"));
}

#[tokio::test]
async fn test_cleared_timer_does_not_hold_the_loop_open() {
    let started = Instant::now();
    let outcome = run(
        r#"const { setTimeout, clearTimeout } = require("timers");
           clearTimeout(setTimeout(() => {}, 60000));
           await new Promise(() => {});"#,
        &[],
    )
    .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::TimeoutError);
    assert!(failure.message.contains("stalled"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_thrown_error_is_a_runtime_error() {
    let outcome = run(r#"console.log("start"); throw new Error("boom");"#, &[]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert_eq!(failure.message, "boom");
    assert_eq!(outcome.logs().entries(), &[json!("start")]);
}

#[tokio::test]
async fn test_thrown_error_location() {
    let outcome = run("let a = 1;\nlet b = 2;\nthrow new Error('boom');", &[]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert_eq!(failure.location, Some(Location { line: 3 }));
}

#[tokio::test]
async fn test_async_error_location_is_in_caller_lines() {
    let outcome = run("await 0;\nlet b = 2;\nnull.x;", &[]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert_eq!(failure.location, Some(Location { line: 3 }));
}

#[tokio::test]
async fn test_engine_errors_are_runtime_errors() {
    let outcome = run("undefinedFunction()", &[]).await;
    assert_eq!(failure_kind(&outcome), ErrorKind::RuntimeError);
}

#[tokio::test]
async fn test_rejection_with_primitive() {
    let outcome = run(r#"await null; throw "bad input";"#, &[]).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert_eq!(failure.message, "bad input");
}

#[tokio::test]
async fn test_throwing_timer_callback() {
    let outcome = run(
        r#"const { setTimeout, sleep } = require("timers");
           setTimeout(() => { throw new TypeError("late"); }, 0);
           await sleep(20);
           return 1;"#,
        &[],
    )
    .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert_eq!(failure.message, "late");
}

#[tokio::test]
async fn test_no_ambient_host_objects() {
    let outcome = run(
        "[typeof process, typeof fetch, typeof setTimeout, typeof module].join(',')",
        &[],
    )
    .await;
    assert_eq!(
        success(&outcome).1,
        &json!("undefined,undefined,undefined,undefined")
    );
}

#[tokio::test]
async fn test_path_module() {
    let outcome = run(
        r#"const path = require("path");
           [path.join("/a", "b", "../c"), path.basename("/x/y.txt", ".txt"), path.extname("f.tar.gz"), path.sep]"#,
        &[],
    )
    .await;
    assert_eq!(success(&outcome).1, &json!(["/a/c", "y", ".gz", "/"]));
}

#[tokio::test]
async fn test_uuid_module() {
    let outcome = run(r#"require("uuid").v4()"#, &["uuid"]).await;
    let id = success(&outcome).1.as_str().unwrap().to_string();
    assert_eq!(id.len(), 36);
    assert_eq!(id.chars().nth(14), Some('4'));
}

#[tokio::test]
async fn test_fs_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        fs_root: Some(dir.path().to_path_buf()),
        ..SandboxConfig::default()
    };
    let request = ExecutionRequest::new(
        r#"const fs = require("fs");
           fs.mkdirSync("notes");
           fs.writeFileSync("notes/b.txt", "bee");
           fs.writeFileSync("/notes/a.txt", "hello");
           fs.appendFileSync("notes/a.txt", " world");
           [fs.readFileSync("notes/a.txt", "utf8"), fs.readdirSync("notes"), fs.existsSync("missing")]"#,
    )
    .with_capability("fs");
    let outcome = run_with(config, request).await;
    assert_eq!(
        success(&outcome).1,
        &json!(["hello world", ["a.txt", "b.txt"], false])
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/a.txt")).unwrap(),
        "hello world"
    );
}

#[tokio::test]
async fn test_fs_cannot_escape_root() {
    let dir = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        fs_root: Some(dir.path().to_path_buf()),
        ..SandboxConfig::default()
    };
    let request = ExecutionRequest::new(r#"require("fs").readFileSync("../../etc/passwd")"#)
        .with_capability("fs");
    let outcome = run_with(config, request).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::PermissionError);
    assert!(failure.message.contains("escapes"));
}

#[tokio::test]
async fn test_fs_write_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        fs_root: Some(dir.path().to_path_buf()),
        max_write_bytes: 8,
        ..SandboxConfig::default()
    };
    let request = ExecutionRequest::new(r#"require("fs").writeFileSync("big.txt", "x".repeat(9))"#)
        .with_capability("fs");
    let outcome = run_with(config, request).await;
    assert_eq!(failure_kind(&outcome), ErrorKind::RuntimeError);
    assert!(!dir.path().join("big.txt").exists());
}

#[tokio::test]
async fn test_http_host_outside_allowlist() {
    let mut config = SandboxConfig::default();
    config.http.allowed_hosts = vec!["api.example.test".to_string()];
    let request = ExecutionRequest::new(
        r#"const http = require("http");
           const response = await http.get("http://127.0.0.1:9/data");
           return response.status;"#,
    )
    .with_capability("http");
    let outcome = run_with(config, request).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::PermissionError);
    assert_eq!(failure.message, "Host '127.0.0.1' is not permitted");
}

#[tokio::test]
async fn test_fetch_rejects_unsupported_protocol() {
    let outcome = run(
        r#"const fetch = require("fetch");
           try { await fetch("file:///etc/passwd"); } catch (e) { return e.message; }"#,
        &["fetch"],
    )
    .await;
    assert_eq!(success(&outcome).1, &json!("Unsupported protocol file:"));
}

#[tokio::test]
async fn test_oversized_result() {
    let config = SandboxConfig {
        max_result_bytes: 64,
        ..SandboxConfig::default()
    };
    let outcome = run_with(config, ExecutionRequest::new(r#""x".repeat(1000)"#)).await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert!(failure.message.contains("64 byte limit"));
}

#[tokio::test]
async fn test_log_entry_ceiling() {
    let config = SandboxConfig {
        max_log_entries: 2,
        ..SandboxConfig::default()
    };
    let outcome = run_with(
        config,
        ExecutionRequest::new("for (let i = 0; i < 5; i++) console.log(i); 'ok'"),
    )
    .await;
    let logs = outcome.logs();
    assert_eq!(logs.entries(), &[json!(0), json!(1)]);
    assert_eq!(logs.dropped(), 3);
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_executions_are_isolated() {
    let engine = SandboxEngine::new(SandboxConfig::default());
    let first = engine
        .execute(&ExecutionRequest::new("globalThis.leak = 42; Object.prototype.polluted = true; 1"))
        .await;
    assert!(first.is_success());
    let second = engine
        .execute(&ExecutionRequest::new("[typeof leak, ({}).polluted === undefined]"))
        .await;
    assert_eq!(success(&second).1, &json!(["undefined", true]));
}

#[tokio::test]
async fn test_tampered_builtins_do_not_break_settlement() {
    let outcome = run(
        r#"Promise.prototype.then = () => { throw new Error("nope"); };
           Object.keys = () => [];
           ({ a: 1 })"#,
        &[],
    )
    .await;
    assert_eq!(success(&outcome).1, &json!({ "a": 1 }));
}
