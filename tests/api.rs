use std::{
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::connect_info::ConnectInfo,
    http::{Method, Request, StatusCode, header},
};
use tower::ServiceExt;

use playground_gateway::{
    config::{Config, split_csv},
    executor::{CachedExecutor, CodeExecutor, GoExecutor, TRUNCATION_MARKER},
    handlers::{AppState, routes},
    limiter::ClientRateLimiter,
    security::{DEFAULT_DENYLIST, ImportPolicy},
};

fn write_runner(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-go");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

struct TestGateway {
    app: Router,
    _dir: tempfile::TempDir,
}

fn gateway(runner_script: &str, max_requests: u32, max_output: usize) -> TestGateway {
    gateway_with_timeout(runner_script, max_requests, max_output, Duration::from_secs(5))
}

fn gateway_with_timeout(
    runner_script: &str,
    max_requests: u32,
    max_output: usize,
    execution_timeout: Duration,
) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let temp_dir = dir.path().join("scratch");
    std::fs::create_dir_all(&temp_dir).unwrap();
    let static_dir = dir.path().join("static");
    std::fs::create_dir_all(&static_dir).unwrap();
    std::fs::write(static_dir.join("index.html"), "<html>playground</html>").unwrap();

    let config = Arc::new(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        debug_mode: false,
        static_files_dir: static_dir,
        max_requests_per_minute: max_requests,
        max_code_length: 1000,
        max_output_length: max_output,
        execution_timeout,
        allowed_origins: vec!["*".to_string()],
        go_executable_path: write_runner(dir.path(), runner_script),
        temp_dir: temp_dir.clone(),
        cleanup_interval: Duration::from_secs(3600),
        max_cache_size: 8,
        cache_ttl: Duration::from_secs(600),
        blacklisted_imports: split_csv(DEFAULT_DENYLIST),
        log_level: "info".to_string(),
        log_format: "text".to_string(),
    });

    let limiter = Arc::new(ClientRateLimiter::new(config.max_requests_per_minute));
    let policy = Arc::new(ImportPolicy::new(config.blacklisted_imports.clone()));
    let runner = Arc::new(GoExecutor::new(
        config.go_executable_path.clone(),
        temp_dir,
        config.max_output_length,
    ));
    let executor: Arc<dyn CodeExecutor> = Arc::new(CachedExecutor::new(
        runner,
        config.max_cache_size,
        config.cache_ttl,
    ));

    let app = routes(AppState {
        config,
        limiter,
        policy,
        executor,
    });

    TestGateway { app, _dir: dir }
}

fn with_peer(mut request: Request<Body>, ip: [u8; 4]) -> Request<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
    request
}

fn post_json(body: &str, ip: [u8; 4]) -> Request<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/execute")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    with_peer(request, ip)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn streams_child_output_with_security_headers() {
    let gw = gateway("echo 'Hello, World!'", 30, 10_000);
    let body = r#"{"code":"package main\nfunc main() {}"}"#;

    let response = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    assert_eq!(
        response.headers().get("content-security-policy").unwrap(),
        "default-src 'self'"
    );

    assert_eq!(body_string(response).await, "Hello, World!\n");
}

#[tokio::test]
async fn rejects_blacklisted_imports_inline() {
    let gw = gateway("echo should-not-run", 30, 10_000);
    let body = r#"{"code":"package main\nimport \"os/exec\"\nfunc main() {}"}"#;

    let response = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "Error: Import prohibido por seguridad: os/exec"
    );
}

#[tokio::test]
async fn rate_limits_the_third_request() {
    let gw = gateway("echo ok", 2, 10_000);
    let body = r#"{"code":"package main"}"#;

    for _ in 0..2 {
        let response = gw.app.clone().oneshot(post_json(body, [10, 0, 0, 9])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = gw.app.clone().oneshot(post_json(body, [10, 0, 0, 9])).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert!(body_string(response).await.starts_with("Demasiadas peticiones"));
}

#[tokio::test]
async fn rate_limit_is_per_client() {
    let gw = gateway("echo ok", 1, 10_000);
    let body = r#"{"code":"package main"}"#;

    let first = gw.app.clone().oneshot(post_json(body, [10, 0, 0, 1])).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let denied = gw.app.clone().oneshot(post_json(body, [10, 0, 0, 1])).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = gw.app.clone().oneshot(post_json(body, [10, 0, 0, 2])).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_for_header_defines_the_client() {
    let gw = gateway("echo ok", 1, 10_000);
    let body = r#"{"code":"package main"}"#;

    let mut first = post_json(body, [10, 0, 0, 1]);
    first.headers_mut().insert("x-forwarded-for", "1.1.1.1".parse().unwrap());
    assert_eq!(gw.app.clone().oneshot(first).await.unwrap().status(), StatusCode::OK);

    // Same peer IP, different forwarded identity: fresh bucket.
    let mut second = post_json(body, [10, 0, 0, 1]);
    second.headers_mut().insert("x-forwarded-for", "2.2.2.2".parse().unwrap());
    assert_eq!(gw.app.clone().oneshot(second).await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn requires_json_content_type() {
    let gw = gateway("echo ok", 30, 10_000);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/execute")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"code":"x"}"#))
        .unwrap();

    let response = gw.app.clone().oneshot(with_peer(request, [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        body_string(response).await,
        "Content-Type debe ser application/json"
    );
}

#[tokio::test]
async fn rejects_malformed_bodies() {
    let gw = gateway("echo ok", 30, 10_000);

    let response = gw.app.clone().oneshot(post_json("{not json", [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "Solicitud inválida");
}

#[tokio::test]
async fn rejects_empty_code_inline() {
    let gw = gateway("echo ok", 30, 10_000);

    let response = gw
        .app
        .clone()
        .oneshot(post_json(r#"{"code":""}"#, [127, 0, 0, 1]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "Error: El código no puede estar vacío"
    );
}

#[tokio::test]
async fn missing_code_key_reads_as_empty_code() {
    let gw = gateway("echo ok", 30, 10_000);

    let response = gw.app.clone().oneshot(post_json("{}", [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "Error: El código no puede estar vacío"
    );
}

#[tokio::test]
async fn rejects_oversized_code_inline() {
    let gw = gateway("echo ok", 30, 10_000);
    let code = "A".repeat(2000);
    let body = format!(r#"{{"code":"{code}"}}"#);

    let response = gw.app.clone().oneshot(post_json(&body, [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "Error: El código excede el límite de 1000 bytes"
    );
}

#[tokio::test]
async fn non_post_methods_are_rejected() {
    let gw = gateway("echo ok", 30, 10_000);
    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/execute")
        .body(Body::empty())
        .unwrap();

    let response = gw.app.clone().oneshot(with_peer(request, [127, 0, 0, 1])).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn truncates_long_output_and_appends_the_marker() {
    let gw = gateway("head -c 300 /dev/zero | tr '\\0' 'A'", 30, 64);
    let body = r#"{"code":"package main"}"#;

    let response = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();
    let output = body_string(response).await;

    assert_eq!(output.len(), 64 + TRUNCATION_MARKER.len());
    assert!(output.ends_with(TRUNCATION_MARKER));
}

#[tokio::test]
async fn trailing_error_line_follows_streamed_output() {
    let gw = gateway("echo salida; exit 2", 30, 10_000);
    let body = r#"{"code":"package main"}"#;

    let response = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let output = body_string(response).await;
    assert!(output.starts_with("salida\n"));
    assert!(output.contains("\nError: "));
}

#[tokio::test]
async fn timed_out_runs_report_an_error_promptly() {
    let gw = gateway_with_timeout("sleep 30", 30, 10_000, Duration::from_secs(1));
    let body = r#"{"code":"package main"}"#;

    let started = std::time::Instant::now();
    let response = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();
    let output = body_string(response).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(output.contains("\nError: "));
}

#[tokio::test]
async fn identical_submissions_replay_from_cache() {
    // The runner emits a nanosecond timestamp, so a replay is only
    // byte-identical when it never reruns the child.
    let gw = gateway("date +%s%N", 30, 10_000);
    let body = r#"{"code":"package main\nfunc main() {}"}"#;

    let first = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();
    let first = body_string(first).await;
    let second = gw.app.clone().oneshot(post_json(body, [127, 0, 0, 1])).await.unwrap();
    let second = body_string(second).await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn unknown_paths_fall_back_to_index_html() {
    let gw = gateway("echo ok", 30, 10_000);
    let request = Request::builder()
        .method(Method::GET)
        .uri("/editor/some/route")
        .body(Body::empty())
        .unwrap();

    let response = gw.app.clone().oneshot(with_peer(request, [127, 0, 0, 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(body_string(response).await, "<html>playground</html>");
}
