use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use tokio::{
    sync::mpsc,
    time::Instant,
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
};
use uuid::Uuid;

use crate::{
    config::Config,
    error::GatewayError,
    executor::{ChannelSink, CodeExecutor, OutputSink},
    limiter::ClientRateLimiter,
    security::{self, ImportPolicy},
};

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    // A missing key decodes as "" and is rejected as empty code.
    #[serde(default)]
    pub code: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<ClientRateLimiter>,
    pub policy: Arc<ImportPolicy>,
    pub executor: Arc<dyn CodeExecutor>,
}

pub fn routes(state: AppState) -> Router {
    let static_root = state.config.static_files_dir.clone();
    let index = static_root.join("index.html");

    // Headroom over the code limit for JSON escaping in the request body.
    let body_limit = state
        .config
        .max_code_length
        .saturating_mul(6)
        .saturating_add(1024);

    Router::new()
        .route("/api/execute", post(execute_code))
        .fallback_service(ServeDir::new(&static_root).fallback(ServeFile::new(index)))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&state.config.allowed_origins))
        .layer(middleware::from_fn(security::security_headers))
        .layer(middleware::from_fn(request_log))
        .with_state(state)
}

async fn execute_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client = security::client_identity(&headers, addr.ip());

    let decision = state.limiter.check(&client).await;
    if !decision.allowed {
        let err = GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        };
        tracing::warn!(client = %client, error = err.code(), "rate limit exceeded");
        return err.into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return GatewayError::UnsupportedMediaType.into_response();
    }

    let request: CodeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(client = %client, error = %err, "failed to decode execution request");
            return GatewayError::InvalidBody.into_response();
        }
    };

    if request.code.is_empty() {
        return inline_error("Error: El código no puede estar vacío".to_string());
    }
    if request.code.len() > state.config.max_code_length {
        return inline_error(format!(
            "Error: El código excede el límite de {} bytes",
            state.config.max_code_length
        ));
    }
    if let Some(import) = state.policy.find_blacklisted(&request.code) {
        tracing::warn!(client = %client, import, "blacklisted import rejected");
        return inline_error(format!("Error: Import prohibido por seguridad: {import}"));
    }

    // From here on the stream is committed; any executor failure surfaces as
    // a trailing inline line on the body.
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let executor = Arc::clone(&state.executor);
    let timeout = state.config.execution_timeout;
    let code = request.code;
    let task_client = client.clone();
    tokio::spawn(async move {
        let deadline = Instant::now() + timeout;
        let mut sink = ChannelSink::new(tx);
        if let Err(err) = executor.execute(&code, deadline, &mut sink).await {
            if err.is_timeout() {
                tracing::warn!(
                    client = %task_client,
                    path = "/api/execute",
                    timeout_secs = timeout.as_secs(),
                    "execution timed out"
                );
            } else {
                tracing::error!(
                    client = %task_client,
                    path = "/api/execute",
                    error = %err,
                    "execution failed"
                );
            }
            let _ = sink.write_chunk(format!("\nError: {err}").as_bytes()).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }
    response
}

fn inline_error(message: String) -> Response {
    (StatusCode::OK, message).into_response()
}

async fn request_log(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = %response.status(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(allowed)
    }
}
