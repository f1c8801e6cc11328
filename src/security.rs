use std::{
    net::IpAddr,
    sync::LazyLock,
};

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;

pub const DEFAULT_DENYLIST: &str = "os/exec,syscall,unsafe,net,net/http,plugin";

// Matches both the block form `import ( ... )` and the single form `import "..."`.
static IMPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*import\s*(\((?:[^)]+)\)|"[^"]+")"#).expect("static import pattern")
});

/// Textual denylist over Go import declarations. First gate only; the outer
/// container is what actually confines the child process.
pub struct ImportPolicy {
    denylist: Vec<String>,
}

impl ImportPolicy {
    pub fn new(denylist: Vec<String>) -> Self {
        Self { denylist }
    }

    /// Returns the first denylisted import found in `source`, if any.
    /// Matching is byte-exact on the quoted path; no wildcard or prefix logic.
    pub fn find_blacklisted<'a>(&'a self, source: &str) -> Option<&'a str> {
        for caps in IMPORT_PATTERN.captures_iter(source) {
            let Some(stmt) = caps.get(1) else { continue };
            let stmt = stmt.as_str().replace(['(', ')'], "");

            for line in stmt.lines() {
                let name = line
                    .split("//")
                    .next()
                    .unwrap_or(line)
                    .trim()
                    .trim_matches('"');
                if name.is_empty() {
                    continue;
                }
                if let Some(hit) = self.denylist.iter().find(|entry| entry.as_str() == name) {
                    return Some(hit.as_str());
                }
            }
        }
        None
    }
}

/// Derives the admission key for a request: first non-empty of
/// `X-Forwarded-For`, `X-Real-IP`, otherwise the transport-level peer IP.
pub fn client_identity(headers: &HeaderMap, remote: IpAddr) -> String {
    for name in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    remote.to_string()
}

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}
