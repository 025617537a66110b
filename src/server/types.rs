//! HTTP surface types

use serde::{Deserialize, Serialize};

/// Body of `POST /apps/{id}/generate`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateBody {
    pub owner_id: String,
    pub message: String,
}

/// JSON error body
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_streams: usize,
}

/// A parsed inbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Routes served by the generation server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Generate(String),
    Stop(String),
    Status(String),
    Health,
    NotFound,
    MethodNotAllowed,
}

impl Route {
    pub fn resolve(method: &str, path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match segments.as_slice() {
            ["health"] => match method {
                "GET" => Route::Health,
                _ => Route::MethodNotAllowed,
            },
            ["apps", id, action] if !id.is_empty() => match (method, *action) {
                ("POST", "generate") => Route::Generate(id.to_string()),
                ("POST", "stop") => Route::Stop(id.to_string()),
                ("GET", "status") => Route::Status(id.to_string()),
                (_, "generate" | "stop" | "status") => Route::MethodNotAllowed,
                _ => Route::NotFound,
            },
            _ => Route::NotFound,
        }
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        402 => "Payment Required",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_routes() {
        assert_eq!(
            Route::resolve("POST", "/apps/app-1/generate"),
            Route::Generate("app-1".into())
        );
        assert_eq!(Route::resolve("POST", "/apps/app-1/stop"), Route::Stop("app-1".into()));
        assert_eq!(
            Route::resolve("GET", "/apps/app-1/status?poll=1"),
            Route::Status("app-1".into())
        );
        assert_eq!(Route::resolve("GET", "/health"), Route::Health);
        assert_eq!(Route::resolve("GET", "/apps/app-1/generate"), Route::MethodNotAllowed);
        assert_eq!(Route::resolve("GET", "/apps/app-1/other"), Route::NotFound);
        assert_eq!(Route::resolve("GET", "/"), Route::NotFound);
    }
}
