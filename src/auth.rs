//! Viewer authorization
//!
//! When token authorization is enabled every viewer request is checked
//! against a remote backend, which answers `{"status": "1"}` to allow it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TokenConfig;

const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// What the backend gets to decide on.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    pub proto: &'a str,
    pub stream: &'a str,
    pub channel: &'a str,
    pub token: &'a str,
    pub ip: &'a str,
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &AuthRequest<'_>) -> bool;
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("authorization backend answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    status: serde_json::Value,
}

impl AuthResponse {
    fn allowed(&self) -> bool {
        match &self.status {
            serde_json::Value::String(s) => s == "1",
            serde_json::Value::Number(n) => n.as_u64() == Some(1),
            _ => false,
        }
    }
}

/// Asks a remote HTTP backend. Without a backend every request is allowed.
pub struct RemoteAuthorizer {
    backend: Option<String>,
    client: reqwest::blocking::Client,
}

impl RemoteAuthorizer {
    pub fn new(config: &TokenConfig) -> Result<Self, AuthError> {
        let backend = (config.enable && !config.backend.is_empty()).then(|| config.backend.clone());
        let client = reqwest::blocking::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()?;
        Ok(Self { backend, client })
    }

    fn ask(&self, backend: &str, request: &AuthRequest<'_>) -> Result<bool, AuthError> {
        let response = self.client.post(backend).json(request).send()?;
        if !response.status().is_success() {
            return Err(AuthError::Status(response.status()));
        }
        let answer: AuthResponse = response.json()?;
        Ok(answer.allowed())
    }
}

impl Authorizer for RemoteAuthorizer {
    fn authorize(&self, request: &AuthRequest<'_>) -> bool {
        let Some(backend) = &self.backend else {
            return true;
        };

        match self.ask(backend, request) {
            Ok(allowed) => {
                debug!(stream = request.stream, channel = request.channel, allowed, "Authorization answered");
                allowed
            }
            Err(e) => {
                warn!(stream = request.stream, channel = request.channel, "Authorization failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouille::{Response, Server};

    fn request<'a>(token: &'a str) -> AuthRequest<'a> {
        AuthRequest {
            proto: "WebRTC",
            stream: "demo",
            channel: "0",
            token,
            ip: "127.0.0.1",
        }
    }

    #[test]
    fn disabled_allows_everything() {
        let authorizer = RemoteAuthorizer::new(&TokenConfig::default()).unwrap();
        assert!(authorizer.authorize(&request("")));
    }

    #[test]
    fn backend_decides_by_status() {
        let server = Server::new("127.0.0.1:0", |request| {
            let body: serde_json::Value = match rouille::input::json_input(request) {
                Ok(body) => body,
                Err(_) => return Response::empty_400(),
            };
            let status = if body["token"] == "good" && body["proto"] == "WebRTC" {
                "1"
            } else {
                "0"
            };
            Response::json(&serde_json::json!({ "status": status, "payload": "" }))
        })
        .unwrap();
        let addr = server.server_addr();
        let (handle, stop) = server.stoppable();

        let authorizer = RemoteAuthorizer::new(&TokenConfig {
            enable: true,
            backend: format!("http://{addr}/auth"),
        })
        .unwrap();

        assert!(authorizer.authorize(&request("good")));
        assert!(!authorizer.authorize(&request("bad")));

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn untrusted_certificate_denies() {
        let server = Server::new_ssl(
            "127.0.0.1:0",
            |_request| Response::json(&serde_json::json!({ "status": "1", "payload": "" })),
            include_bytes!("../testdata/self_signed_cert.pem").to_vec(),
            include_bytes!("../testdata/self_signed_key.pem").to_vec(),
        )
        .unwrap();
        let addr = server.server_addr();
        let (handle, stop) = server.stoppable();

        let authorizer = RemoteAuthorizer::new(&TokenConfig {
            enable: true,
            backend: format!("https://{addr}/auth"),
        })
        .unwrap();

        // The backend would allow, but it cannot prove who it is.
        assert!(!authorizer.authorize(&request("good")));

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn unreachable_backend_denies() {
        let authorizer = RemoteAuthorizer::new(&TokenConfig {
            enable: true,
            backend: "http://127.0.0.1:1/auth".to_string(),
        })
        .unwrap();
        assert!(!authorizer.authorize(&request("good")));
    }
}
