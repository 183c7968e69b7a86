//! HTTP transport seam.
//!
//! `HttpTransport` sends one request and classifies the outcome:
//! - `Ok(HttpResponse)` for any HTTP status, including 4xx/5xx
//! - `Err(TransportError)` when no response was received
//!
//! Retry decisions live in `ResilientHttpClient`; transports only rebuild
//! their connection pool on `reset()`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::RwLock;
use std::time::Duration;

use super::multipart::MultipartForm;

const MAX_RESPONSE_BYTES: u64 = 16 * 1024 * 1024;
const ACCEPT: &str = "application/json, */*;q=0.1";

/// Status used for requests that never got a response.
pub const HARD_FAILURE_STATUS: u16 = 599;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Clone, Debug)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(MultipartForm),
}

/// One logical API call. Lives for the duration of a single client call.
#[derive(Clone, Debug)]
pub struct RetryableRequest {
    pub method: Method,
    /// Path relative to the API base, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub idempotent: bool,
    /// Non-idempotent writes only: allow one retry on 5xx.
    pub retry_server_errors: bool,
}

impl RetryableRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            idempotent: true,
            retry_server_errors: false,
        }
    }

    pub fn post(path: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body,
            idempotent: false,
            retry_server_errors: false,
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.retry_server_errors = retry;
        self
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// True for responses fabricated by the client (`HARD_FAILURE_STATUS`).
    pub synthetic: bool,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            synthetic: false,
        }
    }

    /// Stand-in for a request that was not delivered.
    pub fn hard_failure(message: impl Into<String>) -> Self {
        Self {
            status: HARD_FAILURE_STATUS,
            headers: Vec::new(),
            body: message.into().into_bytes(),
            synthetic: true,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .with_context(|| format!("parse json response (status {})", self.status))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("i/o error: {0}")]
    Io(String),
    /// The request could not be built (bad URL, unsupported scheme). Never
    /// retried.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Connection-level failure worth a session reset and one retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Invalid(_))
    }
}

pub trait HttpTransport: Send + Sync {
    fn send(
        &self,
        base_url: &str,
        request: &RetryableRequest,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, TransportError>;

    /// Drop pooled connections and start a fresh session.
    fn reset(&self);
}

/// Blocking transport over a `ureq` agent.
pub struct UreqTransport {
    timeout: Duration,
    agent: RwLock<ureq::Agent>,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            agent: RwLock::new(build_agent(timeout)),
        }
    }

    fn agent(&self) -> ureq::Agent {
        self.agent
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl HttpTransport for UreqTransport {
    fn send(
        &self,
        base_url: &str,
        request: &RetryableRequest,
        bearer: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), request.path);
        let mut req = self
            .agent()
            .request(request.method.as_str(), &url)
            .set("Accept", ACCEPT)
            .set("User-Agent", concat!("anomaly-sentinel/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = bearer {
            req = req.set("Authorization", &format!("Bearer {}", token));
        }
        for (key, value) in &request.query {
            req = req.query(key, value);
        }

        let result = match &request.body {
            RequestBody::Empty => req.call(),
            RequestBody::Json(value) => req.send_json(value),
            RequestBody::Multipart(form) => {
                let (content_type, body) = form.encode();
                req.set("Content-Type", &content_type).send_bytes(&body)
            }
        };

        match result {
            Ok(response) => into_http_response(response),
            Err(ureq::Error::Status(_, response)) => into_http_response(response),
            Err(ureq::Error::Transport(transport)) => Err(classify(&transport)),
        }
    }

    fn reset(&self) {
        let mut agent = self
            .agent
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *agent = build_agent(self.timeout);
        log::debug!("http session reset");
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn into_http_response(response: ureq::Response) -> Result<HttpResponse, TransportError> {
    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            let value = response.header(&name)?.to_string();
            Some((name, value))
        })
        .collect();
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut body)
        .map_err(io_error)?;
    Ok(HttpResponse::new(status, headers, body))
}

fn io_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportError::Timeout(err.to_string())
        }
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => TransportError::Connect(err.to_string()),
        _ => TransportError::Io(err.to_string()),
    }
}

fn classify(transport: &ureq::Transport) -> TransportError {
    let message = transport.to_string();
    match transport.kind() {
        ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
            TransportError::Invalid(message)
        }
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => {
            TransportError::Connect(message)
        }
        ureq::ErrorKind::Io if message.to_ascii_lowercase().contains("timed out") => {
            TransportError::Timeout(message)
        }
        _ => TransportError::Io(message),
    }
}
