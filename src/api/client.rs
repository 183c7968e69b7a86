//! Resilient client for the remote anomaly API.
//!
//! Every call goes through `execute()`, which applies the retry policy in a
//! fixed order, at most one retry per category:
//! 1. transport failure: reset the session and retry; a second failure
//!    becomes a synthetic 599 response
//! 2. 401: re-authenticate (coalesced across threads) and retry
//! 3. 429: sleep for `Retry-After` (clamped to 1..=10s, default 1s) and retry
//! 4. 5xx: retry writes marked `retry_server_errors`, and idempotent reads
//!    that got 502/503/504
//!
//! `execute()` never fails; callers decide by status range.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::multipart::{FilePart, MultipartForm};
use super::transport::{
    HttpResponse, HttpTransport, RequestBody, RetryableRequest, TransportError, UreqTransport,
    HARD_FAILURE_STATUS,
};
use crate::detect::DetectionCandidate;

pub const MAX_PAGE_SIZE: usize = 500;
const RETRY_AFTER_MIN_SECS: u64 = 1;
const RETRY_AFTER_MAX_SECS: u64 = 10;

/// Connection settings for one client.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub base_url: String,
    pub login: String,
    pub password: String,
    pub client_id: String,
    pub timeout: Duration,
}

/// Current bearer credential. Replaced wholesale on re-authentication.
#[derive(Clone, Debug, Default)]
pub struct AuthSession {
    pub token: Option<String>,
    /// Incremented on every token exchange.
    pub generation: u64,
    /// Login the token was issued for.
    pub issued_for: Option<String>,
}

pub struct ResilientHttpClient {
    settings: ClientSettings,
    transport: Box<dyn HttpTransport>,
    auth: Mutex<AuthSession>,
}

impl ResilientHttpClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let timeout = settings.timeout;
        Self::with_transport(settings, Box::new(UreqTransport::new(timeout)))
    }

    pub fn with_transport(settings: ClientSettings, transport: Box<dyn HttpTransport>) -> Result<Self> {
        for (name, value) in [
            ("url", &settings.base_url),
            ("login", &settings.login),
            ("password", &settings.password),
            ("client id", &settings.client_id),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("api {} must not be empty", name));
            }
        }
        let mut settings = settings;
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            settings,
            transport,
            auth: Mutex::new(AuthSession::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    pub fn auth_session(&self) -> AuthSession {
        self.lock_auth().clone()
    }

    fn lock_auth(&self) -> MutexGuard<'_, AuthSession> {
        self.auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- Authentication ----

    /// Exchange credentials for a bearer token.
    pub fn authenticate(&self) -> Result<()> {
        let mut session = self.lock_auth();
        self.exchange_credentials(&mut session)
    }

    /// Re-authenticate after a 401 seen with token generation `seen`. When
    /// another caller already refreshed the token, reuse theirs.
    fn reauthenticate(&self, seen: u64) {
        let mut session = self.lock_auth();
        if session.generation != seen && session.token.is_some() {
            log::debug!("token already refreshed by another caller");
            return;
        }
        if let Err(err) = self.exchange_credentials(&mut session) {
            log::error!("re-authentication failed: {:#}", err);
        }
    }

    /// Runs with the auth lock held, so concurrent exchanges cannot interleave.
    fn exchange_credentials(&self, session: &mut AuthSession) -> Result<()> {
        let request = RetryableRequest::post(
            "/token",
            RequestBody::Json(json!({
                "login": self.settings.login,
                "senha": self.settings.password,
                "idCliente": self.settings.client_id,
            })),
        );
        session.generation += 1;
        let response = match self.transport.send(&self.settings.base_url, &request, None) {
            Ok(response) => response,
            Err(err) => {
                *session = AuthSession {
                    generation: session.generation,
                    ..AuthSession::default()
                };
                return Err(anyhow!("authentication request failed: {}", err));
            }
        };
        if response.status != 200 {
            session.token = None;
            return Err(anyhow!(
                "authentication rejected ({}): {}",
                response.status,
                response.text()
            ));
        }
        let token = response
            .json::<Value>()
            .ok()
            .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
            .filter(|token| !token.is_empty());
        match token {
            Some(token) => {
                *session = AuthSession {
                    token: Some(token),
                    generation: session.generation,
                    issued_for: Some(self.settings.login.clone()),
                };
                log::info!("authenticated against {}", self.settings.base_url);
                Ok(())
            }
            None => {
                session.token = None;
                Err(anyhow!("token missing from /token response: {}", response.text()))
            }
        }
    }

    // ---- Retry pipeline ----

    fn send_once(&self, request: &RetryableRequest) -> (Result<HttpResponse, TransportError>, u64) {
        let (token, generation) = {
            let session = self.lock_auth();
            (session.token.clone(), session.generation)
        };
        let result = self
            .transport
            .send(&self.settings.base_url, request, token.as_deref());
        (result, generation)
    }

    /// Send without a transport retry; a transport failure becomes a 599.
    fn resend(&self, request: &RetryableRequest, after: &str) -> (HttpResponse, u64) {
        match self.send_once(request) {
            (Ok(response), generation) => (response, generation),
            (Err(err), generation) => {
                log::error!(
                    "{} {} failed after {}: {}",
                    request.method.as_str(),
                    request.path,
                    after,
                    err
                );
                (HttpResponse::hard_failure(err.to_string()), generation)
            }
        }
    }

    /// Apply the retry policy. Never returns an error: undelivered requests
    /// come back as a synthetic 599.
    pub fn execute(&self, request: &RetryableRequest) -> HttpResponse {
        let (mut response, generation) = match self.send_once(request) {
            (Ok(response), generation) => (response, generation),
            (Err(err), _) if !err.is_retryable() => {
                log::error!("{} {} not sent: {}", request.method.as_str(), request.path, err);
                return HttpResponse::hard_failure(err.to_string());
            }
            (Err(err), _) => {
                log::warn!(
                    "{} {} transport failure, resetting session: {}",
                    request.method.as_str(),
                    request.path,
                    err
                );
                self.transport.reset();
                let (response, generation) = self.resend(request, "session reset");
                if response.synthetic {
                    return response;
                }
                (response, generation)
            }
        };

        if response.status == 401 {
            log::warn!("401 on {}; re-authenticating", request.path);
            self.reauthenticate(generation);
            (response, _) = self.resend(request, "re-authentication");
            if response.synthetic {
                return response;
            }
        }

        if response.status == 429 {
            let delay = retry_after_delay(response.header("Retry-After"));
            log::warn!("429 on {}; retrying in {:?}", request.path, delay);
            std::thread::sleep(delay);
            (response, _) = self.resend(request, "rate limit wait");
            if response.synthetic {
                return response;
            }
        }

        if should_retry_server_error(request, response.status) {
            log::warn!("{} on {} {}; retrying once", response.status, request.method.as_str(), request.path);
            (response, _) = self.resend(request, "server error");
        }

        response
    }

    // ---- Operations ----

    /// Read the gate value for a post. Errors on non-2xx and on payloads
    /// that are not a non-empty list.
    pub fn fetch_gate_state(&self, post_id: i64, info_id: i64, run_value: &str) -> Result<bool> {
        let request = RetryableRequest::get("/PostosOperacoesInfos/GetDinamico")
            .query("idPostoOperacao", post_id)
            .query("idInfo", info_id);
        let response = self.execute(&request);
        if !response.is_success() {
            return Err(anyhow!(
                "gate state request failed ({}): {}",
                response.status,
                response.text()
            ));
        }
        let body: Value = response.json()?;
        let first = body
            .as_array()
            .and_then(|items| items.first())
            .ok_or_else(|| anyhow!("unexpected gate state response: {}", body))?;
        let value = match first.get("Valor") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => return Ok(false),
            Some(other) => other.to_string(),
        };
        Ok(value == run_value)
    }

    /// Upload one detection with its JPEG frame.
    pub fn submit_detection(&self, post_id: i64, candidate: &DetectionCandidate, jpeg: Vec<u8>) -> Result<()> {
        let form = detection_form(post_id, candidate, jpeg)?;
        let request = RetryableRequest::post("/anomalias/upload", RequestBody::Multipart(form))
            .retry_server_errors(true);
        let response = self.execute(&request);
        if !response.is_success() {
            return Err(anyhow!(
                "upload failed ({}): {}",
                response.status,
                response.text()
            ));
        }
        let location = if response.status == 201 {
            format!(" (Location: {})", response.header("Location").unwrap_or(""))
        } else {
            String::new()
        };
        log::info!(
            "[PO {}] detection uploaded [{}]{}: {}",
            post_id,
            response.status,
            location,
            response.text()
        );
        Ok(())
    }

    /// Post raw collector events.
    pub fn post_event(&self, payload: &[Value]) -> Result<()> {
        let request = RetryableRequest::post("/Coletor", RequestBody::Json(Value::from(payload.to_vec())));
        let response = self.execute(&request);
        if !response.is_success() {
            return Err(anyhow!(
                "event post failed ({}): {}",
                response.status,
                response.text()
            ));
        }
        log::info!("event posted: {}", response.text());
        Ok(())
    }

    /// One page of anomalies. A non-array body is treated as an empty page.
    pub fn list_anomalies_page(&self, post_id: i64, folder: &str, skip: usize, take: usize) -> Result<Vec<Value>> {
        let request = RetryableRequest::get("/anomalias/list")
            .query("po", post_id)
            .query("folder", folder)
            .query("skip", skip)
            .query("take", take);
        let response = self.execute(&request);
        if !response.is_success() {
            return Err(anyhow!(
                "anomaly listing failed ({}): {}",
                response.status,
                response.text()
            ));
        }
        match response.json::<Value>().context("parse anomaly page")? {
            Value::Array(items) => Ok(items),
            other => {
                log::warn!("anomaly listing returned a non-array body: {}", other);
                Ok(Vec::new())
            }
        }
    }

    /// Every anomaly for the post/folder, following pages until a short one.
    pub fn list_anomalies(&self, post_id: i64, folder: &str, page_size: usize) -> Result<Vec<Value>> {
        let take = page_size.clamp(1, MAX_PAGE_SIZE);
        let mut items = Vec::new();
        let mut skip = 0;
        loop {
            let page = self.list_anomalies_page(post_id, folder, skip, take)?;
            let count = page.len();
            items.extend(page);
            if count < take {
                break;
            }
            skip += take;
        }
        Ok(items)
    }
}

fn should_retry_server_error(request: &RetryableRequest, status: u16) -> bool {
    if status < 500 || status == HARD_FAILURE_STATUS {
        return false;
    }
    if request.idempotent {
        matches!(status, 502..=504)
    } else {
        request.retry_server_errors
    }
}

/// Delay for a 429 retry: `Retry-After` seconds clamped to 1..=10, 1 when
/// absent or not an integer.
pub fn retry_after_delay(header: Option<&str>) -> Duration {
    let secs = header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(RETRY_AFTER_MIN_SECS)
        .clamp(RETRY_AFTER_MIN_SECS, RETRY_AFTER_MAX_SECS);
    Duration::from_secs(secs)
}

/// ISO-8601 UTC with millisecond precision and a `Z` suffix.
pub fn format_timestamp(timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn detection_form(post_id: i64, candidate: &DetectionCandidate, jpeg: Vec<u8>) -> Result<MultipartForm> {
    let polygon = serde_json::to_string(&candidate.polygon).context("encode polygon")?;
    let mut form = MultipartForm::new()
        .text("po", post_id)
        .text("score_global", candidate.score)
        .text("timestamp", format_timestamp(&candidate.frame_timestamp))
        .text("polygon_norm", polygon);
    if let Some(name) = &candidate.class_name {
        form = form.text("classPred", name);
    }
    if let Some(confidence) = candidate.class_confidence.filter(|c| c.is_finite()) {
        form = form.text("predConf", confidence);
    }
    Ok(form.file(FilePart {
        field: "imagem".to_string(),
        filename: "frame.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        bytes: jpeg,
    }))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
