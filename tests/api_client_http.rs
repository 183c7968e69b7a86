use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use anomaly_sentinel::api::{ClientSettings, ResilientHttpClient};
use anomaly_sentinel::detect::DetectionCandidate;
use anomaly_sentinel::polygon::NormalizedPolygon;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer(&self) -> Option<&str> {
        self.headers
            .get("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string().into_bytes(),
        }
    }

    fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
}

type Handler = dyn Fn(&HttpRequest) -> Reply + Send + Sync;

/// One request per connection; every request is recorded.
struct MockApi {
    base_url: String,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockApi {
    fn start(handler: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);
        let recorded = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let Ok(request) = read_request(&mut stream) else { continue };
                recorded.lock().unwrap().push(request.clone());
                let reply = handler(&request);
                let _ = write_response(&mut stream, &reply);
            }
        });
        Ok(Self { base_url, requests })
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    fn client(&self) -> Result<ResilientHttpClient> {
        ResilientHttpClient::new(ClientSettings {
            base_url: format!("{}/", self.base_url),
            login: "sentinel".to_string(),
            password: "secret".to_string(),
            client_id: "42".to_string(),
            timeout: Duration::from_secs(5),
        })
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = data[header_end..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, reply: &Reply) -> Result<()> {
    let status_line = match reply.status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        401 => "HTTP/1.1 401 Unauthorized",
        429 => "HTTP/1.1 429 Too Many Requests",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n",
        status_line = status_line,
        len = reply.body.len()
    );
    for (name, value) in &reply.headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&reply.body)?;
    Ok(())
}

/// Issues `token-1`, `token-2`, ... on every `/token` call.
fn token_reply(counter: &AtomicUsize) -> Reply {
    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
    Reply::json(200, json!({ "message": format!("token-{}", n) }))
}

fn candidate() -> DetectionCandidate {
    DetectionCandidate::unclassified(
        0.91,
        NormalizedPolygon(vec![[0.1, 0.2], [0.4, 0.2], [0.4, 0.6]]),
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap(),
    )
}

#[test]
fn expired_token_is_refreshed_once() -> Result<()> {
    let tokens = Arc::new(AtomicUsize::new(0));
    let issued = tokens.clone();
    let api = MockApi::start(move |req| match req.path.as_str() {
        "/token" => token_reply(&issued),
        "/anomalias/list" if req.bearer() == Some("token-2") => Reply::json(200, json!([])),
        "/anomalias/list" => Reply::json(401, json!({ "error": "expired" })),
        _ => Reply::json(500, json!({})),
    })?;
    let client = api.client()?;

    client.authenticate()?;
    assert_eq!(client.auth_session().token.as_deref(), Some("token-1"));

    let page = client.list_anomalies_page(7, "inbox", 0, 10)?;
    assert!(page.is_empty());
    assert_eq!(client.auth_session().token.as_deref(), Some("token-2"));
    assert_eq!(api.count("/token"), 2);
    assert_eq!(api.count("/anomalias/list"), 2);

    let login = api
        .requests()
        .into_iter()
        .find(|r| r.path == "/token")
        .ok_or_else(|| anyhow!("no token request"))?;
    assert_eq!(login.method, "POST");
    assert_eq!(
        login.json(),
        json!({ "login": "sentinel", "senha": "secret", "idCliente": "42" })
    );
    Ok(())
}

#[test]
fn listing_follows_pages_until_a_short_one() -> Result<()> {
    const TOTAL: usize = 1137;
    let api = MockApi::start(|req| {
        let skip: usize = req.query.get("skip").and_then(|v| v.parse().ok()).unwrap_or(0);
        let take: usize = req.query.get("take").and_then(|v| v.parse().ok()).unwrap_or(0);
        let items: Vec<Value> = (skip..(skip + take).min(TOTAL))
            .map(|id| json!({ "id": id }))
            .collect();
        Reply::json(200, Value::from(items))
    })?;
    let client = api.client()?;

    let items = client.list_anomalies(7, "inbox", 500)?;
    assert_eq!(items.len(), TOTAL);
    assert_eq!(items[TOTAL - 1]["id"], TOTAL - 1);

    let pages = api.requests();
    let skips: Vec<&str> = pages.iter().map(|r| r.query["skip"].as_str()).collect();
    assert_eq!(skips, ["0", "500", "1000"]);
    for page in &pages {
        assert_eq!(page.method, "GET");
        assert_eq!(page.query["po"], "7");
        assert_eq!(page.query["folder"], "inbox");
        assert_eq!(page.query["take"], "500");
    }
    Ok(())
}

#[test]
fn rate_limit_waits_for_retry_after() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let api = MockApi::start(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Reply::json(429, json!({ "error": "slow down" })).header("Retry-After", "1")
        } else {
            Reply::json(200, json!([{ "Valor": "6" }]))
        }
    })?;
    let client = api.client()?;

    let started = Instant::now();
    assert!(client.fetch_gate_state(7, 1, "6")?);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn gate_state_reads_the_configured_info() -> Result<()> {
    let api = MockApi::start(|req| {
        let value = if req.query.get("idPostoOperacao").map(String::as_str) == Some("7") {
            "6"
        } else {
            "0"
        };
        Reply::json(200, json!([{ "Valor": value }]))
    })?;
    let client = api.client()?;

    assert!(client.fetch_gate_state(7, 3, "6")?);
    assert!(!client.fetch_gate_state(8, 3, "6")?);

    let first = &api.requests()[0];
    assert_eq!(first.path, "/PostosOperacoesInfos/GetDinamico");
    assert_eq!(first.query["idInfo"], "3");
    Ok(())
}

#[test]
fn upload_is_retried_once_on_server_error() -> Result<()> {
    let uploads = Arc::new(AtomicUsize::new(0));
    let seen = uploads.clone();
    let api = MockApi::start(move |req| {
        if req.path != "/anomalias/upload" {
            return Reply::json(500, json!({}));
        }
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Reply::json(503, json!({ "error": "busy" }))
        } else {
            Reply::json(201, json!({ "id": 99 })).header("Location", "/anomalias/99")
        }
    })?;
    let client = api.client()?;

    let jpeg = vec![0xFF, 0xD8, 0xAB, 0xCD, 0xFF, 0xD9];
    client.submit_detection(7, &candidate(), jpeg.clone())?;
    assert_eq!(uploads.load(Ordering::SeqCst), 2);

    let upload = api
        .requests()
        .pop()
        .ok_or_else(|| anyhow!("no upload recorded"))?;
    assert_eq!(upload.method, "POST");
    assert!(upload.headers["content-type"].starts_with("multipart/form-data; boundary="));
    let body = String::from_utf8_lossy(&upload.body);
    assert!(body.contains("name=\"po\"\r\n\r\n7\r\n"));
    assert!(body.contains("2026-03-04T05:06:07.000Z"));
    assert!(body.contains("[[0.1,0.2],[0.4,0.2],[0.4,0.6]]"));
    assert!(!body.contains("classPred"));
    assert!(upload.body.windows(jpeg.len()).any(|w| w == jpeg.as_slice()));
    Ok(())
}

#[test]
fn unreachable_api_reports_a_failed_upload() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let client = ResilientHttpClient::new(ClientSettings {
        base_url: format!("http://{}", addr),
        login: "sentinel".to_string(),
        password: "secret".to_string(),
        client_id: "42".to_string(),
        timeout: Duration::from_secs(1),
    })?;
    let err = client
        .submit_detection(7, &candidate(), vec![0xFF, 0xD8])
        .expect_err("nothing is listening");
    assert!(err.to_string().contains("599"));
    Ok(())
}

#[test]
fn collector_events_are_posted_as_a_json_array() -> Result<()> {
    let api = MockApi::start(|req| match req.path.as_str() {
        "/Coletor" => Reply::json(200, json!({ "accepted": 2 })),
        _ => Reply::json(500, json!({})),
    })?;
    let client = api.client()?;

    let events = [json!({ "po": 7, "kind": "heartbeat" }), json!({ "po": 7, "kind": "gate" })];
    client.post_event(&events)?;

    let posted = &api.requests()[0];
    assert_eq!(posted.method, "POST");
    assert_eq!(posted.json(), Value::from(events.to_vec()));
    Ok(())
}
