//! `fetch()` for sandboxed code.
//!
//! Requests run on a short-lived helper thread with a blocking `reqwest`
//! client, so the JS thread never waits on the network. The outcome comes
//! back to the worker loop as a [`WorkerEvent::FetchDone`], which settles
//! the promise handed to the script.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::worker::WorkerEvent;

/// Maximum response body size (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// HTTP read timeout in seconds.
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// User-Agent sent with requests and exposed as `navigator.userAgent`.
pub const USER_AGENT: &str = concat!("sandpad/", env!("CARGO_PKG_VERSION"));

/// The `init` argument of `fetch(url, init)`, as the bootstrap serializes it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchRequest {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// What the script's Response object is built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    /// Lowercase header names; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Starts requests on behalf of one sandbox.
#[derive(Debug, Clone)]
pub struct Fetcher {
    allow_network: bool,
    loopback: Sender<WorkerEvent>,
}

impl Fetcher {
    pub fn new(allow_network: bool, loopback: Sender<WorkerEvent>) -> Self {
        Self {
            allow_network,
            loopback,
        }
    }

    /// Begins fetch `id`. The result is always delivered later through the
    /// worker loop, even when it is known to fail right away.
    pub fn start(&self, id: u32, url: String, init: &str) {
        let request: FetchRequest = match serde_json::from_str(init) {
            Ok(request) => request,
            Err(e) => return self.finish(id, Err(format!("invalid request options: {e}"))),
        };

        if !self.allow_network {
            return self.finish(id, Err("network access is disabled".to_string()));
        }

        let loopback = self.loopback.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("sandbox-fetch-{id}"))
            .spawn(move || {
                let outcome = perform(&url, &request);
                if loopback.send(WorkerEvent::FetchDone { id, outcome }).is_err() {
                    debug!("Sandbox gone before fetch {id} completed");
                }
            });
        if let Err(e) = spawned {
            self.finish(id, Err(format!("cannot start request: {e}")));
        }
    }

    fn finish(&self, id: u32, outcome: Result<FetchResponse, String>) {
        if self.loopback.send(WorkerEvent::FetchDone { id, outcome }).is_err() {
            debug!("Sandbox gone before fetch {id} completed");
        }
    }
}

/// Checks that `url` is an absolute http(s) URL.
pub fn validate_url(url: &str) -> Result<reqwest::Url, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL {url}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(format!("unsupported scheme '{scheme}' (only http/https)")),
    }
}

/// Performs one request, blocking the calling thread.
pub fn perform(url: &str, request: &FetchRequest) -> Result<FetchResponse, String> {
    let parsed = validate_url(url)?;
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| format!("invalid method '{}'", request.method))?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| e.to_string())?;

    debug!("Sandbox fetch: {method} {url}");

    let mut builder = client.request(method, parsed);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), header_value(value));
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send().map_err(|e| {
        warn!("Sandbox fetch failed: {e}");
        e.to_string()
    })?;

    if let Some(len) = response.content_length() {
        if len as usize > MAX_RESPONSE_SIZE {
            return Err(format!(
                "response too large ({len} bytes, limit is {MAX_RESPONSE_SIZE} bytes)"
            ));
        }
    }

    let status = response.status();
    let final_url = response.url().to_string();
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let body = response
        .bytes()
        .map_err(|e| format!("error reading response: {e}"))?;
    if body.len() > MAX_RESPONSE_SIZE {
        return Err(format!(
            "response too large ({} bytes, limit is {MAX_RESPONSE_SIZE} bytes)",
            body.len()
        ));
    }

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        url: final_url,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Header values from script land may be any JSON value.
fn header_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
