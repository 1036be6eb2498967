//! HTTP exchange client used by virtual users.
//!
//! Every VU owns one [`HttpClient`]: its own connection pool and cookie jar.
//! Exchanges never return `Err`; transport failures are attached to the
//! returned [`HttpResponse`] so an iteration can keep going.

mod connector;
mod response;

pub use connector::{ConnectError, ConnectPhases, TimingConnector};
pub use response::{HttpResponse, Timings};

use crate::error::HttpError;
use crate::metrics::{
    MetricKind, Registry, DATA_RECEIVED, HTTP_REQS, HTTP_REQ_CONNECTING, HTTP_REQ_DURATION,
    HTTP_REQ_FAILED, HTTP_REQ_LOOKING_UP, HTTP_REQ_RECEIVING, HTTP_REQ_SENDING,
    HTTP_REQ_TLS_HANDSHAKING, HTTP_REQ_WAITING,
};
use crate::types::{option_duration_str, Tags};
use connector::{find_connect_error, ConnectionInfo};
use futures::future::join_all;
use hyper::header::{HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE, USER_AGENT};
use hyper::{Body, Client, Method, Request, Uri};
use log::debug;
use response::millis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_USER_AGENT: &str = concat!("loadmaster/", env!("CARGO_PKG_VERSION"));

fn default_method() -> String {
    "GET".to_string()
}

/// A request described as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// A JSON string is sent verbatim; any other value is sent as JSON.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Value of the `name` tag. Defaults to the URL.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, with = "option_duration_str")]
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            name: None,
            tags: Tags::new(),
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for RequestSpec {
    fn from(url: &str) -> Self {
        RequestSpec::get(url)
    }
}

type CookieJar = HashMap<String, BTreeMap<String, String>>;

pub struct HttpClient {
    client: Client<TimingConnector, Body>,
    registry: Arc<Registry>,
    timeout: Duration,
    cookies: Mutex<CookieJar>,
}

impl HttpClient {
    pub fn new(connector: TimingConnector, registry: Arc<Registry>, timeout: Duration) -> Self {
        Self {
            client: Client::builder().build(connector),
            registry,
            timeout,
            cookies: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: &str) -> HttpResponse {
        self.request(&RequestSpec::get(url)).await
    }

    /// Runs every request concurrently. Results come back in request order and
    /// a failed entry never affects the others.
    pub async fn batch(&self, requests: &[RequestSpec]) -> Vec<HttpResponse> {
        join_all(requests.iter().map(|r| self.request(r))).await
    }

    pub async fn request(&self, spec: &RequestSpec) -> HttpResponse {
        let method = spec.method.to_ascii_uppercase();
        let name = spec.name.clone().unwrap_or_else(|| spec.url.clone());

        let response = match self.build(spec, &method) {
            Ok((request, host)) => {
                let timeout = spec.timeout.unwrap_or(self.timeout);
                match tokio::time::timeout(timeout, self.exchange(request, &host)).await {
                    Ok(Ok((status, headers, body, timings))) => HttpResponse::new(
                        method,
                        spec.url.clone(),
                        name,
                        status,
                        headers,
                        body,
                        timings,
                    ),
                    Ok(Err((error, timings))) => {
                        HttpResponse::failed(method, spec.url.clone(), name, timings, error)
                    }
                    Err(_) => HttpResponse::failed(
                        method,
                        spec.url.clone(),
                        name,
                        Timings::default(),
                        HttpError::Timeout(timeout.as_millis() as u64),
                    ),
                }
            }
            Err(error) => {
                HttpResponse::failed(method, spec.url.clone(), name, Timings::default(), error)
            }
        };

        if let Some(error) = response.error() {
            debug!("{} {} failed: {}", response.method(), response.url(), error);
        }
        self.record_metrics(&response, &spec.tags);
        response
    }

    fn build(&self, spec: &RequestSpec, method: &str) -> Result<(Request<Body>, String), HttpError> {
        let uri: Uri = spec
            .url
            .parse()
            .map_err(|e| HttpError::InvalidRequest(format!("{}: {}", spec.url, e)))?;
        let host = match (uri.scheme_str(), uri.host()) {
            (Some(_), Some(host)) => host.to_string(),
            _ => {
                return Err(HttpError::InvalidRequest(format!(
                    "{}: url must be absolute",
                    spec.url
                )))
            }
        };
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_AGENT, DEFAULT_USER_AGENT);

        for (key, value) in &spec.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if let Some(cookie) = self.cookie_header(&host) {
            builder = builder.header(COOKIE, cookie);
        }

        let body = match &spec.body {
            None => Body::empty(),
            Some(serde_json::Value::String(raw)) => Body::from(raw.clone()),
            Some(json) => {
                if !spec.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                }
                Body::from(json.to_string())
            }
        };

        let request = builder
            .body(body)
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        Ok((request, host))
    }

    async fn exchange(
        &self,
        request: Request<Body>,
        host: &str,
    ) -> Result<(u16, BTreeMap<String, String>, Vec<u8>, Timings), (HttpError, Timings)> {
        let start = Instant::now();
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| (classify(&e), Timings::default()))?;
        let headers_at = Instant::now();

        let info = response.extensions().get::<ConnectionInfo>().cloned();
        let phases = info
            .as_ref()
            .map(ConnectionInfo::claim_phases)
            .unwrap_or_default();
        let send_start = start + phases.total();
        let last_write = info
            .as_ref()
            .and_then(ConnectionInfo::last_write)
            .filter(|t| *t >= start);
        let (sending, waiting) = match last_write {
            Some(written) => (
                written.saturating_duration_since(send_start),
                headers_at.saturating_duration_since(written.max(send_start)),
            ),
            None => (Duration::ZERO, headers_at.saturating_duration_since(send_start)),
        };

        let mut timings = Timings {
            looking_up: millis(phases.looking_up),
            connecting: millis(phases.connecting),
            tls_handshaking: millis(phases.tls_handshaking),
            sending: millis(sending),
            waiting: millis(waiting),
            receiving: 0.0,
            duration: millis(sending + waiting),
        };

        let status = response.status().as_u16();
        self.store_cookies(host, response.headers().get_all(SET_COOKIE).iter());
        let mut headers = BTreeMap::new();
        for (key, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(key.as_str().to_string())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.clone());
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| (HttpError::Network(e.to_string()), timings))?;
        let receiving = headers_at.elapsed();
        timings.receiving = millis(receiving);
        timings.duration = millis(sending + waiting + receiving);

        Ok((status, headers, body.to_vec(), timings))
    }

    fn cookie_header(&self, host: &str) -> Option<String> {
        let jar = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let cookies = jar.get(host).filter(|c| !c.is_empty())?;
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn store_cookies<'a>(&self, host: &str, values: impl Iterator<Item = &'a HeaderValue>) {
        let mut jar = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        for value in values {
            let Ok(raw) = value.to_str() else { continue };
            let mut attributes = raw.split(';').map(str::trim);
            let Some((name, val)) = attributes.next().and_then(|pair| pair.split_once('=')) else {
                continue;
            };
            let expired = attributes.any(|a| a.eq_ignore_ascii_case("max-age=0"));
            let cookies = jar.entry(host.to_string()).or_default();
            if expired {
                cookies.remove(name.trim());
            } else {
                cookies.insert(name.trim().to_string(), val.trim().to_string());
            }
        }
    }

    fn record_metrics(&self, response: &HttpResponse, extra: &Tags) {
        let mut tags = extra.clone();
        tags.insert("method".to_string(), response.method().to_string());
        tags.insert("name".to_string(), response.name().to_string());
        tags.insert("status".to_string(), response.status().to_string());
        if let Some(error) = response.error() {
            tags.insert("error_code".to_string(), error.code().to_string());
        }

        let t = response.timings();
        let failed = if response.is_failed() { 1.0 } else { 0.0 };
        let samples = [
            (HTTP_REQS, MetricKind::Counter, 1.0),
            (HTTP_REQ_FAILED, MetricKind::Rate, failed),
            (HTTP_REQ_DURATION, MetricKind::Trend, t.duration),
            (HTTP_REQ_LOOKING_UP, MetricKind::Trend, t.looking_up),
            (HTTP_REQ_CONNECTING, MetricKind::Trend, t.connecting),
            (HTTP_REQ_TLS_HANDSHAKING, MetricKind::Trend, t.tls_handshaking),
            (HTTP_REQ_SENDING, MetricKind::Trend, t.sending),
            (HTTP_REQ_WAITING, MetricKind::Trend, t.waiting),
            (HTTP_REQ_RECEIVING, MetricKind::Trend, t.receiving),
            (DATA_RECEIVED, MetricKind::Counter, response.body_size() as f64),
        ];
        for (name, kind, value) in samples {
            if let Err(e) = self.registry.add_named(name, kind, value, &tags) {
                debug!("skipping built-in sample: {}", e);
            }
        }
    }
}

fn classify(err: &hyper::Error) -> HttpError {
    match find_connect_error(err) {
        Some(ConnectError::Tls { .. }) => HttpError::Tls(err_chain(err)),
        Some(ConnectError::InvalidUri(reason)) => HttpError::InvalidRequest(reason.clone()),
        Some(connect) => HttpError::Network(connect.to_string()),
        None => HttpError::Network(err_chain(err)),
    }
}

fn err_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}
