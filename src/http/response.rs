use crate::error::HttpError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Phase breakdown of one exchange, in milliseconds. Phases that were never
/// reached stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timings {
    pub looking_up: f64,
    pub connecting: f64,
    pub tls_handshaking: f64,
    pub sending: f64,
    pub waiting: f64,
    pub receiving: f64,
    pub duration: f64,
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    method: String,
    url: String,
    name: String,
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
    body_size: usize,
    timings: Timings,
    error: Option<HttpError>,
}

impl HttpResponse {
    pub(crate) fn new(
        method: String,
        url: String,
        name: String,
        status: u16,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
        timings: Timings,
    ) -> Self {
        Self {
            method,
            url,
            name,
            status,
            headers,
            body_size: body.len(),
            body: String::from_utf8_lossy(&body).into_owned(),
            timings,
            error: None,
        }
    }

    pub(crate) fn failed(
        method: String,
        url: String,
        name: String,
        timings: Timings,
        error: HttpError,
    ) -> Self {
        Self {
            method,
            url,
            name,
            status: 0,
            headers: BTreeMap::new(),
            body: String::new(),
            body_size: 0,
            timings,
            error: Some(error),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Name used for the `name` tag; the URL unless the request set one.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status code, `0` when the exchange failed before a response arrived.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn body_size(&self) -> usize {
        self.body_size
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn error(&self) -> Option<&HttpError> {
        self.error.as_ref()
    }

    /// True on transport failure or a status outside 200..400.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() || !(200..400).contains(&self.status)
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.body)
    }
}
