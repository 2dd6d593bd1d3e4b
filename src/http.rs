// 🌐 HTTP transport for the upstream JSON APIs
//
// HttpClient is the seam between adapters and the network: production uses
// reqwest's blocking client, tests replay scripted responses. Fetcher layers
// the per-source rate gate and the single 429 retry on top.

use crate::error::FetchError;
use crate::rate_limit::IntervalGate;
use serde_json::Value;
use std::time::Duration;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        HttpRequest {
            url: url.into(),
            query: Vec::new(),
        }
    }

    /// Builder pattern: add a query parameter
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn params(mut self, params: Vec<(String, String)>) -> Self {
        self.query.extend(params);
        self
    }

    /// Value of a query parameter (first occurrence)
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

// ============================================================================
// CLIENT TRAIT
// ============================================================================

/// Blocking GET; transport failures only (status codes are not errors here)
pub trait HttpClient {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// Production client over reqwest's blocking API
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crime-weather/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(ReqwestClient { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let response = self
            .client
            .get(&request.url)
            .query(&request.query)
            .send()
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().map_err(map_reqwest_error)?;

        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::Decode(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}

// ============================================================================
// FETCHER (gate + retry + JSON)
// ============================================================================

pub struct Fetcher {
    client: Box<dyn HttpClient>,
    gate: IntervalGate,
    retry_wait: Duration,
}

impl Fetcher {
    pub fn new(client: Box<dyn HttpClient>, gate: IntervalGate, retry_wait: Duration) -> Self {
        Fetcher {
            client,
            gate,
            retry_wait,
        }
    }

    /// GET and decode a JSON body.
    ///
    /// A 429 is retried exactly once after `retry_wait`; every other failure
    /// is returned to the caller as is.
    pub fn get_json(&mut self, request: &HttpRequest) -> Result<Value, FetchError> {
        match self.get_once(request) {
            Err(e) if e.is_rate_limited() => {
                log::warn!(
                    "{} rate limited, retrying once in {:?}",
                    request.url,
                    self.retry_wait
                );
                self.gate.pause(self.retry_wait);
                self.get_once(request)
            }
            other => other,
        }
    }

    fn get_once(&mut self, request: &HttpRequest) -> Result<Value, FetchError> {
        self.gate.acquire();
        let response = self.client.get(request)?;

        if !(200..300).contains(&response.status) {
            return Err(FetchError::from_status(response.status));
        }

        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&response.body)?)
    }
}

// ============================================================================
// JSON FIELD HELPERS
// ============================================================================
// Upstream payloads are loosely typed: numbers arrive as strings, fields go
// missing. These never fail; absent or unparsable becomes None.

pub fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn json_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn json_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeHttp, ManualClock};
    use serde_json::json;

    #[test]
    fn test_success_decodes_json() {
        let http = FakeHttp::new();
        http.push_json(json!({"ok": true}));
        let clock = ManualClock::new();
        let mut fetcher = http.fetcher(&clock);

        let value = fetcher.get_json(&HttpRequest::get("http://x/a")).unwrap();
        assert_eq!(value["ok"], json!(true));
        assert_eq!(http.request_count(), 1);
    }

    #[test]
    fn test_429_retried_once_then_succeeds() {
        let http = FakeHttp::new();
        http.push_status(429, "").push_json(json!([1, 2]));
        let clock = ManualClock::new();
        let mut fetcher = http.fetcher(&clock);

        let value = fetcher.get_json(&HttpRequest::get("http://x/a")).unwrap();
        assert_eq!(value, json!([1, 2]));
        assert_eq!(http.request_count(), 2);
        assert!(clock.sleeps().contains(&Duration::from_secs(2)));
    }

    #[test]
    fn test_429_twice_gives_up() {
        let http = FakeHttp::new();
        http.push_status(429, "").push_status(429, "").push_json(json!([]));
        let clock = ManualClock::new();
        let mut fetcher = http.fetcher(&clock);

        let err = fetcher.get_json(&HttpRequest::get("http://x/a")).unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(http.request_count(), 2, "only one retry is allowed");
    }

    #[test]
    fn test_server_error_not_retried() {
        let http = FakeHttp::new();
        http.push_status(502, "bad gateway");
        let clock = ManualClock::new();
        let mut fetcher = http.fetcher(&clock);

        let err = fetcher.get_json(&HttpRequest::get("http://x/a")).unwrap_err();
        assert!(matches!(err, FetchError::Server(502)));
        assert_eq!(http.request_count(), 1);
    }

    #[test]
    fn test_malformed_body_is_decode_error() {
        let http = FakeHttp::new();
        http.push_status(200, "{not json");
        let clock = ManualClock::new();
        let mut fetcher = http.fetcher(&clock);

        let err = fetcher.get_json(&HttpRequest::get("http://x/a")).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::get("http://x/a")
            .param("lat", 51.5)
            .params(vec![("date".to_string(), "2023-09".to_string())]);
        assert_eq!(req.query_value("lat"), Some("51.5"));
        assert_eq!(req.query_value("date"), Some("2023-09"));
        assert_eq!(req.query_value("missing"), None);
    }

    #[test]
    fn test_json_helpers_tolerate_strings_and_gaps() {
        let v = json!({"lat": "51.5", "lon": -0.1, "id": 42, "blank": "  ", "street": null});
        assert_eq!(json_f64(&v, "lat"), Some(51.5));
        assert_eq!(json_f64(&v, "lon"), Some(-0.1));
        assert_eq!(json_str(&v, "id"), Some("42".to_string()));
        assert_eq!(json_i64(&v, "id"), Some(42));
        assert_eq!(json_str(&v, "blank"), None);
        assert_eq!(json_str(&v, "street"), None);
        assert_eq!(json_f64(&v, "missing"), None);
    }
}
