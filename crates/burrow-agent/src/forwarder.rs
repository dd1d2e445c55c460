//! Bridges tunnelled requests to the local HTTP upstream.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tracing::{debug, error, info, warn};

use burrow_proto::{HttpExchangeRequest, HttpExchangeResponse};

use crate::tunnel::TunnelClientError;

/// Request headers never copied to the upstream call. `Host` is set
/// explicitly from the tunnelled request.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "proxy-authorization",
    "content-length",
];

/// Source tag on responses synthesized by the forwarder.
pub const FORWARDER_ERROR_SOURCE: &str = "agent-proxy";

/// Turns a tunnelled request into a response. Never fails: upstream problems
/// become error responses.
#[tonic::async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, request: HttpExchangeRequest) -> HttpExchangeResponse;
}

/// [`Forward`] over `reqwest` to a fixed base URL.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    http: reqwest::Client,
    base_url: String,
    max_response_bytes: usize,
}

#[derive(Debug)]
enum ForwardError {
    Request(reqwest::Error),
    InvalidRequest(String),
    ResponseTooLarge(usize),
}

impl LocalForwarder {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        max_response_bytes: usize,
    ) -> Result<Self, TunnelClientError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TunnelClientError::Config(format!(
                "upstream url must be http(s): {base_url}"
            )));
        }
        burrow_pki::ensure_crypto_provider();

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| TunnelClientError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_response_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, req: &HttpExchangeRequest) -> Result<HttpExchangeResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| ForwardError::InvalidRequest(format!("method {:?}", req.method)))?;
        let path = if req.path.starts_with('/') {
            req.path.clone()
        } else {
            format!("/{}", req.path)
        };
        let url = format!("{}{path}", self.base_url);

        let mut resp = self
            .http
            .request(method, &url)
            .headers(outbound_headers(req))
            .body(req.body.clone())
            .send()
            .await
            .map_err(ForwardError::Request)?;

        let status = resp.status().as_u16();
        let headers = flatten_headers(resp.headers());
        if let Some(len) = resp.content_length()
            && usize::try_from(len).map_or(true, |n| n > self.max_response_bytes)
        {
            return Err(ForwardError::ResponseTooLarge(self.max_response_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(ForwardError::Request)? {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(ForwardError::ResponseTooLarge(self.max_response_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(HttpExchangeResponse {
            request_id: req.request_id.clone(),
            status_code: i32::from(status),
            headers,
            body,
            processing_time_ms: 0,
        })
    }
}

#[tonic::async_trait]
impl Forward for LocalForwarder {
    async fn forward(&self, request: HttpExchangeRequest) -> HttpExchangeResponse {
        let started = Instant::now();
        debug!(
            request_id = %request.request_id,
            method = %request.method,
            host = %request.host,
            path = %request.path,
            upstream = %self.base_url,
            "Forwarding to upstream"
        );

        match self.send(&request).await {
            Ok(mut resp) => {
                resp.processing_time_ms = elapsed_ms(started);
                info!(
                    request_id = %request.request_id,
                    method = %request.method,
                    host = %request.host,
                    path = %request.path,
                    status = resp.status_code,
                    bytes = resp.body.len(),
                    elapsed_ms = resp.processing_time_ms,
                    "Upstream responded"
                );
                resp
            }
            Err(e) => {
                let (status, message) = match &e {
                    ForwardError::Request(err) if err.is_timeout() => {
                        warn!(request_id = %request.request_id, error = %err, "Upstream timed out");
                        (504, "Gateway Timeout - local service took too long to respond")
                    }
                    ForwardError::Request(err) if err.is_connect() => {
                        error!(
                            request_id = %request.request_id,
                            upstream = %self.base_url,
                            error = %err,
                            "Cannot connect to upstream"
                        );
                        (502, "Bad Gateway - cannot connect to local service")
                    }
                    ForwardError::ResponseTooLarge(limit) => {
                        warn!(request_id = %request.request_id, limit, "Upstream response too large");
                        (502, "Bad Gateway - upstream response too large")
                    }
                    ForwardError::Request(err) => {
                        error!(request_id = %request.request_id, error = %err, "Upstream request failed");
                        (500, "Internal Server Error")
                    }
                    ForwardError::InvalidRequest(detail) => {
                        warn!(request_id = %request.request_id, detail = %detail, "Cannot build upstream request");
                        (500, "Internal Server Error")
                    }
                };
                let mut resp =
                    error_response(&request.request_id, status, message, FORWARDER_ERROR_SOURCE);
                resp.processing_time_ms = elapsed_ms(started);
                resp
            }
        }
    }
}

fn outbound_headers(req: &HttpExchangeRequest) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(req.headers.len() + 5);
    for (name, value) in &req.headers {
        if SKIP_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => debug!(request_id = %req.request_id, header = %name, "Skipping invalid header"),
        }
    }

    let mut set = |name: &'static str, value: &str| match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(_) => debug!(request_id = %req.request_id, header = name, "Skipping invalid header"),
    };
    set("host", &req.host);
    set("x-forwarded-for", &req.client_ip);
    set("x-forwarded-proto", "https");
    set("x-real-ip", &req.client_ip);
    set("x-forwarded-host", &req.host);
    headers
}

fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_string(), joined);
    }
    out
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// JSON error response produced by the agent itself.
pub fn error_response(
    request_id: &str,
    status: u16,
    message: &str,
    source: &str,
) -> HttpExchangeResponse {
    let body = serde_json::json!({
        "error": message,
        "statusCode": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "source": source,
    });
    HttpExchangeResponse {
        request_id: request_id.to_string(),
        status_code: i32::from(status),
        headers: HashMap::from([
            (
                "content-type".to_string(),
                "application/json; charset=utf-8".to_string(),
            ),
            ("x-error-source".to_string(), source.to_string()),
        ]),
        body: body.to_string().into_bytes(),
        processing_time_ms: 0,
    }
}
