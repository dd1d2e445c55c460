//! `POST /proxy`: turn a public HTTP request into a tunnel request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::LazyLock;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::Response;
use regex::Regex;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use burrow_proto::{HttpExchangeRequest, HttpExchangeResponse};

use super::{AppState, error_response};
use crate::registry::RegistryError;

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
        .expect("static regex is valid")
});

// Framing is recomputed for the buffered body.
const RESPONSE_SKIP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "content-length",
];

pub(super) async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let Some(domain) = extract_domain(&parts.headers, &parts.uri) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing host");
    };
    if !is_valid_hostname(&domain) {
        debug!(domain = %domain, "Rejecting invalid hostname");
        return error_response(StatusCode::BAD_REQUEST, format!("Invalid domain: {domain}"));
    }

    let Some(route) = state.routes.route_for_domain(&domain) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Domain not configured: {domain}"),
        );
    };

    if !state.registry.is_connected(&route.agent_id) {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Agent offline: {}", route.agent_id),
        );
    }

    let body = match read_body_limited(body, &parts.headers, state.settings.max_body_bytes).await
    {
        Ok(b) => b,
        Err(BodyError::TooLarge) => {
            warn!(domain = %domain, limit = state.settings.max_body_bytes, "Request body too large");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
        Err(BodyError::Read(e)) => {
            warn!(domain = %domain, error = %e, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let request = HttpExchangeRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        method: parts.method.as_str().to_string(),
        path: request_path(&parts),
        host: domain.clone(),
        client_ip: client_ip(&parts),
        headers: flatten_headers(&parts.headers),
        body,
    };
    let request_id = request.request_id.clone();
    debug!(
        request_id = %request_id,
        domain = %domain,
        agent_id = %route.agent_id,
        target_port = route.target_port,
        method = %request.method,
        path = %request.path,
        "Forwarding request through tunnel"
    );

    match state
        .registry
        .send_request(&route.agent_id, request, state.settings.request_timeout)
        .await
    {
        Ok(response) => {
            info!(
                request_id = %request_id,
                domain = %domain,
                status = response.status_code,
                upstream_ms = response.processing_time_ms,
                "Request completed"
            );
            into_http_response(response)
        }
        Err(RegistryError::Timeout(_)) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
        }
        Err(RegistryError::AgentOffline(agent_id)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Agent offline: {agent_id}"),
        ),
        Err(e) => {
            error!(request_id = %request_id, domain = %domain, error = %e, "Tunnel request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// Domain the caller asked for: first `X-Forwarded-Host` value, else `Host`,
/// else the URI authority. Port stripped, lowercased.
pub fn extract_domain(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let raw = header_value("x-forwarded-host")
        .or_else(|| header_value(header::HOST.as_str()))
        .or_else(|| uri.host())?;

    let host = strip_port(raw);
    let host = host.strip_suffix('.').unwrap_or(host);
    Some(host.to_ascii_lowercase())
}

fn strip_port(raw: &str) -> &str {
    match raw.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => raw,
    }
}

/// RFC 1123 hostname check on an already-lowercased name.
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && HOSTNAME_RE.is_match(name)
}

// Reverse proxies that rewrite to `/proxy` pass the original target in
// `X-Forwarded-Uri`.
fn request_path(parts: &Parts) -> String {
    parts
        .headers
        .get("x-forwarded-uri")
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.starts_with('/'))
        .map_or_else(
            || {
                parts
                    .uri
                    .path_and_query()
                    .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string())
            },
            str::to_string,
        )
}

fn client_ip(parts: &Parts) -> String {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// One entry per header name; repeated values joined with ", ".
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

#[derive(Debug)]
enum BodyError {
    TooLarge,
    Read(axum::Error),
}

/// Buffer the body, failing as soon as it is known to exceed `limit`.
async fn read_body_limited(
    body: Body,
    headers: &HeaderMap,
    limit: usize,
) -> Result<Vec<u8>, BodyError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|n| usize::try_from(n).map_or(true, |n| n > limit)) {
        return Err(BodyError::TooLarge);
    }

    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn into_http_response(resp: HttpExchangeResponse) -> Response {
    let status = u16::try_from(resp.status_code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok());
    let Some(status) = status else {
        error!(
            request_id = %resp.request_id,
            status = resp.status_code,
            "Agent returned an invalid status code"
        );
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
    };

    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in resp.headers {
        if RESPONSE_SKIP_HEADERS
            .iter()
            .any(|skip| name.eq_ignore_ascii_case(skip))
        {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.append(n, v);
            }
            _ => debug!(header = %name, "Dropping invalid response header"),
        }
    }
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn forwarded_host_wins_over_host() {
        let h = headers(&[
            ("x-forwarded-host", "App.Example.com:8443, proxy.internal"),
            ("host", "broker.internal:5000"),
        ]);
        assert_eq!(
            extract_domain(&h, &Uri::from_static("/proxy")).as_deref(),
            Some("app.example.com")
        );
    }

    #[test]
    fn host_header_and_uri_fallbacks() {
        let h = headers(&[("host", "api.example.com:5000")]);
        assert_eq!(
            extract_domain(&h, &Uri::from_static("/")).as_deref(),
            Some("api.example.com")
        );
        assert_eq!(
            extract_domain(&HeaderMap::new(), &Uri::from_static("http://uri.example.com/x"))
                .as_deref(),
            Some("uri.example.com")
        );
        assert!(extract_domain(&HeaderMap::new(), &Uri::from_static("/")).is_none());
    }

    #[test]
    fn hostname_validation() {
        assert!(is_valid_hostname("example.com"));
        assert!(is_valid_hostname("a-b.c-d.example"));
        assert!(is_valid_hostname("localhost"));
        assert!(is_valid_hostname("10.0.0.1"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-bad.example.com"));
        assert!(!is_valid_hostname("bad-.example.com"));
        assert!(!is_valid_hostname("under_score.example.com"));
        assert!(!is_valid_hostname("a..b"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
        let long = ["a"; 127].join(".");
        assert_eq!(long.len(), 253);
        assert!(is_valid_hostname(&long));
        assert!(!is_valid_hostname(&format!("{long}a")));
    }

    #[test]
    fn repeated_headers_are_joined() {
        let h = headers(&[("accept", "text/html"), ("accept", "application/json")]);
        let flat = flatten_headers(&h);
        assert_eq!(flat["accept"], "text/html, application/json");
    }

    #[test]
    fn forwarded_uri_overrides_path() {
        let req = axum::http::Request::builder()
            .uri("/proxy")
            .header("x-forwarded-uri", "/orders?page=2")
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();
        assert_eq!(request_path(&parts), "/orders?page=2");

        let req = axum::http::Request::builder()
            .uri("/items?q=1")
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();
        assert_eq!(request_path(&parts), "/items?q=1");
    }

    #[test]
    fn client_ip_sources() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req.into_parts().0), "203.0.113.7");

        let mut req = axum::http::Request::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(client_ip(&req.into_parts().0), "192.0.2.1");

        let req = axum::http::Request::builder().body(()).unwrap();
        assert_eq!(client_ip(&req.into_parts().0), "unknown");
    }

    #[tokio::test]
    async fn body_limit_is_inclusive() {
        let limit = 16;
        let ok = read_body_limited(Body::from(vec![0u8; 16]), &HeaderMap::new(), limit)
            .await
            .unwrap();
        assert_eq!(ok.len(), 16);

        let over = read_body_limited(Body::from(vec![0u8; 17]), &HeaderMap::new(), limit).await;
        assert!(matches!(over, Err(BodyError::TooLarge)));

        let declared = headers(&[("content-length", "1000")]);
        let early = read_body_limited(Body::empty(), &declared, limit).await;
        assert!(matches!(early, Err(BodyError::TooLarge)));
    }

    #[test]
    fn response_copy_skips_framing_and_rejects_bad_status() {
        let resp = into_http_response(HttpExchangeResponse {
            request_id: "r".into(),
            status_code: 201,
            headers: HashMap::from([
                ("x-custom".to_string(), "yes".to_string()),
                ("transfer-encoding".to_string(), "chunked".to_string()),
            ]),
            body: b"made".to_vec(),
            processing_time_ms: 3,
        });
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-custom"], "yes");
        assert!(resp.headers().get("transfer-encoding").is_none());

        let bad = into_http_response(HttpExchangeResponse {
            status_code: 42,
            ..Default::default()
        });
        assert_eq!(bad.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
