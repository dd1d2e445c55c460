#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tower::ServiceExt;

use burrow_broker::gateway::{AppState, GatewaySettings, build_router};
use burrow_broker::registry::{SessionHandle, SingleSessionRegistry, TunnelRegistry};
use burrow_broker::routing::{FileDomainRouter, Route};
use burrow_proto::{Envelope, EnvelopeKind, HttpExchangeRequest, HttpExchangeResponse};

const AGENT: &str = "agent-1";
const DOMAIN: &str = "app.example.com";

struct Gateway {
    app: axum::Router,
    registry: Arc<dyn TunnelRegistry>,
}

fn gateway(settings: GatewaySettings) -> Gateway {
    let registry: Arc<dyn TunnelRegistry> = Arc::new(SingleSessionRegistry::new());
    let routes = FileDomainRouter::from_routes([(
        DOMAIN.to_string(),
        Route {
            agent_id: AGENT.into(),
            target_port: 8080,
            description: None,
        },
    )]);
    let app = build_router(AppState {
        registry: Arc::clone(&registry),
        routes: Arc::new(routes),
        settings,
    });
    Gateway { app, registry }
}

fn short_timeout() -> GatewaySettings {
    GatewaySettings {
        request_timeout: Duration::from_millis(300),
        ..GatewaySettings::default()
    }
}

/// Stand-in agent: answers every request through `respond`, and reports what
/// it saw on the returned channel.
fn spawn_agent<F>(
    registry: &Arc<dyn TunnelRegistry>,
    respond: F,
) -> (SessionHandle, mpsc::UnboundedReceiver<HttpExchangeRequest>)
where
    F: Fn(&HttpExchangeRequest) -> Option<HttpExchangeResponse> + Send + 'static,
{
    let (handle, mut outbound) = registry.register(AGENT).unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let registry = Arc::clone(registry);
    let session = handle.clone();
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let EnvelopeKind::Request(req) = envelope.into_kind() else {
                continue;
            };
            if let Some(resp) = respond(&req) {
                let reply = Envelope::response(resp);
                if registry.accept_inbound(&session, &reply)
                    && let EnvelopeKind::Response(r) = reply.into_kind()
                {
                    registry.receive_response(&session, r);
                }
            }
            let _ = seen_tx.send(req);
        }
    });
    (handle, seen_rx)
}

fn ok_response(req: &HttpExchangeRequest) -> Option<HttpExchangeResponse> {
    Some(HttpExchangeResponse {
        request_id: req.request_id.clone(),
        status_code: 200,
        headers: HashMap::from([
            ("content-type".to_string(), "text/plain".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
        ]),
        body: b"ok".to_vec(),
        processing_time_ms: 3,
    })
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

fn proxy_request(host: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/proxy")
        .header("x-forwarded-host", host)
        .header("x-forwarded-uri", "/api/items?page=2")
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint() {
    let gw = gateway(GatewaySettings::default());
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _, body) = send(&gw.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Broker OK");
}

#[tokio::test]
async fn mapped_domain_with_agent_offline_is_503() {
    let gw = gateway(GatewaySettings::default());
    let (status, headers, body) = send(&gw.app, proxy_request(DOMAIN, Vec::new())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers["x-error-source"], "broker");
    assert!(body.contains("Agent offline: agent-1"), "{body}");
}

#[tokio::test]
async fn unmapped_domain_is_404() {
    let gw = gateway(GatewaySettings::default());
    let (status, _, body) = send(&gw.app, proxy_request("other.example.com", Vec::new())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("Domain not configured: other.example.com"));
}

#[tokio::test]
async fn invalid_or_missing_host_is_400() {
    let gw = gateway(GatewaySettings::default());
    let (status, _, body) = send(&gw.app, proxy_request("bad_host!", Vec::new())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid domain"));

    let req = Request::builder()
        .method("POST")
        .uri("/proxy")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&gw.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Missing host"));
}

#[tokio::test]
async fn connected_agent_answers_through_tunnel() {
    let gw = gateway(GatewaySettings::default());
    let (_handle, mut seen) = spawn_agent(&gw.registry, ok_response);

    let (status, headers, body) =
        send(&gw.app, proxy_request("App.Example.com:443", b"payload".to_vec())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
    assert_eq!(headers["content-type"], "text/plain");
    assert!(headers.get("transfer-encoding").is_none());

    let req = seen.recv().await.unwrap();
    assert_eq!(req.method, "POST");
    assert_eq!(req.host, DOMAIN);
    assert_eq!(req.path, "/api/items?page=2");
    assert_eq!(req.client_ip, "203.0.113.9");
    assert_eq!(req.body, b"payload");
    assert!(uuid::Uuid::parse_str(&req.request_id).is_ok());
}

#[tokio::test]
async fn any_path_falls_through_to_proxy() {
    let gw = gateway(GatewaySettings::default());
    let (_handle, mut seen) = spawn_agent(&gw.registry, ok_response);

    let req = Request::builder()
        .method("DELETE")
        .uri("/things/7?force=true")
        .header("host", DOMAIN)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&gw.app, req).await;
    assert_eq!(status, StatusCode::OK);

    let req = seen.recv().await.unwrap();
    assert_eq!(req.method, "DELETE");
    assert_eq!(req.path, "/things/7?force=true");
    assert_eq!(req.client_ip, "unknown");
}

#[tokio::test]
async fn silent_agent_is_504() {
    let gw = gateway(short_timeout());
    let (_handle, _seen) = spawn_agent(&gw.registry, |_| None);

    let (status, _, body) = send(&gw.app, proxy_request(DOMAIN, Vec::new())).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body.contains("Gateway timeout"));
    assert_eq!(gw.registry.session_info().unwrap().pending_requests, 0);
}

#[tokio::test]
async fn body_limit_is_inclusive_and_oversize_is_never_dispatched() {
    let gw = gateway(GatewaySettings {
        max_body_bytes: 16,
        ..GatewaySettings::default()
    });
    let (_handle, mut seen) = spawn_agent(&gw.registry, ok_response);

    let (status, _, _) = send(&gw.app, proxy_request(DOMAIN, vec![b'a'; 16])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seen.recv().await.unwrap().body.len(), 16);

    let (status, _, body) = send(&gw.app, proxy_request(DOMAIN, vec![b'a'; 17])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body.contains("too large"));
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn invalid_agent_status_is_500() {
    let gw = gateway(GatewaySettings::default());
    let (_handle, _seen) = spawn_agent(&gw.registry, |req| {
        Some(HttpExchangeResponse {
            request_id: req.request_id.clone(),
            status_code: 42,
            headers: HashMap::new(),
            body: Vec::new(),
            processing_time_ms: 0,
        })
    });

    let (status, _, _) = send(&gw.app, proxy_request(DOMAIN, Vec::new())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn admin_reload_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.json");
    std::fs::write(&path, r#"{"routes":{}}"#).unwrap();

    let routes = Arc::new(FileDomainRouter::load(&path).unwrap());
    let app = build_router(AppState {
        registry: Arc::new(SingleSessionRegistry::new()),
        routes: Arc::clone(&routes) as Arc<dyn burrow_broker::routing::DomainRouter>,
        settings: GatewaySettings {
            admin_token: Some("s3cret".into()),
            ..GatewaySettings::default()
        },
    });

    let reload = |token: Option<&str>| {
        let mut builder = Request::builder().method("POST").uri("/admin/reload-routes");
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    };

    let (status, _, _) = send(&app, reload(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(&app, reload(Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    std::fs::write(
        &path,
        r#"{"routes":{"new.example.com":{"agentId":"agent-1","targetPort":3000}}}"#,
    )
    .unwrap();
    let (status, _, body) = send(&app, reload(Some("s3cret"))).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["routes"], 1);
    assert_eq!(routes.len(), 1);
}
