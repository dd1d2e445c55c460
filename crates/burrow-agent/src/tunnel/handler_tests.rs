//! Tests for RequestHandler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use burrow_proto::{Envelope, EnvelopeKind, HttpExchangeRequest, HttpExchangeResponse, now_ms};

use super::{HANDLER_ERROR_SOURCE, RequestHandler};
use crate::forwarder::Forward;

/// Answers 200 with the request path as body, counting calls.
#[derive(Default)]
struct EchoForwarder {
    calls: AtomicUsize,
}

#[tonic::async_trait]
impl Forward for EchoForwarder {
    async fn forward(&self, request: HttpExchangeRequest) -> HttpExchangeResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HttpExchangeResponse {
            request_id: request.request_id,
            status_code: 200,
            headers: HashMap::new(),
            body: request.path.into_bytes(),
            processing_time_ms: 1,
        }
    }
}

struct PanickingForwarder;

#[tonic::async_trait]
impl Forward for PanickingForwarder {
    async fn forward(&self, _request: HttpExchangeRequest) -> HttpExchangeResponse {
        panic!("upstream client exploded");
    }
}

/// Tracks the highest number of concurrent forwards.
#[derive(Default)]
struct SlowForwarder {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[tonic::async_trait]
impl Forward for SlowForwarder {
    async fn forward(&self, request: HttpExchangeRequest) -> HttpExchangeResponse {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        HttpExchangeResponse {
            request_id: request.request_id,
            status_code: 204,
            headers: HashMap::new(),
            body: Vec::new(),
            processing_time_ms: 50,
        }
    }
}

fn request(id: &str) -> Envelope {
    Envelope::request(HttpExchangeRequest {
        request_id: id.into(),
        method: "GET".into(),
        path: format!("/{id}"),
        host: "app.example.com".into(),
        client_ip: "192.0.2.10".into(),
        headers: HashMap::new(),
        body: Vec::new(),
    })
}

fn setup(
    forwarder: Arc<dyn Forward>,
    max_concurrent: Option<usize>,
) -> (RequestHandler, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RequestHandler::new(forwarder, tx, max_concurrent), rx)
}

async fn next_response(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> HttpExchangeResponse {
    let env = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("response within deadline")
        .expect("outbound open");
    match env.into_kind() {
        EnvelopeKind::Response(resp) => resp,
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn request_produces_matching_response() {
    let (handler, mut rx) = setup(Arc::new(EchoForwarder::default()), None);
    handler.handle(request("r-1"));

    let resp = next_response(&mut rx).await;
    assert_eq!(resp.request_id, "r-1");
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body, b"/r-1");
}

#[tokio::test]
async fn panicking_forward_still_yields_500() {
    let (handler, mut rx) = setup(Arc::new(PanickingForwarder), None);
    handler.handle(request("r-boom"));

    let resp = next_response(&mut rx).await;
    assert_eq!(resp.request_id, "r-boom");
    assert_eq!(resp.status_code, 500);
    assert_eq!(resp.headers["x-error-source"], HANDLER_ERROR_SOURCE);
    let json: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(json["error"], "Internal agent error");
    assert_eq!(json["source"], "agent");
}

#[tokio::test]
async fn health_check_is_answered() {
    let (handler, mut rx) = setup(Arc::new(EchoForwarder::default()), None);
    handler.handle(Envelope::control("health_check", ""));

    let env = rx.recv().await.unwrap();
    let EnvelopeKind::Control(ctl) = env.into_kind() else {
        panic!("expected control reply");
    };
    assert_eq!(ctl.command, "health_check_response");
    assert_eq!(ctl.data, "OK");
}

#[tokio::test]
async fn unknown_control_is_ignored() {
    let (handler, mut rx) = setup(Arc::new(EchoForwarder::default()), None);
    handler.handle(Envelope::control("reload_config", ""));
    handler.handle(Envelope::heartbeat());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_message_id_is_forwarded_once() {
    let forwarder = Arc::new(EchoForwarder::default());
    let (handler, mut rx) = setup(Arc::clone(&forwarder) as Arc<dyn Forward>, None);

    let env = request("r-dup");
    handler.handle(env.clone());
    handler.handle(env);

    next_response(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_envelope_is_dropped() {
    let forwarder = Arc::new(EchoForwarder::default());
    let (handler, mut rx) = setup(Arc::clone(&forwarder) as Arc<dyn Forward>, None);

    let mut env = request("r-old");
    env.timestamp_ms = now_ms() - 6 * 60 * 1000;
    handler.handle(env);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(forwarder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrency_ceiling_is_respected() {
    let forwarder = Arc::new(SlowForwarder::default());
    let (handler, mut rx) = setup(Arc::clone(&forwarder) as Arc<dyn Forward>, Some(1));

    for i in 0..3 {
        handler.handle(request(&format!("r-{i}")));
    }
    for _ in 0..3 {
        assert_eq!(next_response(&mut rx).await.status_code, 204);
    }
    assert_eq!(forwarder.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unbounded_by_default() {
    let forwarder = Arc::new(SlowForwarder::default());
    let (handler, mut rx) = setup(Arc::clone(&forwarder) as Arc<dyn Forward>, None);

    for i in 0..3 {
        handler.handle(request(&format!("r-{i}")));
    }
    for _ in 0..3 {
        next_response(&mut rx).await;
    }
    assert_eq!(forwarder.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn closed_outbound_is_tolerated() {
    let (handler, rx) = setup(Arc::new(EchoForwarder::default()), None);
    drop(rx);
    handler.handle(request("r-late"));
    tokio::time::sleep(Duration::from_millis(20)).await;
}
