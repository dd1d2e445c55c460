//! Connection manager that keeps the agent attached to the broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Streaming};
use tracing::{error, info, warn};

use burrow_proto::tunnel_service_client::TunnelServiceClient;
use burrow_proto::{Envelope, MAX_ENVELOPE_BYTES, PingRequest, now_ms};

use super::config::TunnelConfig;
use super::error::TunnelClientError;
use super::handler::RequestHandler;
use super::heartbeat::run_heartbeat;
use super::state::ConnectionState;
use super::tls::{BrokerAddr, connect, load_client_tls};
use crate::forwarder::Forward;

/// Maintains one tunnel session at a time, reconnecting with backoff.
pub struct ConnectionManager {
    config: TunnelConfig,
    forwarder: Arc<dyn Forward>,
    state: watch::Sender<ConnectionState>,
    /// Most recent reconnect delay. `None` until the first retry.
    backoff: watch::Sender<Option<Duration>>,
}

impl ConnectionManager {
    pub fn new(config: TunnelConfig, forwarder: Arc<dyn Forward>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (backoff, _) = watch::channel(None);
        Self {
            config,
            forwarder,
            state,
            backoff,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe the delay chosen before each reconnect.
    pub fn subscribe_backoff(&self) -> watch::Receiver<Option<Duration>> {
        self.backoff.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "Connection state changed");
        }
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// Each attempt goes through the TLS handshake, a ping health check and
    /// then the envelope stream. Failed attempts are retried with exponential
    /// backoff; the backoff resets once an attempt reaches streaming.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelClientError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Tunnel client shutting down");
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }

            let mut streamed = false;
            let outcome = tokio::select! {
                result = self.connect_and_run(&mut streamed) => result,
                _ = shutdown.changed() => {
                    info!("Tunnel client received shutdown signal");
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
            };

            let Err(e) = outcome else {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            };
            if e.is_fatal() {
                error!(error = %e, "Fatal tunnel error, not reconnecting");
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
            if streamed {
                attempt = 0;
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            self.backoff.send_replace(Some(delay));
            warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

            tokio::select! {
                () = sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("Tunnel client shutting down during reconnect wait");
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }

    /// One attempt: handshake, health check, then stream until it fails.
    async fn connect_and_run(&self, streamed: &mut bool) -> Result<(), TunnelClientError> {
        self.set_state(ConnectionState::Authenticating);
        let tls = load_client_tls(&self.config)?;
        let addr = BrokerAddr::parse(
            &self.config.broker_url,
            self.config.tls_server_name.as_deref(),
        )?;
        if let (Some(configured), Some(cn)) = (&self.config.agent_id, &tls.common_name)
            && configured != cn
        {
            warn!(
                agent_id = %configured,
                certificate_cn = %cn,
                "Configured agent id differs from certificate CN; the broker uses the CN"
            );
        }

        let channel = connect(&addr, tls.config).await?;
        let mut client = TunnelServiceClient::new(channel)
            .max_decoding_message_size(MAX_ENVELOPE_BYTES)
            .max_encoding_message_size(MAX_ENVELOPE_BYTES);

        self.set_state(ConnectionState::HealthChecking);
        self.ping(&mut client).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let response = client
            .establish_tunnel(UnboundedReceiverStream::new(outbound_rx))
            .await
            .map_err(|s| TunnelClientError::Stream(format!("{}: {}", s.code(), s.message())))?;

        *streamed = true;
        self.set_state(ConnectionState::Streaming);
        info!(
            broker = %self.config.broker_url,
            agent_id = tls.common_name.as_deref().unwrap_or("<unknown>"),
            "Tunnel established, agent is online"
        );

        let handler = RequestHandler::new(
            Arc::clone(&self.forwarder),
            outbound_tx.clone(),
            self.config.max_concurrent_requests,
        );

        tokio::select! {
            result = read_loop(&handler, response.into_inner()) => result,
            () = run_heartbeat(outbound_tx, self.config.heartbeat_interval) => {
                Err(TunnelClientError::Stream("heartbeat loop exited".into()))
            }
        }
    }

    async fn ping(&self, client: &mut TunnelServiceClient<Channel>) -> Result<(), TunnelClientError> {
        let sent = now_ms();
        let mut request = Request::new(PingRequest { timestamp: sent });
        request.set_timeout(self.config.ping_timeout);

        let reply = tokio::time::timeout(self.config.ping_timeout, client.ping(request))
            .await
            .map_err(|_| TunnelClientError::HealthCheck("ping timed out".into()))?
            .map_err(|s| TunnelClientError::HealthCheck(format!("{}: {}", s.code(), s.message())))?
            .into_inner();

        info!(
            server_version = %reply.server_version,
            latency_ms = now_ms() - sent,
            "Ping successful"
        );
        Ok(())
    }
}

async fn read_loop(
    handler: &RequestHandler,
    mut inbound: Streaming<Envelope>,
) -> Result<(), TunnelClientError> {
    loop {
        match inbound.next().await {
            Some(Ok(envelope)) => handler.handle(envelope),
            Some(Err(status)) => {
                return Err(TunnelClientError::Stream(format!(
                    "{}: {}",
                    status.code(),
                    status.message()
                )));
            }
            None => {
                return Err(TunnelClientError::Connection(
                    "Stream ended by broker".into(),
                ));
            }
        }
    }
}
