//! Heartbeat loop for tunnel keepalive.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use burrow_proto::Envelope;

/// Queue a heartbeat envelope every `interval`, forever.
///
/// A failed send is logged and the loop carries on; the caller ends the loop
/// by dropping the future together with the session.
pub async fn run_heartbeat(outbound: mpsc::UnboundedSender<Envelope>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await; // Skip first immediate tick

    loop {
        timer.tick().await;
        if outbound.send(Envelope::heartbeat()).is_err() {
            warn!("Failed to send heartbeat: outbound channel closed");
        } else {
            debug!("Heartbeat sent");
        }
    }
}
