use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{transport::Transport, ClientEvent};

/// Last known reachability of the primary transport.
///
/// Starts out unavailable; only [`TransportGate::probe`] writes the flag.
pub struct TransportGate {
    available: AtomicBool,
    timeout: Duration,
    events: broadcast::Sender<ClientEvent>,
}

impl TransportGate {
    pub fn new(timeout: Duration, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            available: AtomicBool::new(false),
            timeout,
            events,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub async fn probe(&self, transport: &dyn Transport) -> bool {
        let available = match tokio::time::timeout(self.timeout, transport.health()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(transport = transport.name(), "transport: probe failed: {err}");
                false
            }
            Err(_) => {
                debug!(transport = transport.name(), "transport: probe timed out");
                false
            }
        };

        let previous = self.available.swap(available, Ordering::AcqRel);
        if previous != available {
            info!(
                transport = transport.name(),
                available, "transport: primary availability changed"
            );
            let _ = self.events.send(ClientEvent::GateChanged { available });
        }
        available
    }
}
