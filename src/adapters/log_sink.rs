//! Log-based event sink adapter.
//!
//! Writes every client and session event through the `log` facade.  Used
//! by the simulation binary; a binder or socket adapter would implement the
//! same two traits.

use log::{info, warn};

use crate::app::events::{ClientEvent, SessionEvent};
use crate::app::ports::{ClientEventSink, SessionEventSink};
use crate::types::{CallbackId, ClientId};

/// Logs events and counts them by kind.
#[derive(Debug, Default)]
pub struct LogEventSink {
    pub client_events: usize,
    pub session_events: usize,
    pub failures: usize,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientEventSink for LogEventSink {
    fn on_client_event(&mut self, client_id: ClientId, event: &ClientEvent) {
        self.client_events += 1;
        match event {
            ClientEvent::AttachFailed(reason) => {
                self.failures += 1;
                warn!("CLIENT {client_id} | attach failed: {reason}");
            }
            ClientEvent::ClusterChanged { kind, cluster_id } => {
                info!("CLIENT {client_id} | cluster {kind:?} {cluster_id}");
            }
            ClientEvent::IdentityChanged { mac } => info!("CLIENT {client_id} | identity {mac}"),
            other => info!("CLIENT {client_id} | {other:?}"),
        }
    }
}

impl SessionEventSink for LogEventSink {
    fn on_session_event(&mut self, client_id: ClientId, callback: CallbackId, event: &SessionEvent) {
        self.session_events += 1;
        if event.is_failure() {
            self.failures += 1;
            warn!("SESSION {client_id}/{callback} | {event:?}");
        } else {
            info!("SESSION {client_id}/{callback} | {event:?}");
        }
    }
}
