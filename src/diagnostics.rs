//! Introspection snapshot.
//!
//! A read-only copy of the dispatcher's state for debugging and tests.
//! Exported as JSON for humans and as postcard for compact dumps.

use serde::Serialize;

use crate::directory::{Directory, PeerHandle};
use crate::merge::EffectiveConfig;
use crate::types::{
    Capabilities, ClientId, PubSubId, Role, SessionId, TransactionId, Uid,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub pub_sub_id: PubSubId,
    pub role: Role,
    pub suspended: bool,
    pub peers: Vec<PeerHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSnapshot {
    pub client_id: ClientId,
    pub uid: Uid,
    pub pid: u32,
    pub package: String,
    pub wants_identity: bool,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub usage_enabled: bool,
    pub enabled: bool,
    pub instant_mode: bool,
    pub consent_pending: bool,
    pub applied: Option<EffectiveConfig>,
    pub capabilities: Capabilities,
    pub clients: Vec<ClientSnapshot>,
    pub pending_transactions: Vec<TransactionId>,
    pub deferred_commands: usize,
    pub host_queue_len: usize,
    pub firmware_queue_len: usize,
    pub firmware_queue_full: bool,
}

impl ServiceSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_postcard(&self) -> postcard::Result<Vec<u8>> {
        postcard::to_allocvec(self)
    }
}

/// Clients in attach order with their sessions in creation order.
pub fn capture_clients(directory: &Directory) -> Vec<ClientSnapshot> {
    directory
        .clients()
        .map(|c| ClientSnapshot {
            client_id: c.client_id,
            uid: c.uid,
            pid: c.pid,
            package: c.package.clone(),
            wants_identity: c.wants_identity,
            sessions: c
                .sessions
                .iter()
                .filter_map(|sid| directory.session(*sid))
                .map(|s| SessionSnapshot {
                    session_id: s.session_id,
                    pub_sub_id: s.pub_sub_id,
                    role: s.role(),
                    suspended: s.suspended,
                    peers: s.peers().copied().collect(),
                })
                .collect(),
        })
        .collect()
}
