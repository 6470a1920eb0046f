//! Identifier aliases and small value types shared by every component.
//!
//! Identifiers are plain integer aliases, mirroring how the HAL and the
//! client-facing API exchange them.  Only [`MacAddr`] gets a newtype because
//! it has a canonical textual form.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::NanStatus;

/// Caller-assigned identifier of an attached client.
pub type ClientId = u32;

/// Identity of the process owning a client (quota principal).
pub type Uid = u32;

/// Host-assigned discovery session id, strictly increasing for the manager lifetime.
pub type SessionId = u32;

/// Host-assigned peer id, stable for a `(session, requestor instance id)` pair.
pub type PeerId = u32;

/// Correlation token binding an issued HAL command to its completion.
pub type TransactionId = u16;

/// HAL-assigned publish or subscribe instance id.
pub type PubSubId = u8;

/// Firmware-assigned id naming a discovered remote NAN instance.
pub type RequestorInstanceId = u32;

/// Opaque token naming the session callback a publish/subscribe was registered with.
pub type CallbackId = u64;

/// Application-chosen id of an outbound message, echoed in send callbacks.
pub type MessageId = u32;

/// 48-bit IEEE MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Discovery session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Publish,
    Subscribe,
}

/// Why a discovery session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminateReason {
    /// Torn down on the host (owning client disconnected).
    LocalRequest,
    /// Firmware finished the session normally (TTL expiry, count reached).
    Done,
    /// Firmware aborted the session.
    Failure(NanStatus),
}

/// Kind of cluster event reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEventKind {
    Started,
    Joined,
}

/// Fixed limits reported once by the HAL capability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_publishes: usize,
    pub max_subscribes: usize,
    pub max_service_name_len: usize,
    pub max_service_specific_info_len: usize,
    pub max_match_filter_len: usize,
    /// Depth of the firmware transmit queue for follow-up messages.
    pub max_queued_transmit_messages: usize,
    pub supports_instant_mode: bool,
    pub supports_suspension: bool,
    pub supports_pairing: bool,
}

impl Default for Capabilities {
    /// Conservative limits used until the HAL answers the capability query.
    fn default() -> Self {
        Self {
            max_publishes: 8,
            max_subscribes: 8,
            max_service_name_len: 255,
            max_service_specific_info_len: 255,
            max_match_filter_len: 255,
            max_queued_transmit_messages: 2,
            supports_instant_mode: false,
            supports_suspension: false,
            supports_pairing: false,
        }
    }
}
