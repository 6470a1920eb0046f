//! Outbound client-visible events.
//!
//! The [`AwareService`](super::service::AwareService) delivers these through
//! the [`ClientEventSink`](super::ports::ClientEventSink) and
//! [`SessionEventSink`](super::ports::SessionEventSink) ports.  Each request
//! produces at most one terminal event.

use serde::Serialize;

use crate::error::NanStatus;
use crate::types::{ClusterEventKind, MacAddr, MessageId, PeerId, SessionId, TerminateReason};

/// Events addressed to a client as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClientEvent {
    AttachSucceeded,
    AttachFailed(NanStatus),
    /// The client was detached by the service (usage disabled, firmware down)
    /// or completed its own detach.
    Terminated,
    ClusterChanged {
        kind: ClusterEventKind,
        cluster_id: MacAddr,
    },
    /// Interface (discovery) MAC address changed.
    IdentityChanged { mac: MacAddr },
}

/// Events addressed to one discovery session callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    Started { session_id: SessionId },
    ConfigSucceeded,
    ConfigFailed(NanStatus),
    Terminated(TerminateReason),

    Matched {
        peer_id: PeerId,
        service_specific_info: Vec<u8>,
        match_filter: Vec<u8>,
    },
    MatchExpired { peer_id: PeerId },
    MessageReceived { peer_id: PeerId, payload: Vec<u8> },
    MessageSendSucceeded { message_id: MessageId },
    MessageSendFailed { message_id: MessageId, reason: NanStatus },

    Suspended,
    SuspendFailed(NanStatus),
    Resumed,
    ResumeFailed(NanStatus),

    BootstrappingConfirmed { peer_id: PeerId, accepted: bool },
    BootstrappingFailed { peer_id: PeerId, reason: NanStatus },
    PairingRequested { peer_id: PeerId, pairing_id: u32 },
    PairingConfirmed { peer_id: PeerId, accepted: bool },
    PairingFailed { peer_id: PeerId, reason: NanStatus },
}

impl SessionEvent {
    /// True for events reporting a failed session-level request.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConfigFailed(_)
                | Self::MessageSendFailed { .. }
                | Self::SuspendFailed(_)
                | Self::ResumeFailed(_)
                | Self::BootstrappingFailed { .. }
                | Self::PairingFailed { .. }
        )
    }
}
