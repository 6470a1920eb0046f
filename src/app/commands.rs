//! Inbound commands to the dispatcher.
//!
//! Client API calls, HAL callbacks and timeout firings all become a
//! [`Command`] and enter the same FIFO, so one worker sees them in arrival
//! order.

use crate::error::NanStatus;
use crate::request::{ConfigRequest, PublishConfig, SubscribeConfig};
use crate::transaction::{Scope, Scopes, scopes};
use crate::types::{
    CallbackId, Capabilities, ClientId, ClusterEventKind, MacAddr, MessageId, PeerId, PubSubId,
    RequestorInstanceId, Role, SessionId, TerminateReason, TransactionId, Uid,
};

/// Anything the dispatcher can dequeue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Api(Request),
    Hal(HalEvent),
    /// A transaction's timeout expired.
    Timeout(TransactionId),
}

impl From<Request> for Command {
    fn from(r: Request) -> Self {
        Self::Api(r)
    }
}

impl From<HalEvent> for Command {
    fn from(e: HalEvent) -> Self {
        Self::Hal(e)
    }
}

// ───────────────────────────────────────────────────────────────
// Client API
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect {
        client_id: ClientId,
        uid: Uid,
        pid: u32,
        package: String,
        config: ConfigRequest,
        wants_identity: bool,
    },
    Disconnect {
        client_id: ClientId,
    },
    Publish {
        client_id: ClientId,
        callback: CallbackId,
        config: PublishConfig,
    },
    Subscribe {
        client_id: ClientId,
        callback: CallbackId,
        config: SubscribeConfig,
    },
    UpdatePublish {
        client_id: ClientId,
        session_id: SessionId,
        config: PublishConfig,
    },
    UpdateSubscribe {
        client_id: ClientId,
        session_id: SessionId,
        config: SubscribeConfig,
    },
    TerminateSession {
        client_id: ClientId,
        session_id: SessionId,
    },
    SendMessage {
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
        message_id: MessageId,
        payload: Vec<u8>,
        retry_count: u8,
    },
    Suspend {
        client_id: ClientId,
        session_id: SessionId,
    },
    Resume {
        client_id: ClientId,
        session_id: SessionId,
    },
    InitiateBootstrapping {
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
        method: u16,
    },
    InitiatePairing {
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
    },
    RespondToPairing {
        client_id: ClientId,
        session_id: SessionId,
        pairing_id: u32,
        accept: bool,
    },
    /// Gating signal: location, doze, radio and policy folded into one flag.
    SetUsageEnabled(bool),
    SetInstantMode(bool),
    QueryCapabilities,
}

impl Request {
    /// Targets this request must not share with an outstanding command.
    ///
    /// Messages and the usage toggle are never deferred.
    pub fn scopes(&self) -> Scopes {
        match *self {
            Self::Connect { client_id, .. } | Self::Disconnect { client_id } => {
                scopes(&[Scope::Client(client_id), Scope::Device])
            }
            Self::Publish { client_id, .. } | Self::Subscribe { client_id, .. } => {
                scopes(&[Scope::Client(client_id)])
            }
            Self::UpdatePublish { client_id, session_id, .. }
            | Self::UpdateSubscribe { client_id, session_id, .. }
            | Self::TerminateSession { client_id, session_id }
            | Self::Suspend { client_id, session_id }
            | Self::Resume { client_id, session_id }
            | Self::InitiateBootstrapping { client_id, session_id, .. }
            | Self::InitiatePairing { client_id, session_id, .. }
            | Self::RespondToPairing { client_id, session_id, .. } => {
                scopes(&[Scope::Session(client_id, session_id)])
            }
            Self::SetInstantMode(_) | Self::QueryCapabilities => scopes(&[Scope::Device]),
            Self::SendMessage { .. } | Self::SetUsageEnabled(_) => Scopes::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// HAL callbacks
// ───────────────────────────────────────────────────────────────

/// Payload of a successful command response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    Done,
    PubSubId(PubSubId),
    Capabilities(Capabilities),
    /// Bootstrap or pairing handle assigned by firmware.
    Handle(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HalEvent {
    CommandResponse {
        transaction_id: TransactionId,
        result: Result<ResponseData, NanStatus>,
    },
    /// Firmware accepted (or refused) a follow-up message into its queue.
    MessageQueued {
        transaction_id: TransactionId,
        status: Result<(), NanStatus>,
    },
    /// Final over-the-air outcome of a follow-up message.
    MessageTxStatus {
        transaction_id: TransactionId,
        status: Result<(), NanStatus>,
    },
    SessionTerminated {
        pub_sub_id: PubSubId,
        role: Role,
        reason: TerminateReason,
    },
    Match {
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        service_specific_info: Vec<u8>,
        match_filter: Vec<u8>,
    },
    MatchExpired {
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
    },
    MessageReceived {
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        payload: Vec<u8>,
    },
    ClusterChanged {
        kind: ClusterEventKind,
        cluster_id: MacAddr,
    },
    InterfaceAddressChanged {
        mac: MacAddr,
    },
    BootstrappingConfirm {
        bootstrap_id: u32,
        accepted: bool,
    },
    PairingRequest {
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        pairing_id: u32,
    },
    PairingConfirm {
        pairing_id: u32,
        accepted: bool,
    },
    /// Firmware went away; everything is torn down without a disable.
    AwareDown {
        reason: NanStatus,
    },
}
