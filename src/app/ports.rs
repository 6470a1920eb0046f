//! Port traits: the boundary between the dispatcher and the outside world.
//!
//! ```text
//!   HAL adapter ◀── HalPort ◀── AwareService ──▶ ClientEventSink / SessionEventSink
//!                                    │
//!                                    └──▶ InterfaceArbiter (consent)
//! ```
//!
//! The [`AwareService`](super::service::AwareService) takes the HAL and the
//! sinks as generic parameters on each call, so the core never owns an
//! adapter and tests substitute recording mocks.
//!
//! ## HAL contract
//!
//! Every [`HalPort`] request returns a synchronous accept flag.  `false`
//! means the command was never issued; no completion will follow and the
//! transaction id is not kept.  `true` promises exactly one asynchronous
//! [`HalEvent`](super::commands::HalEvent) keyed by the same transaction
//! id, unless the command is documented as fire-and-forget.

use super::events::{ClientEvent, SessionEvent};
use crate::merge::EffectiveConfig;
use crate::request::{PublishConfig, SubscribeConfig};
use crate::types::{
    CallbackId, ClientId, MacAddr, PubSubId, RequestorInstanceId, TransactionId,
};

// ───────────────────────────────────────────────────────────────
// HAL port (driven adapter: dispatcher → firmware)
// ───────────────────────────────────────────────────────────────

pub trait HalPort {
    /// One-time capability query.  Completes with `ResponseData::Capabilities`.
    fn query_capabilities(&mut self, tid: TransactionId) -> bool;

    /// Enable the interface (`initial`) or push a new configuration.
    fn enable_and_configure(
        &mut self,
        tid: TransactionId,
        config: &EffectiveConfig,
        initial: bool,
    ) -> bool;

    fn disable(&mut self, tid: TransactionId) -> bool;

    /// Start a publish, or update one when `pub_sub_id` is `Some`.
    /// Completes with `ResponseData::PubSubId`.
    fn publish(
        &mut self,
        tid: TransactionId,
        pub_sub_id: Option<PubSubId>,
        config: &PublishConfig,
    ) -> bool;

    /// Start a subscribe, or update one when `pub_sub_id` is `Some`.
    fn subscribe(
        &mut self,
        tid: TransactionId,
        pub_sub_id: Option<PubSubId>,
        config: &SubscribeConfig,
    ) -> bool;

    /// Fire-and-forget; any completion is ignored.
    fn stop_publish(&mut self, tid: TransactionId, pub_sub_id: PubSubId) -> bool;

    /// Fire-and-forget; any completion is ignored.
    fn stop_subscribe(&mut self, tid: TransactionId, pub_sub_id: PubSubId) -> bool;

    /// Completes with `MessageQueued` and later `MessageTxStatus`.
    fn send_message(
        &mut self,
        tid: TransactionId,
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        payload: &[u8],
    ) -> bool;

    fn suspend(&mut self, tid: TransactionId, pub_sub_id: PubSubId) -> bool;

    fn resume(&mut self, tid: TransactionId, pub_sub_id: PubSubId) -> bool;

    /// Completes with `ResponseData::Handle(bootstrap_id)`.
    fn initiate_bootstrapping(
        &mut self,
        tid: TransactionId,
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
        method: u16,
    ) -> bool;

    /// Completes with `ResponseData::Handle(pairing_id)`.
    fn initiate_pairing(
        &mut self,
        tid: TransactionId,
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        peer_mac: MacAddr,
    ) -> bool;

    fn respond_to_pairing(&mut self, tid: TransactionId, pairing_id: u32, accept: bool) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Event sinks (driven adapters: dispatcher → clients)
// ───────────────────────────────────────────────────────────────

/// Per-client callbacks: attach outcome, termination, cluster and identity.
pub trait ClientEventSink {
    fn on_client_event(&mut self, client_id: ClientId, event: &ClientEvent);
}

/// Per-session callbacks, addressed by the callback token the client
/// supplied with its publish or subscribe.
pub trait SessionEventSink {
    fn on_session_event(&mut self, client_id: ClientId, callback: CallbackId, event: &SessionEvent);
}

/// Both sink capabilities in one handle.
pub trait EventSink: ClientEventSink + SessionEventSink {}

impl<T: ClientEventSink + SessionEventSink> EventSink for T {}

// ───────────────────────────────────────────────────────────────
// Interface arbiter (consent before taking the radio)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Rejected,
    /// Ask the user; the dispatcher suspends until
    /// [`resolve_consent`](super::service::AwareService::resolve_consent).
    Pending,
}

/// Decides whether an attach may take the radio from a conflicting interface.
pub trait InterfaceArbiter {
    fn request(&mut self, client_id: ClientId, package: &str) -> Consent;
}

/// Arbiter that never objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrantAll;

impl InterfaceArbiter for GrantAll {
    fn request(&mut self, _client_id: ClientId, _package: &str) -> Consent {
        Consent::Granted
    }
}

// ───────────────────────────────────────────────────────────────
// Timeout delegate (decouples the scheduler from the command queue)
// ───────────────────────────────────────────────────────────────

/// Invoked by the [`TimeoutScheduler`](crate::scheduler::TimeoutScheduler)
/// for each expired transaction.  The command queue implements this by
/// enqueueing a timeout command, so expiry is processed in arrival order.
pub trait TimeoutDelegate {
    fn on_timeout(&mut self, id: TransactionId);
}
