//! Aware service: the command dispatcher and hexagonal core.
//!
//! [`AwareService`] owns every registry (clients, sessions, pending
//! transactions, outbound messages) and the single command FIFO.  One call
//! to [`process`](AwareService::process) drains that FIFO in arrival order;
//! the HAL and the client sinks are injected at the call site.
//!
//! ```text
//!  submit(Request) ─┐                              ┌──▶ ClientEventSink
//!  submit(HalEvent) ┼──▶ CommandQueue ──▶ dispatch ┤
//!  advance(now) ────┘        ▲                     ├──▶ SessionEventSink
//!   (timeouts)               │ deferred            └──▶ HalPort
//!                            └─────────────────────────┘
//! ```
//!
//! Ordering rules:
//!
//! - a request whose target is held by an outstanding command is deferred
//!   and replayed, in order, once some pending command resolves;
//! - HAL events and timeouts are never deferred;
//! - between a response and its timeout, whichever is dequeued first wins.

use core::iter;
use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::diagnostics::{ServiceSnapshot, capture_clients};
use crate::directory::{Client, Directory, Handshake, Session};
use crate::error::NanStatus;
use crate::merge::{EffectiveConfig, merge};
use crate::messaging::{MessageOutcome, MessageQueue, SendRequest};
use crate::queue::CommandQueue;
use crate::request::{DiscoveryParams, PublishConfig, SessionConfig, SubscribeConfig};
use crate::transaction::{PendingKind, Scope, Scopes, TransactionRegistry, scopes};
use crate::types::{
    CallbackId, Capabilities, ClientId, MacAddr, PeerId, PubSubId, RequestorInstanceId, Role,
    SessionId, TerminateReason, TransactionId, Uid,
};

use super::commands::{Command, HalEvent, Request, ResponseData};
use super::events::{ClientEvent, SessionEvent};
use super::ports::{Consent, EventSink, GrantAll, HalPort, InterfaceArbiter};

// ───────────────────────────────────────────────────────────────
// AwareService
// ───────────────────────────────────────────────────────────────

/// Single-threaded Wi-Fi Aware dispatcher shared by every attached client.
///
/// Requests, HAL events and timeouts go in through [`submit`](Self::submit)
/// and [`advance`](Self::advance); nothing happens until
/// [`process`](Self::process) drains the FIFO.
pub struct AwareService {
    config: ManagerConfig,
    caps: Capabilities,
    queue: CommandQueue,
    registry: TransactionRegistry,
    directory: Directory,
    messages: MessageQueue,
    /// Last configuration the HAL acknowledged.
    applied: Option<EffectiveConfig>,
    /// HAL interface is up.
    enabled: bool,
    /// Gating collaborator's verdict.
    usage_enabled: bool,
    instant_mode: bool,
    arbiter: Box<dyn InterfaceArbiter>,
    /// Decision for the request parked on consent, once known.
    consent: Option<bool>,
    now_ms: u64,
}

impl AwareService {
    /// Build an idle service with default capabilities and the grant-all
    /// arbiter.
    ///
    /// A config that fails [`ManagerConfig::validate`] is replaced by the
    /// defaults.  Call [`start`](Self::start) next.
    pub fn new(config: ManagerConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!("dispatch: invalid config ({e}), using defaults");
                ManagerConfig::default()
            }
        };
        let caps = Capabilities::default();
        let messages = MessageQueue::new(
            caps.max_queued_transmit_messages,
            config.max_queued_messages_per_uid,
            config.send_message_timeout_ms,
        );
        Self {
            config,
            caps,
            queue: CommandQueue::new(),
            registry: TransactionRegistry::new(),
            directory: Directory::new(),
            messages,
            applied: None,
            enabled: false,
            usage_enabled: true,
            instant_mode: false,
            arbiter: Box::new(GrantAll),
            consent: None,
            now_ms: 0,
        }
    }

    /// Replace the default grant-everything interface arbiter.
    pub fn with_arbiter(mut self, arbiter: impl InterfaceArbiter + 'static) -> Self {
        self.arbiter = Box::new(arbiter);
        self
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Queue the one-time capability query.
    pub fn start(&mut self) {
        info!("dispatch: starting, querying capabilities");
        self.submit(Request::QueryCapabilities);
    }

    /// Append a request, HAL event or timeout to the FIFO.
    pub fn submit(&mut self, command: impl Into<Command>) {
        self.queue.push(command.into());
    }

    /// Move the clock forward and queue every timeout that expired.
    pub fn advance(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
        self.registry.poll_timeouts(self.now_ms, &mut self.queue);
    }

    /// Record the user's answer for the attach parked on consent.
    pub fn resolve_consent(&mut self, granted: bool) {
        if self.queue.is_suspended() {
            self.consent = Some(granted);
        } else {
            debug!("dispatch: consent answer with nothing suspended");
        }
    }

    /// Drain the FIFO.  Returns the number of commands handled.
    pub fn process(&mut self, hal: &mut impl HalPort, sink: &mut impl EventSink) -> usize {
        let mut handled = 0;
        loop {
            if self.queue.is_suspended() {
                let Some(granted) = self.consent.take() else {
                    break;
                };
                if let Some(request) = self.queue.resume() {
                    self.finish_consent(request, granted, hal, sink);
                    handled += 1;
                }
            } else {
                let Some(command) = self.queue.pop() else {
                    break;
                };
                self.dispatch(command, hal, sink);
                handled += 1;
            }
            self.pump_messages(hal, sink);
        }
        handled
    }

    fn dispatch(&mut self, command: Command, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        match command {
            Command::Api(request) => {
                let wanted = request.scopes();
                if self.registry.is_blocked(&wanted) || self.queue.deferred_overlaps(&wanted) {
                    self.queue.defer(request);
                } else {
                    self.execute(request, hal, sink);
                }
            }
            Command::Hal(event) => self.on_hal_event(event, hal, sink),
            Command::Timeout(tid) => self.on_timeout(tid, hal, sink),
        }
    }

    // ── Client API ────────────────────────────────────────────

    fn execute(&mut self, request: Request, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        match request {
            Request::Connect {
                client_id,
                uid,
                pid,
                package,
                config,
                wants_identity,
            } => {
                let client = Client::new(client_id, uid, pid, package, config, wants_identity);
                self.connect(client, false, hal, sink);
            }
            Request::Disconnect { client_id } => self.disconnect(client_id, hal, sink),
            Request::Publish {
                client_id,
                callback,
                config,
            } => self.publish(client_id, callback, config, hal, sink),
            Request::Subscribe {
                client_id,
                callback,
                config,
            } => self.subscribe(client_id, callback, config, hal, sink),
            Request::UpdatePublish {
                client_id,
                session_id,
                config,
            } => self.update(client_id, session_id, SessionConfig::Publish(config), hal, sink),
            Request::UpdateSubscribe {
                client_id,
                session_id,
                config,
            } => self.update(client_id, session_id, SessionConfig::Subscribe(config), hal, sink),
            Request::TerminateSession {
                client_id,
                session_id,
            } => self.terminate_session(client_id, session_id, hal),
            Request::SendMessage {
                client_id,
                session_id,
                peer_id,
                message_id,
                payload,
                retry_count,
            } => {
                let Some((uid, callback)) = self.owner(client_id, session_id) else {
                    warn!("dispatch: send on unknown session {session_id} of client {client_id}");
                    return;
                };
                let req = SendRequest {
                    client_id,
                    uid,
                    session_id,
                    callback,
                    peer_id,
                    message_id,
                    payload,
                    retry_count,
                };
                if let Err(reason) = self.send_message(req) {
                    sink.on_session_event(
                        client_id,
                        callback,
                        &SessionEvent::MessageSendFailed { message_id, reason },
                    );
                }
            }
            Request::Suspend {
                client_id,
                session_id,
            } => self.suspend_or_resume(client_id, session_id, true, hal, sink),
            Request::Resume {
                client_id,
                session_id,
            } => self.suspend_or_resume(client_id, session_id, false, hal, sink),
            Request::InitiateBootstrapping {
                client_id,
                session_id,
                peer_id,
                method,
            } => self.initiate_bootstrapping(client_id, session_id, peer_id, method, hal, sink),
            Request::InitiatePairing {
                client_id,
                session_id,
                peer_id,
            } => self.initiate_pairing(client_id, session_id, peer_id, hal, sink),
            Request::RespondToPairing {
                client_id,
                session_id,
                pairing_id,
                accept,
            } => self.respond_to_pairing(client_id, session_id, pairing_id, accept, hal, sink),
            Request::SetUsageEnabled(enabled) => self.set_usage_enabled(enabled, hal, sink),
            Request::SetInstantMode(on) => {
                if on && !self.caps.supports_instant_mode {
                    warn!("dispatch: instant mode unsupported by firmware");
                    return;
                }
                if self.instant_mode != on {
                    self.instant_mode = on;
                    info!("dispatch: instant mode {}", if on { "on" } else { "off" });
                    self.reconcile(hal);
                }
            }
            Request::QueryCapabilities => {
                let query = self.registry.allocate().filter(|&tid| hal.query_capabilities(tid));
                if let Some(tid) = query {
                    self.register(tid, PendingKind::Capabilities, scopes(&[Scope::Device]));
                } else {
                    warn!("dispatch: HAL rejected capability query, keeping defaults");
                }
            }
        }
    }

    fn connect(
        &mut self,
        client: Client,
        consented: bool,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let client_id = client.client_id;
        let merged = match self.prepare_attach(&client) {
            Ok(merged) => merged,
            Err(reason) => {
                sink.on_client_event(client_id, &ClientEvent::AttachFailed(reason));
                return;
            }
        };

        if self.enabled && self.applied.as_ref() == Some(&merged) {
            self.directory.insert_client(client);
            sink.on_client_event(client_id, &ClientEvent::AttachSucceeded);
            return;
        }

        if !self.enabled && !consented {
            match self.arbiter.request(client_id, &client.package) {
                Consent::Granted => {}
                Consent::Rejected => {
                    info!("dispatch: interface arbiter refused client {client_id}");
                    sink.on_client_event(
                        client_id,
                        &ClientEvent::AttachFailed(NanStatus::NoResourcesAvailable),
                    );
                    return;
                }
                Consent::Pending => {
                    info!("dispatch: client {client_id} waiting on user consent");
                    self.queue.suspend(connect_request(client));
                    return;
                }
            }
        }

        let initial = !self.enabled;
        let configure = self
            .registry
            .allocate()
            .filter(|&tid| hal.enable_and_configure(tid, &merged, initial));
        let Some(tid) = configure else {
            warn!("dispatch: HAL rejected configure for client {client_id}");
            sink.on_client_event(
                client_id,
                &ClientEvent::AttachFailed(NanStatus::InternalFailure),
            );
            return;
        };
        self.register(
            tid,
            PendingKind::Connect { client, merged },
            scopes(&[Scope::Client(client_id), Scope::Device]),
        );
    }

    /// Local attach checks and the merge including the newcomer, which is
    /// folded in last.
    fn prepare_attach(&self, client: &Client) -> Result<EffectiveConfig, NanStatus> {
        let client_id = client.client_id;
        if !self.usage_enabled {
            warn!("dispatch: attach by client {client_id} while usage disabled");
            return Err(NanStatus::NotAllowed);
        }
        if self.directory.contains_client(client_id) {
            warn!("dispatch: client {client_id} already attached");
            return Err(NanStatus::InvalidArgs);
        }
        if let Err(e) = client.config.validate() {
            warn!("dispatch: client {client_id} config rejected: {e}");
            return Err(NanStatus::InvalidArgs);
        }
        let candidate = iter::once((&client.config, client.wants_identity));
        match merge(self.directory.requests().chain(candidate), self.instant_mode) {
            Ok(Some(merged)) => Ok(merged),
            Ok(None) => Err(NanStatus::InternalFailure),
            Err(conflict) => {
                warn!("dispatch: client {client_id} attach rejected: {conflict}");
                Err(NanStatus::InternalFailure)
            }
        }
    }

    fn finish_consent(
        &mut self,
        request: Request,
        granted: bool,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let Request::Connect {
            client_id,
            uid,
            pid,
            package,
            config,
            wants_identity,
        } = request
        else {
            self.execute(request, hal, sink);
            return;
        };
        if granted {
            let client = Client::new(client_id, uid, pid, package, config, wants_identity);
            self.connect(client, true, hal, sink);
        } else {
            info!("dispatch: user declined interface for client {client_id}");
            sink.on_client_event(
                client_id,
                &ClientEvent::AttachFailed(NanStatus::NoResourcesAvailable),
            );
        }
    }

    fn disconnect(&mut self, client_id: ClientId, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        let Some((_, sessions)) = self.directory.remove_client(client_id) else {
            debug!("dispatch: disconnect of unknown client {client_id}");
            return;
        };
        for session in &sessions {
            self.stop_on_hal(session.role(), session.pub_sub_id, hal);
            sink.on_session_event(
                client_id,
                session.callback,
                &SessionEvent::Terminated(TerminateReason::LocalRequest),
            );
        }
        self.messages.purge_client(client_id, &mut self.registry);
        sink.on_client_event(client_id, &ClientEvent::Terminated);
        self.reconcile(hal);
    }

    /// Bring the HAL in line with the merge of the attached clients.
    fn reconcile(&mut self, hal: &mut impl HalPort) {
        if !self.enabled {
            return;
        }
        let merged = match merge(self.directory.requests(), self.instant_mode) {
            Ok(merged) => merged,
            Err(conflict) => {
                warn!("dispatch: attached clients no longer merge: {conflict}");
                return;
            }
        };
        let Some(tid) = self.registry.allocate() else {
            return;
        };
        match merged {
            None => {
                info!("dispatch: last client gone, disabling");
                if hal.disable(tid) {
                    self.register(tid, PendingKind::Disable, scopes(&[Scope::Device]));
                } else {
                    warn!("dispatch: HAL rejected disable");
                    self.enabled = false;
                    self.applied = None;
                }
            }
            Some(merged) if self.applied.as_ref() != Some(&merged) => {
                if hal.enable_and_configure(tid, &merged, false) {
                    self.register(
                        tid,
                        PendingKind::Reconfigure { merged },
                        scopes(&[Scope::Device]),
                    );
                } else {
                    warn!("dispatch: HAL rejected reconfigure");
                }
            }
            Some(_) => {}
        }
    }

    fn publish(
        &mut self,
        client_id: ClientId,
        callback: CallbackId,
        config: PublishConfig,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        if let Err(reason) = self.admit_session(client_id, Role::Publish, &config.params) {
            sink.on_session_event(client_id, callback, &SessionEvent::ConfigFailed(reason));
            return;
        }
        let issued = self.registry.allocate().filter(|&tid| hal.publish(tid, None, &config));
        let Some(tid) = issued else {
            warn!("dispatch: HAL rejected publish for client {client_id}");
            sink.on_session_event(
                client_id,
                callback,
                &SessionEvent::ConfigFailed(NanStatus::InternalFailure),
            );
            return;
        };
        self.register(
            tid,
            PendingKind::Publish {
                client_id,
                callback,
                config,
            },
            scopes(&[Scope::Client(client_id)]),
        );
    }

    fn subscribe(
        &mut self,
        client_id: ClientId,
        callback: CallbackId,
        config: SubscribeConfig,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        if let Err(reason) = self.admit_session(client_id, Role::Subscribe, &config.params) {
            sink.on_session_event(client_id, callback, &SessionEvent::ConfigFailed(reason));
            return;
        }
        let issued = self.registry.allocate().filter(|&tid| hal.subscribe(tid, None, &config));
        let Some(tid) = issued else {
            warn!("dispatch: HAL rejected subscribe for client {client_id}");
            sink.on_session_event(
                client_id,
                callback,
                &SessionEvent::ConfigFailed(NanStatus::InternalFailure),
            );
            return;
        };
        self.register(
            tid,
            PendingKind::Subscribe {
                client_id,
                callback,
                config,
            },
            scopes(&[Scope::Client(client_id)]),
        );
    }

    /// Local checks before a new discovery session is sent to the HAL.
    fn admit_session(
        &self,
        client_id: ClientId,
        role: Role,
        params: &DiscoveryParams,
    ) -> Result<(), NanStatus> {
        if !self.directory.contains_client(client_id) {
            warn!("dispatch: {role:?} from unattached client {client_id}");
            return Err(NanStatus::InternalFailure);
        }
        if let Err(e) = params.validate(&self.caps) {
            warn!("dispatch: {role:?} from client {client_id} rejected: {e}");
            return Err(NanStatus::InvalidArgs);
        }
        let limit = match role {
            Role::Publish => self.caps.max_publishes,
            Role::Subscribe => self.caps.max_subscribes,
        };
        // Starts still waiting for the HAL hold a slot too.
        let in_use = self.directory.count_role(role) + self.registry.pending_starts(role);
        if in_use >= limit {
            warn!("dispatch: {role:?} limit {limit} reached");
            return Err(NanStatus::NoResourcesAvailable);
        }
        Ok(())
    }

    fn update(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
        config: SessionConfig,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let Some(session) = self.directory.owned_session(client_id, session_id) else {
            warn!("dispatch: update of unknown session {session_id} for client {client_id}");
            return;
        };
        let callback = session.callback;
        let pub_sub_id = session.pub_sub_id;
        let verdict = if session.role() != config.role() {
            warn!(
                "dispatch: {:?} update on {:?} session {session_id}",
                config.role(),
                session.role()
            );
            Err(NanStatus::InternalFailure)
        } else if config.params().validate(&self.caps).is_err() {
            Err(NanStatus::InvalidArgs)
        } else {
            Ok(())
        };
        if let Err(reason) = verdict {
            sink.on_session_event(client_id, callback, &SessionEvent::ConfigFailed(reason));
            return;
        }
        let issued = self.registry.allocate().filter(|&tid| match &config {
            SessionConfig::Publish(c) => hal.publish(tid, Some(pub_sub_id), c),
            SessionConfig::Subscribe(c) => hal.subscribe(tid, Some(pub_sub_id), c),
        });
        let Some(tid) = issued else {
            sink.on_session_event(
                client_id,
                callback,
                &SessionEvent::ConfigFailed(NanStatus::InternalFailure),
            );
            return;
        };
        self.register(
            tid,
            PendingKind::Update {
                client_id,
                session_id,
                config,
            },
            scopes(&[Scope::Session(client_id, session_id)]),
        );
    }

    fn terminate_session(&mut self, client_id: ClientId, session_id: SessionId, hal: &mut impl HalPort) {
        if self.directory.owned_session(client_id, session_id).is_none() {
            warn!("dispatch: terminate of unknown session {session_id} for client {client_id}");
            return;
        }
        if let Some(session) = self.directory.remove_session(session_id) {
            self.stop_on_hal(session.role(), session.pub_sub_id, hal);
            self.messages.purge_session(session_id, &mut self.registry);
        }
    }

    fn send_message(&mut self, req: SendRequest) -> Result<(), NanStatus> {
        let known_peer = self
            .directory
            .session(req.session_id)
            .is_some_and(|s| s.peer(req.peer_id).is_some());
        if !known_peer {
            warn!("dispatch: send to unknown peer {} in session {}", req.peer_id, req.session_id);
            return Err(NanStatus::InvalidPeerId);
        }
        if req.payload.len() > self.caps.max_service_specific_info_len {
            warn!("dispatch: message {} payload too long", req.message_id);
            return Err(NanStatus::InvalidArgs);
        }
        if req.retry_count > self.config.max_send_retries {
            warn!("dispatch: message {} asks for {} retries", req.message_id, req.retry_count);
            return Err(NanStatus::InvalidArgs);
        }
        self.messages
            .enqueue(req, &mut self.registry, self.now_ms)
            .map(|_| ())
    }

    fn suspend_or_resume(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
        suspend: bool,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let Some(session) = self.directory.owned_session(client_id, session_id) else {
            warn!("dispatch: suspend/resume of unknown session {session_id}");
            return;
        };
        let callback = session.callback;
        let failed = |reason| {
            if suspend {
                SessionEvent::SuspendFailed(reason)
            } else {
                SessionEvent::ResumeFailed(reason)
            }
        };
        let verdict = if !self.caps.supports_suspension {
            Err(NanStatus::NotAllowed)
        } else if !session.config.params().suspendable || session.suspended == suspend {
            Err(NanStatus::InvalidArgs)
        } else {
            Ok(session.pub_sub_id)
        };
        let pub_sub_id = match verdict {
            Ok(id) => id,
            Err(reason) => {
                sink.on_session_event(client_id, callback, &failed(reason));
                return;
            }
        };
        let issued = self.registry.allocate().filter(|&tid| {
            if suspend {
                hal.suspend(tid, pub_sub_id)
            } else {
                hal.resume(tid, pub_sub_id)
            }
        });
        let Some(tid) = issued else {
            sink.on_session_event(client_id, callback, &failed(NanStatus::InternalFailure));
            return;
        };
        let kind = if suspend {
            PendingKind::Suspend {
                client_id,
                session_id,
            }
        } else {
            PendingKind::Resume {
                client_id,
                session_id,
            }
        };
        self.register(tid, kind, scopes(&[Scope::Session(client_id, session_id)]));
    }

    fn initiate_bootstrapping(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
        method: u16,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let Some((_, callback)) = self.owner(client_id, session_id) else {
            warn!("dispatch: bootstrapping on unknown session {session_id}");
            return;
        };
        let failed = |reason| SessionEvent::BootstrappingFailed { peer_id, reason };
        let Some((pub_sub_id, requestor, mac)) = self.directory.transmit_target(session_id, peer_id)
        else {
            sink.on_session_event(client_id, callback, &failed(NanStatus::InvalidPeerId));
            return;
        };
        let issued = self
            .registry
            .allocate()
            .filter(|&tid| hal.initiate_bootstrapping(tid, pub_sub_id, requestor, mac, method));
        let Some(tid) = issued else {
            sink.on_session_event(client_id, callback, &failed(NanStatus::InternalFailure));
            return;
        };
        self.register(
            tid,
            PendingKind::Bootstrapping {
                client_id,
                session_id,
                peer_id,
            },
            scopes(&[Scope::Session(client_id, session_id)]),
        );
    }

    fn initiate_pairing(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let Some((_, callback)) = self.owner(client_id, session_id) else {
            warn!("dispatch: pairing on unknown session {session_id}");
            return;
        };
        let failed = |reason| SessionEvent::PairingFailed { peer_id, reason };
        if !self.caps.supports_pairing {
            sink.on_session_event(client_id, callback, &failed(NanStatus::NotAllowed));
            return;
        }
        let Some((pub_sub_id, requestor, mac)) = self.directory.transmit_target(session_id, peer_id)
        else {
            sink.on_session_event(client_id, callback, &failed(NanStatus::InvalidPeerId));
            return;
        };
        let issued = self
            .registry
            .allocate()
            .filter(|&tid| hal.initiate_pairing(tid, pub_sub_id, requestor, mac));
        let Some(tid) = issued else {
            sink.on_session_event(client_id, callback, &failed(NanStatus::InternalFailure));
            return;
        };
        self.register(
            tid,
            PendingKind::Pairing {
                client_id,
                session_id,
                peer_id,
            },
            scopes(&[Scope::Session(client_id, session_id)]),
        );
    }

    fn respond_to_pairing(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
        pairing_id: u32,
        accept: bool,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let Some((_, callback)) = self.owner(client_id, session_id) else {
            warn!("dispatch: pairing reply on unknown session {session_id}");
            return;
        };
        let Some(handshake) = self
            .directory
            .pairing(pairing_id)
            .filter(|h| h.client_id == client_id && h.session_id == session_id)
            .copied()
        else {
            warn!("dispatch: reply to unknown pairing request {pairing_id}");
            return;
        };
        let peer_id = handshake.peer_id;
        let issued = self
            .registry
            .allocate()
            .filter(|&tid| hal.respond_to_pairing(tid, pairing_id, accept));
        let Some(tid) = issued else {
            self.directory.take_pairing(pairing_id);
            sink.on_session_event(
                client_id,
                callback,
                &SessionEvent::PairingFailed {
                    peer_id,
                    reason: NanStatus::InternalFailure,
                },
            );
            return;
        };
        self.register(
            tid,
            PendingKind::PairingReply {
                client_id,
                session_id,
                peer_id,
                pairing_id,
            },
            scopes(&[Scope::Session(client_id, session_id)]),
        );
    }

    fn set_usage_enabled(&mut self, enabled: bool, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        if self.usage_enabled == enabled {
            return;
        }
        self.usage_enabled = enabled;
        if enabled {
            info!("dispatch: usage enabled");
        } else {
            info!("dispatch: usage disabled, tearing down");
            self.teardown(NanStatus::InternalFailure, true, hal, sink);
        }
    }

    // ── HAL callbacks ─────────────────────────────────────────

    fn on_hal_event(&mut self, event: HalEvent, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        match event {
            HalEvent::CommandResponse {
                transaction_id,
                result,
            } => {
                let Some(pending) = self.registry.get(transaction_id) else {
                    debug!("dispatch: response for stale transaction {transaction_id}");
                    return;
                };
                if pending.kind == PendingKind::Message {
                    debug!("dispatch: command response on message transaction {transaction_id}");
                    return;
                }
                if let Some(pending) = self.registry.resolve(transaction_id) {
                    self.complete(pending.kind, result, hal, sink);
                    self.queue.replay_deferred();
                }
            }
            HalEvent::MessageQueued {
                transaction_id,
                status,
            } => {
                let outcome =
                    self.messages
                        .on_queued(transaction_id, status, &mut self.registry, self.now_ms);
                deliver(outcome, sink);
            }
            HalEvent::MessageTxStatus {
                transaction_id,
                status,
            } => {
                let outcome =
                    self.messages
                        .on_tx_status(transaction_id, status, &mut self.registry, self.now_ms);
                deliver(outcome, sink);
            }
            HalEvent::SessionTerminated {
                pub_sub_id,
                role,
                reason,
            } => {
                let Some(session_id) = self.directory.session_by_pub_sub(pub_sub_id, Some(role))
                else {
                    debug!("dispatch: termination of unknown {role:?} {pub_sub_id}");
                    return;
                };
                if let Some(session) = self.directory.remove_session(session_id) {
                    self.messages.purge_session(session_id, &mut self.registry);
                    info!("dispatch: firmware ended session {session_id}: {reason:?}");
                    sink.on_session_event(
                        session.client_id,
                        session.callback,
                        &SessionEvent::Terminated(reason),
                    );
                }
            }
            HalEvent::Match {
                pub_sub_id,
                requestor_instance_id,
                peer_mac,
                service_specific_info,
                match_filter,
            } => {
                if let Some(peer) = self.peer_event(pub_sub_id, requestor_instance_id, Some(peer_mac)) {
                    sink.on_session_event(
                        peer.client_id,
                        peer.callback,
                        &SessionEvent::Matched {
                            peer_id: peer.peer_id,
                            service_specific_info,
                            match_filter,
                        },
                    );
                }
            }
            HalEvent::MatchExpired {
                pub_sub_id,
                requestor_instance_id,
            } => {
                if let Some(peer) = self.peer_event(pub_sub_id, requestor_instance_id, None) {
                    sink.on_session_event(
                        peer.client_id,
                        peer.callback,
                        &SessionEvent::MatchExpired {
                            peer_id: peer.peer_id,
                        },
                    );
                }
            }
            HalEvent::MessageReceived {
                pub_sub_id,
                requestor_instance_id,
                peer_mac,
                payload,
            } => {
                if let Some(peer) = self.peer_event(pub_sub_id, requestor_instance_id, Some(peer_mac)) {
                    sink.on_session_event(
                        peer.client_id,
                        peer.callback,
                        &SessionEvent::MessageReceived {
                            peer_id: peer.peer_id,
                            payload,
                        },
                    );
                }
            }
            HalEvent::ClusterChanged { kind, cluster_id } => {
                info!("dispatch: cluster {kind:?} {cluster_id}");
                let event = ClientEvent::ClusterChanged { kind, cluster_id };
                for client_id in self.directory.clients_wanting_identity() {
                    sink.on_client_event(client_id, &event);
                }
            }
            HalEvent::InterfaceAddressChanged { mac } => {
                info!("dispatch: interface address now {mac}");
                let event = ClientEvent::IdentityChanged { mac };
                for client_id in self.directory.clients_wanting_identity() {
                    sink.on_client_event(client_id, &event);
                }
            }
            HalEvent::BootstrappingConfirm {
                bootstrap_id,
                accepted,
            } => {
                let Some(h) = self.directory.take_bootstrap(bootstrap_id) else {
                    debug!("dispatch: confirm for unknown bootstrap {bootstrap_id}");
                    return;
                };
                if let Some((_, callback)) = self.owner(h.client_id, h.session_id) {
                    sink.on_session_event(
                        h.client_id,
                        callback,
                        &SessionEvent::BootstrappingConfirmed {
                            peer_id: h.peer_id,
                            accepted,
                        },
                    );
                }
            }
            HalEvent::PairingRequest {
                pub_sub_id,
                requestor_instance_id,
                peer_mac,
                pairing_id,
            } => {
                if let Some(peer) = self.peer_event(pub_sub_id, requestor_instance_id, Some(peer_mac)) {
                    self.directory.track_pairing(
                        pairing_id,
                        Handshake {
                            client_id: peer.client_id,
                            session_id: peer.session_id,
                            peer_id: peer.peer_id,
                        },
                    );
                    sink.on_session_event(
                        peer.client_id,
                        peer.callback,
                        &SessionEvent::PairingRequested {
                            peer_id: peer.peer_id,
                            pairing_id,
                        },
                    );
                }
            }
            HalEvent::PairingConfirm {
                pairing_id,
                accepted,
            } => {
                let Some(h) = self.directory.take_pairing(pairing_id) else {
                    debug!("dispatch: confirm for unknown pairing {pairing_id}");
                    return;
                };
                if let Some((_, callback)) = self.owner(h.client_id, h.session_id) {
                    sink.on_session_event(
                        h.client_id,
                        callback,
                        &SessionEvent::PairingConfirmed {
                            peer_id: h.peer_id,
                            accepted,
                        },
                    );
                }
            }
            HalEvent::AwareDown { reason } => {
                warn!("dispatch: firmware down ({reason}), tearing down");
                self.teardown(reason, false, hal, sink);
            }
        }
    }

    fn on_timeout(&mut self, tid: TransactionId, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        let Some(pending) = self.registry.get(tid) else {
            debug!("dispatch: timeout for resolved transaction {tid}");
            return;
        };
        if pending.kind == PendingKind::Message {
            let outcome = self.messages.on_timeout(tid, &mut self.registry);
            deliver(outcome, sink);
            return;
        }
        if let Some(pending) = self.registry.resolve(tid) {
            warn!(
                "dispatch: transaction {tid} timed out after {} ms",
                self.now_ms.saturating_sub(pending.issued_at_ms)
            );
            self.complete(pending.kind, Err(NanStatus::InternalFailure), hal, sink);
            self.queue.replay_deferred();
        }
    }

    /// Apply the outcome of a resolved command.  Called exactly once per
    /// registered transaction: response, timeout or teardown.
    fn complete(
        &mut self,
        kind: PendingKind,
        result: Result<ResponseData, NanStatus>,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        match kind {
            PendingKind::Capabilities => match result {
                Ok(ResponseData::Capabilities(caps)) => {
                    info!("dispatch: capabilities {caps:?}");
                    self.caps = caps;
                    self.messages.set_capacity(caps.max_queued_transmit_messages);
                }
                other => warn!("dispatch: capability query failed ({other:?}), keeping defaults"),
            },
            PendingKind::Connect { client, merged } => {
                let client_id = client.client_id;
                match expect_done(result) {
                    Ok(()) => {
                        if !self.enabled {
                            info!("dispatch: interface enabled");
                        }
                        self.enabled = true;
                        self.applied = Some(merged);
                        self.directory.insert_client(client);
                        sink.on_client_event(client_id, &ClientEvent::AttachSucceeded);
                    }
                    Err(reason) => {
                        warn!("dispatch: attach of client {client_id} failed: {reason}");
                        sink.on_client_event(client_id, &ClientEvent::AttachFailed(reason));
                    }
                }
            }
            PendingKind::Reconfigure { merged } => match expect_done(result) {
                Ok(()) => self.applied = Some(merged),
                Err(reason) => warn!("dispatch: reconfigure failed: {reason}"),
            },
            PendingKind::Disable => {
                if let Err(reason) = expect_done(result) {
                    warn!("dispatch: disable failed ({reason}), treating interface as down");
                }
                info!("dispatch: interface disabled");
                self.enabled = false;
                self.applied = None;
            }
            PendingKind::Publish {
                client_id,
                callback,
                config,
            } => self.session_started(client_id, callback, SessionConfig::Publish(config), result, hal, sink),
            PendingKind::Subscribe {
                client_id,
                callback,
                config,
            } => {
                self.session_started(client_id, callback, SessionConfig::Subscribe(config), result, hal, sink);
            }
            PendingKind::Update {
                client_id,
                session_id,
                config,
            } => {
                let outcome = match result {
                    Ok(ResponseData::Done | ResponseData::PubSubId(_)) => Ok(()),
                    Ok(_) => Err(NanStatus::ProtocolFailure),
                    Err(reason) => Err(reason),
                };
                let Some(session) = self.directory.owned_session_mut(client_id, session_id) else {
                    debug!("dispatch: update result for vanished session {session_id}");
                    return;
                };
                let callback = session.callback;
                let event = match outcome {
                    Ok(()) => {
                        session.config = config;
                        SessionEvent::ConfigSucceeded
                    }
                    Err(reason) => SessionEvent::ConfigFailed(reason),
                };
                sink.on_session_event(client_id, callback, &event);
            }
            PendingKind::Suspend {
                client_id,
                session_id,
            } => self.suspension_settled(client_id, session_id, true, result, sink),
            PendingKind::Resume {
                client_id,
                session_id,
            } => self.suspension_settled(client_id, session_id, false, result, sink),
            PendingKind::Bootstrapping {
                client_id,
                session_id,
                peer_id,
            } => {
                let Some((_, callback)) = self.owner(client_id, session_id) else {
                    return;
                };
                match expect_handle(result) {
                    Ok(bootstrap_id) => self.directory.track_bootstrap(
                        bootstrap_id,
                        Handshake {
                            client_id,
                            session_id,
                            peer_id,
                        },
                    ),
                    Err(reason) => sink.on_session_event(
                        client_id,
                        callback,
                        &SessionEvent::BootstrappingFailed { peer_id, reason },
                    ),
                }
            }
            PendingKind::Pairing {
                client_id,
                session_id,
                peer_id,
            } => {
                let Some((_, callback)) = self.owner(client_id, session_id) else {
                    return;
                };
                match expect_handle(result) {
                    Ok(pairing_id) => self.directory.track_pairing(
                        pairing_id,
                        Handshake {
                            client_id,
                            session_id,
                            peer_id,
                        },
                    ),
                    Err(reason) => sink.on_session_event(
                        client_id,
                        callback,
                        &SessionEvent::PairingFailed { peer_id, reason },
                    ),
                }
            }
            PendingKind::PairingReply {
                client_id,
                session_id,
                peer_id,
                pairing_id,
            } => {
                // Success waits for the PairingConfirm notification.
                if let Err(reason) = expect_done(result) {
                    self.directory.take_pairing(pairing_id);
                    if let Some((_, callback)) = self.owner(client_id, session_id) {
                        sink.on_session_event(
                            client_id,
                            callback,
                            &SessionEvent::PairingFailed { peer_id, reason },
                        );
                    }
                }
            }
            PendingKind::Message => {}
        }
    }

    fn suspension_settled(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
        suspend: bool,
        result: Result<ResponseData, NanStatus>,
        sink: &mut impl EventSink,
    ) {
        let Some(session) = self.directory.owned_session_mut(client_id, session_id) else {
            debug!("dispatch: suspend/resume result for vanished session {session_id}");
            return;
        };
        let callback = session.callback;
        let event = match (expect_done(result), suspend) {
            (Ok(()), true) => {
                session.suspended = true;
                SessionEvent::Suspended
            }
            (Ok(()), false) => {
                session.suspended = false;
                SessionEvent::Resumed
            }
            (Err(reason), true) => SessionEvent::SuspendFailed(reason),
            (Err(reason), false) => SessionEvent::ResumeFailed(reason),
        };
        sink.on_session_event(client_id, callback, &event);
    }

    fn session_started(
        &mut self,
        client_id: ClientId,
        callback: CallbackId,
        config: SessionConfig,
        result: Result<ResponseData, NanStatus>,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        let pub_sub_id = match result {
            Ok(ResponseData::PubSubId(id)) => id,
            Ok(other) => {
                warn!("dispatch: unexpected {other:?} for {:?}", config.role());
                sink.on_session_event(
                    client_id,
                    callback,
                    &SessionEvent::ConfigFailed(NanStatus::ProtocolFailure),
                );
                return;
            }
            Err(reason) => {
                sink.on_session_event(client_id, callback, &SessionEvent::ConfigFailed(reason));
                return;
            }
        };
        let role = config.role();
        match self.directory.create_session(client_id, callback, pub_sub_id, config) {
            Some(session_id) => {
                sink.on_session_event(client_id, callback, &SessionEvent::Started { session_id });
            }
            None => {
                // Owner detached meanwhile; nobody is listening.
                self.stop_on_hal(role, pub_sub_id, hal);
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────

    /// Fail every outstanding request once and detach every client.
    fn teardown(
        &mut self,
        reason: NanStatus,
        disable_hal: bool,
        hal: &mut impl HalPort,
        sink: &mut impl EventSink,
    ) {
        for pending in self.registry.drain() {
            self.complete(pending.kind, Err(NanStatus::InternalFailure), hal, sink);
        }
        self.messages.clear();
        for (client, sessions) in self.directory.clear() {
            for session in sessions {
                sink.on_session_event(
                    client.client_id,
                    session.callback,
                    &SessionEvent::Terminated(TerminateReason::Failure(reason)),
                );
            }
            sink.on_client_event(client.client_id, &ClientEvent::Terminated);
        }
        if disable_hal && self.enabled {
            if let Some(tid) = self.registry.allocate().filter(|&tid| hal.disable(tid)) {
                self.register(tid, PendingKind::Disable, scopes(&[Scope::Device]));
            }
        }
        self.enabled = false;
        self.applied = None;
        self.queue.replay_deferred();
    }

    // ── Helpers ───────────────────────────────────────────────

    fn register(&mut self, tid: TransactionId, kind: PendingKind, scopes: Scopes) {
        let deadline = self.now_ms + self.config.command_timeout_ms;
        self.registry.register(tid, kind, scopes, self.now_ms, deadline);
    }

    /// Owning uid and callback of a session, if `client_id` owns it.
    fn owner(&self, client_id: ClientId, session_id: SessionId) -> Option<(Uid, CallbackId)> {
        let session = self.directory.owned_session(client_id, session_id)?;
        let client = self.directory.client(client_id)?;
        Some((client.uid, session.callback))
    }

    /// Resolve the session and peer named by a discovery notification.
    /// With no MAC only an already known peer is accepted.
    fn peer_event(
        &mut self,
        pub_sub_id: PubSubId,
        requestor_instance_id: RequestorInstanceId,
        mac: Option<MacAddr>,
    ) -> Option<PeerRef> {
        let Some(session_id) = self.directory.session_by_pub_sub(pub_sub_id, None) else {
            debug!("dispatch: notification for unknown pub/sub id {pub_sub_id}");
            return None;
        };
        let peer_id = match mac {
            Some(mac) => self.directory.resolve_peer(session_id, requestor_instance_id, mac)?,
            None => self.directory.known_peer(session_id, requestor_instance_id)?,
        };
        let session = self.directory.session(session_id)?;
        Some(PeerRef {
            client_id: session.client_id,
            session_id,
            callback: session.callback,
            peer_id,
        })
    }

    /// Fire-and-forget stop; the id is never registered.
    fn stop_on_hal(&mut self, role: Role, pub_sub_id: PubSubId, hal: &mut impl HalPort) {
        let Some(tid) = self.registry.allocate() else {
            warn!("dispatch: no transaction id to stop pub/sub id {pub_sub_id}");
            return;
        };
        let accepted = match role {
            Role::Publish => hal.stop_publish(tid, pub_sub_id),
            Role::Subscribe => hal.stop_subscribe(tid, pub_sub_id),
        };
        if !accepted {
            warn!("dispatch: HAL rejected stop of {role:?} pub/sub id {pub_sub_id}");
        }
    }

    fn pump_messages(&mut self, hal: &mut impl HalPort, sink: &mut impl EventSink) {
        for outcome in self.messages.pump(hal, &self.directory, &mut self.registry) {
            deliver(Some(outcome), sink);
        }
    }

    // ── Introspection ─────────────────────────────────────────

    /// Point-in-time copy of the dispatcher state for diagnostics export.
    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            usage_enabled: self.usage_enabled,
            enabled: self.enabled,
            instant_mode: self.instant_mode,
            consent_pending: self.queue.is_suspended(),
            applied: self.applied.clone(),
            capabilities: self.caps,
            clients: capture_clients(&self.directory),
            pending_transactions: self.registry.ids(),
            deferred_commands: self.queue.deferred_len(),
            host_queue_len: self.messages.host_len(),
            firmware_queue_len: self.messages.firmware_len(),
            firmware_queue_full: self.messages.is_firmware_full(),
        }
    }

    /// MACs of the given peers, limited to sessions owned by `uid`.
    pub fn request_mac_addresses(&self, uid: Uid, peer_ids: &[PeerId]) -> BTreeMap<PeerId, MacAddr> {
        self.directory.request_mac_addresses(uid, peer_ids)
    }

    /// Outstanding transaction ids, oldest first.
    pub fn pending_transactions(&self) -> Vec<TransactionId> {
        self.registry.ids()
    }

    /// Requests parked behind an outstanding command, in replay order.
    pub fn deferred_commands(&self) -> &[Request] {
        self.queue.deferred()
    }

    /// Commands submitted but not yet processed.
    pub fn queued_commands(&self) -> usize {
        self.queue.len()
    }

    /// Messages waiting for a firmware slot.
    pub fn host_queue_len(&self) -> usize {
        self.messages.host_len()
    }

    /// Messages handed to the HAL and not yet settled.
    pub fn firmware_queue_len(&self) -> usize {
        self.messages.firmware_len()
    }

    /// Live sessions of `client_id`, oldest first.
    pub fn session_ids(&self, client_id: ClientId) -> Vec<SessionId> {
        self.directory.session_ids(client_id)
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.directory.session(session_id)
    }

    /// Configuration the HAL last acknowledged; `None` while disabled.
    pub fn applied_config(&self) -> Option<&EffectiveConfig> {
        self.applied.as_ref()
    }

    /// HAL interface is up.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current verdict of the usage gate.
    pub fn is_usage_enabled(&self) -> bool {
        self.usage_enabled
    }

    pub fn client_count(&self) -> usize {
        self.directory.client_count()
    }

    /// Attached clients in attach order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.directory.client_ids()
    }

    /// Firmware capabilities; the defaults until the query answers.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Validated tunables in force.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Latest clock value passed to [`advance`](Self::advance).
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Earliest armed timeout, for sleeping until the next
    /// [`advance`](Self::advance) is due.
    pub fn next_deadline(&self) -> Option<u64> {
        self.registry.next_deadline()
    }
}

// ───────────────────────────────────────────────────────────────
// Free helpers
// ───────────────────────────────────────────────────────────────

/// Session and peer a discovery notification resolved to.
struct PeerRef {
    client_id: ClientId,
    session_id: SessionId,
    callback: CallbackId,
    peer_id: PeerId,
}

fn connect_request(client: Client) -> Request {
    Request::Connect {
        client_id: client.client_id,
        uid: client.uid,
        pid: client.pid,
        package: client.package,
        config: client.config,
        wants_identity: client.wants_identity,
    }
}

fn deliver(outcome: Option<MessageOutcome>, sink: &mut impl EventSink) {
    let Some(o) = outcome else {
        return;
    };
    let event = match o.result {
        Ok(()) => SessionEvent::MessageSendSucceeded {
            message_id: o.message_id,
        },
        Err(reason) => SessionEvent::MessageSendFailed {
            message_id: o.message_id,
            reason,
        },
    };
    sink.on_session_event(o.client_id, o.callback, &event);
}

/// A response that carries no payload; anything else is a protocol error.
fn expect_done(result: Result<ResponseData, NanStatus>) -> Result<(), NanStatus> {
    match result {
        Ok(ResponseData::Done) => Ok(()),
        Ok(_) => Err(NanStatus::ProtocolFailure),
        Err(reason) => Err(reason),
    }
}

fn expect_handle(result: Result<ResponseData, NanStatus>) -> Result<u32, NanStatus> {
    match result {
        Ok(ResponseData::Handle(id)) => Ok(id),
        Ok(_) => Err(NanStatus::ProtocolFailure),
        Err(reason) => Err(reason),
    }
}
