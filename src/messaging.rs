//! Follow-up message queue engine.
//!
//! Outbound messages pass through two stages:
//!
//! ```text
//!   enqueue ──▶ host queue ──pump──▶ in flight ──queued ack──▶ firmware queued
//!                  ▲                    │                            │
//!                  │  tx queue full     │                            │ tx status
//!                  └────────────────────┘                            ▼
//!                  ▲                                       success / NACK
//!                  └──────────── retry (new transaction id) ◀────────┘
//! ```
//!
//! - Per-uid occupancy across both stages is capped by the configured quota;
//!   a message over quota fails before any transaction id is allocated.
//! - The in-flight stage never holds more than the HAL-reported firmware
//!   queue depth.
//! - A NACK with retries left re-queues the message at the host tail under a
//!   fresh transaction id.  A timeout is terminal whatever the retry budget.
//! - A queue-full answer puts the message back at the host head.  It waits
//!   for a transmit status only while another message still holds a slot.
//! - Purges (client detach, session end) are silent.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info, warn};
use serde::Serialize;

use crate::app::ports::HalPort;
use crate::directory::Directory;
use crate::error::NanStatus;
use crate::transaction::{PendingKind, Scopes, TransactionRegistry};
use crate::types::{CallbackId, ClientId, MessageId, PeerId, SessionId, TransactionId, Uid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageState {
    /// Waiting for a firmware queue slot.
    HostQueued,
    /// Handed to the HAL, queued ack not yet seen.
    Submitted,
    /// Accepted by firmware, awaiting on-air outcome.
    FirmwareQueued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub client_id: ClientId,
    pub uid: Uid,
    pub session_id: SessionId,
    pub callback: CallbackId,
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub retries_remaining: u8,
    pub transaction_id: TransactionId,
    pub state: MessageState,
}

/// Everything needed to enqueue a message; ids are resolved by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub client_id: ClientId,
    pub uid: Uid,
    pub session_id: SessionId,
    pub callback: CallbackId,
    pub peer_id: PeerId,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub retry_count: u8,
}

/// Terminal result for one message, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOutcome {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub callback: CallbackId,
    pub message_id: MessageId,
    pub result: Result<(), NanStatus>,
}

impl OutboundMessage {
    fn settle(self, result: Result<(), NanStatus>) -> MessageOutcome {
        MessageOutcome {
            client_id: self.client_id,
            session_id: self.session_id,
            callback: self.callback,
            message_id: self.message_id,
            result,
        }
    }
}

#[derive(Debug)]
pub struct MessageQueue {
    host: VecDeque<OutboundMessage>,
    in_flight: BTreeMap<TransactionId, OutboundMessage>,
    /// Set when firmware reported its transmit queue full while another of
    /// our messages still holds a slot; cleared by the next transmit status
    /// or once nothing is in flight.
    firmware_full: bool,
    capacity: usize,
    quota_per_uid: usize,
    send_timeout_ms: u64,
}

impl MessageQueue {
    pub fn new(capacity: usize, quota_per_uid: usize, send_timeout_ms: u64) -> Self {
        Self {
            host: VecDeque::new(),
            in_flight: BTreeMap::new(),
            firmware_full: false,
            capacity,
            quota_per_uid,
            send_timeout_ms,
        }
    }

    /// Firmware queue depth from the capability query.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn host_len(&self) -> usize {
        self.host.len()
    }

    pub fn firmware_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_firmware_full(&self) -> bool {
        self.firmware_full
    }

    pub fn occupancy(&self, uid: Uid) -> usize {
        self.host
            .iter()
            .chain(self.in_flight.values())
            .filter(|m| m.uid == uid)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.in_flight.is_empty()
    }

    /// Messages in host order followed by in-flight ones.
    pub fn messages(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.host.iter().chain(self.in_flight.values())
    }

    // ── Enqueue / pump ───────────────────────────────────────

    /// Accept a message into the host queue.
    ///
    /// Over quota, or with no free transaction id, returns `InternalFailure`
    /// and leaves the registry untouched.
    pub fn enqueue(
        &mut self,
        req: SendRequest,
        registry: &mut TransactionRegistry,
        now_ms: u64,
    ) -> Result<TransactionId, NanStatus> {
        if self.occupancy(req.uid) >= self.quota_per_uid {
            warn!(
                "messaging: uid {} over quota ({}), message {} rejected",
                req.uid, self.quota_per_uid, req.message_id
            );
            return Err(NanStatus::InternalFailure);
        }
        let Some(transaction_id) = registry.allocate() else {
            warn!("messaging: no transaction id for message {}", req.message_id);
            return Err(NanStatus::InternalFailure);
        };
        registry.register(
            transaction_id,
            PendingKind::Message,
            Scopes::new(),
            now_ms,
            now_ms + self.send_timeout_ms,
        );
        debug!(
            "messaging: message {} queued as transaction {transaction_id}",
            req.message_id
        );
        self.host.push_back(OutboundMessage {
            client_id: req.client_id,
            uid: req.uid,
            session_id: req.session_id,
            callback: req.callback,
            peer_id: req.peer_id,
            message_id: req.message_id,
            payload: req.payload,
            retries_remaining: req.retry_count,
            transaction_id,
            state: MessageState::HostQueued,
        });
        Ok(transaction_id)
    }

    /// Move host-queued messages to the HAL while firmware has room.
    ///
    /// Returns the messages that failed terminally on the way (peer gone, or
    /// a synchronous HAL reject).
    pub fn pump(
        &mut self,
        hal: &mut impl HalPort,
        directory: &Directory,
        registry: &mut TransactionRegistry,
    ) -> Vec<MessageOutcome> {
        let mut failed = Vec::new();
        if self.in_flight.is_empty() {
            // No pending status could ever free a slot.
            self.firmware_full = false;
        }
        while !self.firmware_full && self.in_flight.len() < self.capacity {
            let Some(mut msg) = self.host.pop_front() else {
                break;
            };
            let Some((pub_sub_id, requestor, mac)) =
                directory.transmit_target(msg.session_id, msg.peer_id)
            else {
                warn!(
                    "messaging: peer {} of session {} vanished, dropping message {}",
                    msg.peer_id, msg.session_id, msg.message_id
                );
                registry.resolve(msg.transaction_id);
                failed.push(msg.settle(Err(NanStatus::InvalidPeerId)));
                continue;
            };
            if !hal.send_message(msg.transaction_id, pub_sub_id, requestor, mac, &msg.payload) {
                warn!(
                    "messaging: HAL rejected message {} (transaction {})",
                    msg.message_id, msg.transaction_id
                );
                registry.resolve(msg.transaction_id);
                failed.push(msg.settle(Err(NanStatus::InternalFailure)));
                continue;
            }
            msg.state = MessageState::Submitted;
            self.in_flight.insert(msg.transaction_id, msg);
        }
        failed
    }

    // ── HAL notifications ────────────────────────────────────

    /// Firmware's answer to a submitted message.
    pub fn on_queued(
        &mut self,
        transaction_id: TransactionId,
        status: Result<(), NanStatus>,
        registry: &mut TransactionRegistry,
        now_ms: u64,
    ) -> Option<MessageOutcome> {
        let Some(msg) = self.in_flight.get_mut(&transaction_id) else {
            debug!("messaging: queued ack for unknown transaction {transaction_id}");
            return None;
        };
        if msg.state != MessageState::Submitted {
            debug!("messaging: duplicate queued ack for transaction {transaction_id}");
            return None;
        }
        match status {
            Ok(()) => {
                msg.state = MessageState::FirmwareQueued;
                registry.rearm(transaction_id, now_ms + self.send_timeout_ms);
                None
            }
            Err(NanStatus::FollowupTxQueueFull) => {
                let mut msg = self.in_flight.remove(&transaction_id)?;
                debug!("messaging: firmware queue full, message {} back to host", msg.message_id);
                msg.state = MessageState::HostQueued;
                self.host.push_front(msg);
                // Only wait when a status of ours is still due to free a slot.
                self.firmware_full = !self.in_flight.is_empty();
                None
            }
            Err(reason) => {
                let msg = self.in_flight.remove(&transaction_id)?;
                registry.resolve(transaction_id);
                Some(msg.settle(Err(reason)))
            }
        }
    }

    /// Final on-air outcome.  NACKs consume the retry budget.
    pub fn on_tx_status(
        &mut self,
        transaction_id: TransactionId,
        status: Result<(), NanStatus>,
        registry: &mut TransactionRegistry,
        now_ms: u64,
    ) -> Option<MessageOutcome> {
        let Some(mut msg) = self.in_flight.remove(&transaction_id) else {
            debug!("messaging: tx status for unknown transaction {transaction_id}");
            return None;
        };
        registry.resolve(transaction_id);
        self.firmware_full = false;

        match status {
            Ok(()) => Some(msg.settle(Ok(()))),
            Err(reason) if msg.retries_remaining > 0 => {
                msg.retries_remaining -= 1;
                let Some(retry_id) = registry.allocate() else {
                    warn!("messaging: no transaction id to retry message {}", msg.message_id);
                    return Some(msg.settle(Err(reason)));
                };
                registry.register(
                    retry_id,
                    PendingKind::Message,
                    Scopes::new(),
                    now_ms,
                    now_ms + self.send_timeout_ms,
                );
                info!(
                    "messaging: message {} failed ({reason}), retrying as transaction {retry_id} ({} left)",
                    msg.message_id, msg.retries_remaining
                );
                msg.transaction_id = retry_id;
                msg.state = MessageState::HostQueued;
                self.host.push_back(msg);
                None
            }
            Err(reason) => Some(msg.settle(Err(reason))),
        }
    }

    /// Send timeout; terminal regardless of remaining retries.
    pub fn on_timeout(
        &mut self,
        transaction_id: TransactionId,
        registry: &mut TransactionRegistry,
    ) -> Option<MessageOutcome> {
        let msg = match self.in_flight.remove(&transaction_id) {
            Some(msg) => msg,
            None => {
                let idx = self
                    .host
                    .iter()
                    .position(|m| m.transaction_id == transaction_id)?;
                self.host.remove(idx)?
            }
        };
        registry.resolve(transaction_id);
        warn!(
            "messaging: message {} timed out (transaction {transaction_id})",
            msg.message_id
        );
        Some(msg.settle(Err(NanStatus::InternalFailure)))
    }

    // ── Purges ───────────────────────────────────────────────

    pub fn purge_client(&mut self, client_id: ClientId, registry: &mut TransactionRegistry) -> usize {
        self.purge(|m| m.client_id == client_id, registry)
    }

    pub fn purge_session(&mut self, session_id: SessionId, registry: &mut TransactionRegistry) -> usize {
        self.purge(|m| m.session_id == session_id, registry)
    }

    /// Forget everything.  Registry entries are left to the caller.
    pub fn clear(&mut self) {
        self.host.clear();
        self.in_flight.clear();
        self.firmware_full = false;
    }

    fn purge(
        &mut self,
        doomed: impl Fn(&OutboundMessage) -> bool,
        registry: &mut TransactionRegistry,
    ) -> usize {
        let before = self.host.len() + self.in_flight.len();
        self.host.retain(|m| {
            if doomed(m) {
                registry.resolve(m.transaction_id);
                false
            } else {
                true
            }
        });
        self.in_flight.retain(|tid, m| {
            if doomed(m) {
                registry.resolve(*tid);
                false
            } else {
                true
            }
        });
        let purged = before - self.host.len() - self.in_flight.len();
        if purged > 0 {
            debug!("messaging: purged {purged} message(s)");
        }
        purged
    }
}
