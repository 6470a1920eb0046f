//! Transaction registry.
//!
//! Every HAL command that expects an asynchronous completion is recorded
//! here under a [`TransactionId`] until its response or its timeout
//! arrives, whichever the dispatcher dequeues first.  The loser finds
//! nothing in the registry and becomes a no-op.
//!
//! Each pending command also carries the [`Scope`]s it occupies.  The
//! dispatcher defers any new request whose scopes overlap an outstanding
//! command's.

use std::collections::HashMap;

use log::{debug, warn};

use crate::app::ports::TimeoutDelegate;
use crate::directory::Client;
use crate::merge::EffectiveConfig;
use crate::request::{PublishConfig, SessionConfig, SubscribeConfig};
use crate::scheduler::TimeoutScheduler;
use crate::types::{CallbackId, ClientId, PeerId, Role, SessionId, TransactionId};

// ───────────────────────────────────────────────────────────────
// Scopes
// ───────────────────────────────────────────────────────────────

/// Target an outstanding command holds exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Device-wide HAL state (enable, configure, disable, capabilities).
    Device,
    Client(ClientId),
    Session(ClientId, SessionId),
}

pub type Scopes = heapless::Vec<Scope, 2>;

impl Scope {
    /// A client scope covers all of that client's sessions.
    pub fn overlaps(&self, other: &Scope) -> bool {
        match (*self, *other) {
            (Scope::Device, Scope::Device) => true,
            (Scope::Client(a), Scope::Client(b))
            | (Scope::Client(a), Scope::Session(b, _))
            | (Scope::Session(a, _), Scope::Client(b)) => a == b,
            (Scope::Session(a, s), Scope::Session(b, t)) => a == b && s == t,
            _ => false,
        }
    }
}

/// Build a scope list from a slice; anything past capacity is dropped.
pub fn scopes(list: &[Scope]) -> Scopes {
    let mut out = Scopes::new();
    for s in list {
        if out.push(*s).is_err() {
            break;
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────
// Pending commands
// ───────────────────────────────────────────────────────────────

/// What an outstanding transaction will complete.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingKind {
    Capabilities,
    /// Initial enable or reconfigure triggered by an attach.  The client is
    /// inserted only once this succeeds.
    Connect {
        client: Client,
        merged: EffectiveConfig,
    },
    /// Reconfigure after a detach or a process-wide toggle.
    Reconfigure { merged: EffectiveConfig },
    Disable,
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
    Update {
        client_id: ClientId,
        session_id: SessionId,
        config: SessionConfig,
    },
    Suspend {
        client_id: ClientId,
        session_id: SessionId,
    },
    Resume {
        client_id: ClientId,
        session_id: SessionId,
    },
    Bootstrapping {
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
    },
    Pairing {
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
    },
    PairingReply {
        client_id: ClientId,
        session_id: SessionId,
        peer_id: PeerId,
        pairing_id: u32,
    },
    /// Outbound follow-up message; details live in the message queue engine.
    Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub transaction_id: TransactionId,
    pub kind: PendingKind,
    pub scopes: Scopes,
    pub issued_at_ms: u64,
    seq: u64,
}

// ───────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    pending: HashMap<TransactionId, PendingCommand>,
    timeouts: TimeoutScheduler,
    next_id: TransactionId,
    next_seq: u64,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id not held by any pending command.  Wraps around and skips 0.
    ///
    /// The id is not reserved until [`register`](Self::register); a command
    /// the HAL rejects synchronously therefore consumes nothing.  `None` when
    /// every id is held.
    pub fn allocate(&mut self) -> Option<TransactionId> {
        for _ in 0..=u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
        warn!("transaction: all {} ids in flight", self.pending.len());
        None
    }

    /// Record an accepted command and arm its timeout at `deadline_ms`.
    pub fn register(
        &mut self,
        transaction_id: TransactionId,
        kind: PendingKind,
        scopes: Scopes,
        now_ms: u64,
        deadline_ms: u64,
    ) {
        debug!("transaction: register {transaction_id} {kind:?}");
        self.next_seq += 1;
        self.pending.insert(
            transaction_id,
            PendingCommand {
                transaction_id,
                kind,
                scopes,
                issued_at_ms: now_ms,
                seq: self.next_seq,
            },
        );
        self.timeouts.arm(transaction_id, deadline_ms);
    }

    /// Remove the pending command and cancel its timeout.
    ///
    /// `None` means the id is stale or unknown; callers drop the event.
    pub fn resolve(&mut self, transaction_id: TransactionId) -> Option<PendingCommand> {
        let cmd = self.pending.remove(&transaction_id)?;
        self.timeouts.cancel(transaction_id);
        Some(cmd)
    }

    pub fn get(&self, transaction_id: TransactionId) -> Option<&PendingCommand> {
        self.pending.get(&transaction_id)
    }

    pub fn contains(&self, transaction_id: TransactionId) -> bool {
        self.pending.contains_key(&transaction_id)
    }

    /// Move the timeout of a still-pending command.
    pub fn rearm(&mut self, transaction_id: TransactionId, deadline_ms: u64) -> bool {
        if !self.pending.contains_key(&transaction_id) {
            return false;
        }
        self.timeouts.arm(transaction_id, deadline_ms);
        true
    }

    /// True if any outstanding command holds a scope overlapping `wanted`.
    pub fn is_blocked(&self, wanted: &[Scope]) -> bool {
        self.pending
            .values()
            .flat_map(|p| p.scopes.iter())
            .any(|held| wanted.iter().any(|w| w.overlaps(held)))
    }

    /// Session starts of `role` still waiting for the HAL.
    pub fn pending_starts(&self, role: Role) -> usize {
        self.pending
            .values()
            .filter(|p| match (&p.kind, role) {
                (PendingKind::Publish { .. }, Role::Publish) => true,
                (PendingKind::Subscribe { .. }, Role::Subscribe) => true,
                _ => false,
            })
            .count()
    }

    /// Fire expired timeouts through `delegate`.  The commands stay pending
    /// until the dispatcher dequeues the timeout and resolves them.
    pub fn poll_timeouts(&mut self, now_ms: u64, delegate: &mut impl TimeoutDelegate) -> usize {
        self.timeouts.poll(now_ms, delegate)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timeouts.next_deadline()
    }

    /// Remove every pending command, oldest first.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        let mut all: Vec<_> = self.pending.drain().map(|(_, p)| p).collect();
        all.sort_by_key(|p| p.seq);
        self.timeouts.clear();
        all
    }

    /// Pending ids, oldest first.
    pub fn ids(&self) -> Vec<TransactionId> {
        let mut all: Vec<_> = self.pending.values().collect();
        all.sort_by_key(|p| p.seq);
        all.into_iter().map(|p| p.transaction_id).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
