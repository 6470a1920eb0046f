//! Dispatcher command queue.
//!
//! A single FIFO fed by the client API, HAL callbacks and expired timeouts.
//! Two side areas hang off it:
//!
//! - `deferred`: API requests whose target is busy.  They keep their
//!   relative order and are put back at the head of the FIFO as a block
//!   whenever a pending command resolves.
//! - `suspended`: the one request waiting on a consent decision.  While it
//!   is set nothing else is dequeued.
//!
//! ```text
//!   submit ──▶ ┌──────────┐ ──pop──▶ dispatcher ──busy──▶ deferred
//!   timeout ─▶ │  FIFO    │ ◀──────── replay_deferred ◀────────┘
//!   HAL ─────▶ └──────────┘
//! ```

use std::collections::VecDeque;

use log::debug;

use crate::app::commands::{Command, Request};
use crate::app::ports::TimeoutDelegate;
use crate::transaction::Scope;
use crate::types::TransactionId;

#[derive(Debug, Default)]
pub struct CommandQueue {
    fifo: VecDeque<Command>,
    deferred: Vec<Request>,
    suspended: Option<Request>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.fifo.push_back(command);
    }

    /// Next command, or `None` when empty or suspended on consent.
    pub fn pop(&mut self) -> Option<Command> {
        if self.suspended.is_some() {
            return None;
        }
        self.fifo.pop_front()
    }

    pub fn defer(&mut self, request: Request) {
        debug!("queue: deferring {request:?}");
        self.deferred.push(request);
    }

    /// True if an already deferred request shares a target with `wanted`.
    /// Such a request must stay behind it.
    pub fn deferred_overlaps(&self, wanted: &[Scope]) -> bool {
        self.deferred
            .iter()
            .any(|r| r.scopes().iter().any(|held| wanted.iter().any(|w| w.overlaps(held))))
    }

    /// Move every deferred request back to the head, original order kept.
    pub fn replay_deferred(&mut self) -> usize {
        let n = self.deferred.len();
        for request in self.deferred.drain(..).rev() {
            self.fifo.push_front(Command::Api(request));
        }
        n
    }

    /// Park `request` until consent is decided.
    pub fn suspend(&mut self, request: Request) {
        debug!("queue: suspended on consent");
        self.suspended = Some(request);
    }

    /// Take the parked request back out, unblocking [`pop`](Self::pop).
    pub fn resume(&mut self) -> Option<Request> {
        self.suspended.take()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn deferred(&self) -> &[Request] {
        &self.deferred
    }
}

impl TimeoutDelegate for CommandQueue {
    fn on_timeout(&mut self, id: TransactionId) {
        self.push(Command::Timeout(id));
    }
}
