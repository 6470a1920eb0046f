//! Timeout scheduler.
//!
//! Holds one deadline per outstanding transaction.  Nothing here preempts
//! the dispatcher: [`TimeoutScheduler::poll`] hands every expired id to a
//! [`TimeoutDelegate`], which feeds it back into the command queue as an
//! ordinary event.
//!
//! ```text
//!   advance(now) ──▶ poll(now) ──▶ TimeoutDelegate::on_timeout(id)
//!                                          │
//!                                          ▼
//!                                 CommandQueue ◀── API / HAL events
//! ```

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::app::ports::TimeoutDelegate;
use crate::types::TransactionId;

// ═══════════════════════════════════════════════════════════════
//  Scheduler engine
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    deadlines: HashMap<TransactionId, u64>,
    /// Ordered view of `deadlines` so polling only touches expired entries.
    order: BTreeSet<(u64, TransactionId)>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timeout for `id` to fire at `deadline_ms`.
    pub fn arm(&mut self, id: TransactionId, deadline_ms: u64) {
        if let Some(old) = self.deadlines.insert(id, deadline_ms) {
            self.order.remove(&(old, id));
        }
        self.order.insert((deadline_ms, id));
    }

    /// Remove the timeout for `id`.  Returns `false` if none was armed.
    pub fn cancel(&mut self, id: TransactionId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => {
                self.order.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    /// Fire every timeout with a deadline at or before `now_ms`, earliest first.
    ///
    /// Fired entries are disarmed before the delegate is called.
    pub fn poll(&mut self, now_ms: u64, delegate: &mut impl TimeoutDelegate) -> usize {
        let mut fired = 0;
        while let Some(&(deadline, id)) = self.order.first() {
            if deadline > now_ms {
                break;
            }
            self.order.remove(&(deadline, id));
            self.deadlines.remove(&id);
            debug!("scheduler: transaction {id} timed out at {now_ms} ms");
            delegate.on_timeout(id);
            fired += 1;
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.order.first().map(|&(deadline, _)| deadline)
    }

    pub fn is_armed(&self, id: TransactionId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.order.clear();
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
