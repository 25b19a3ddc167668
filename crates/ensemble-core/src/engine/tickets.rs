use crate::core::models::ids::Rank;
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Smallest ticket capacity regardless of fleet size.
pub const MIN_IO_TICKETS: usize = 8;

/// Fleet-size derived capacity: one ticket per 16 workers, but never fewer than
/// [`MIN_IO_TICKETS`].
pub fn capacity_for(workers: usize) -> usize {
    MIN_IO_TICKETS.max(workers / 16)
}

/// Bounds how many ranks may touch shared storage at once. Requests are granted strictly in
/// arrival order.
#[derive(Debug)]
pub struct TicketPool {
    capacity: usize,
    waiting: VecDeque<Rank>,
    holders: BTreeSet<Rank>,
}

impl TicketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            waiting: VecDeque::new(),
            holders: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.holders.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn holds(&self, rank: Rank) -> bool {
        self.holders.contains(&rank)
    }

    /// Queues `rank` for a ticket. A rank that is already waiting or holding is ignored.
    pub fn request(&mut self, rank: Rank) {
        if self.holders.contains(&rank) || self.waiting.contains(&rank) {
            warn!("Rank {} requested a ticket it already holds or awaits", rank);
            return;
        }
        self.waiting.push_back(rank);
        debug!("{} into io-queue ({})", rank, self.waiting.len());
    }

    /// Returns `rank`'s ticket to the pool. Returns `false` if it held none.
    pub fn release(&mut self, rank: Rank) -> bool {
        let held = self.holders.remove(&rank);
        if held {
            debug!("{} released ticket. concurrency: {}", rank, self.holders.len());
        } else {
            warn!("Rank {} released a ticket it did not hold", rank);
        }
        held
    }

    /// Grants tickets to waiting ranks, oldest first, while capacity remains. Returns the
    /// ranks that must now be sent `IO_TICKET`.
    pub fn service(&mut self) -> Vec<Rank> {
        let mut granted = Vec::new();
        while self.holders.len() < self.capacity {
            let Some(rank) = self.waiting.pop_front() else {
                break;
            };
            if self.near_capacity() {
                debug!("{} recv ticket. concurrency: {}", rank, self.holders.len() + 1);
            }
            self.holders.insert(rank);
            granted.push(rank);
        }
        granted
    }

    /// True when the next grant hands out the last free ticket.
    fn near_capacity(&self) -> bool {
        self.holders.len() + 2 > self.capacity
    }

    /// Drops every trace of `rank`, e.g. after it retired.
    pub fn forget(&mut self, rank: Rank) {
        self.waiting.retain(|&r| r != rank);
        if self.holders.remove(&rank) {
            warn!("Rank {} retired while holding a ticket", rank);
        }
    }
}
