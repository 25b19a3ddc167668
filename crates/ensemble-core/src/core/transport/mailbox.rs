use super::{Envelope, MessageKind, TransportError};
use crate::core::models::ids::Rank;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// What a transport feeds into a mailbox.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Envelope),
    /// The link to this rank is gone. Posted after the last message that arrived on it.
    Closed(Rank),
}

/// Upper bound on how long a blocked receive goes without checking the abort flag.
const ABORT_CHECK_TICK: Duration = Duration::from_millis(50);

/// Receive side shared by every transport: an inbound channel, the items parked by filtered
/// receives, and the fleet-wide abort flag.
pub(crate) struct Mailbox {
    rank: Rank,
    inbound: Receiver<Inbound>,
    parked: VecDeque<Inbound>,
    aborted: Arc<AtomicBool>,
}

impl Mailbox {
    pub(crate) fn new(rank: Rank, inbound: Receiver<Inbound>, aborted: Arc<AtomicBool>) -> Self {
        Self {
            rank,
            inbound,
            parked: VecDeque::new(),
            aborted,
        }
    }

    pub(crate) fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Takes the oldest message matching both filters. `None` for a filter matches anything;
    /// `None` for the timeout blocks until a match arrives. A closed link to a matching source
    /// fails with [`TransportError::PeerLost`] once its earlier messages have been taken.
    pub(crate) fn take(
        &mut self,
        source: Option<Rank>,
        kind: Option<MessageKind>,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, TransportError> {
        let matches = |item: &Inbound| match item {
            Inbound::Message(env) => {
                source.is_none_or(|s| env.source == s) && kind.is_none_or(|k| env.kind() == k)
            }
            Inbound::Closed(rank) => source.is_none_or(|s| *rank == s),
        };

        if let Some(item) = self
            .parked
            .iter()
            .position(matches)
            .and_then(|pos| self.parked.remove(pos))
        {
            return deliver(item);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.aborted() {
                return Err(TransportError::Aborted);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(ABORT_CHECK_TICK)
                }
                None => ABORT_CHECK_TICK,
            };

            match self.inbound.recv_timeout(wait) {
                Ok(item) if matches(&item) => return deliver(item),
                Ok(item) => self.parked.push_back(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if self.aborted() {
                        return Err(TransportError::Aborted);
                    }
                    return Err(TransportError::Disconnected { rank: self.rank });
                }
            }
        }
    }
}

fn deliver(item: Inbound) -> Result<Option<Envelope>, TransportError> {
    match item {
        Inbound::Message(env) => Ok(Some(env)),
        Inbound::Closed(rank) => Err(TransportError::PeerLost { rank }),
    }
}
