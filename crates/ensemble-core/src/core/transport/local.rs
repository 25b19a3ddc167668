use super::mailbox::{Inbound, Mailbox};
use super::{Envelope, Message, MessageKind, Outbox, Transport, TransportError};
use crate::core::models::ids::{COORDINATOR_RANK, Rank};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::time::Duration;
use tracing::{error, trace};

/// An in-process fleet: one endpoint per rank, wired together with channels.
pub struct LocalFabric;

impl LocalFabric {
    /// Builds `size` connected endpoints; index `i` of the result is rank `i`.
    pub fn new(size: usize) -> Vec<LocalEndpoint> {
        let aborted = Arc::new(AtomicBool::new(false));
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        let senders = Arc::new(senders);

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbound)| LocalEndpoint {
                rank,
                outbox: Arc::new(LocalOutbox {
                    rank,
                    senders: senders.clone(),
                }),
                mailbox: Mailbox::new(rank, inbound, aborted.clone()),
                aborted: aborted.clone(),
            })
            .collect()
    }
}

struct LocalOutbox {
    rank: Rank,
    senders: Arc<Vec<Sender<Inbound>>>,
}

impl Outbox for LocalOutbox {
    fn post(&self, dest: Rank, message: Message) -> Result<(), TransportError> {
        let sender = self
            .senders
            .get(dest)
            .ok_or(TransportError::UnknownRank {
                rank: dest,
                from: self.rank,
                size: self.senders.len(),
            })?;
        trace!(dest, kind = %message.kind(), "posting local message");
        sender
            .send(Inbound::Message(Envelope::new(self.rank, message)))
            .map_err(|_| TransportError::Disconnected { rank: dest })
    }
}

/// One rank of a [`LocalFabric`]. Dropping it tells the ranks it talks to that it is gone:
/// a worker notifies the coordinator, the coordinator notifies every worker.
pub struct LocalEndpoint {
    rank: Rank,
    outbox: Arc<LocalOutbox>,
    mailbox: Mailbox,
    aborted: Arc<AtomicBool>,
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.outbox.senders.len()
    }

    fn send(&self, dest: Rank, message: Message) -> Result<(), TransportError> {
        if self.mailbox.aborted() {
            return Err(TransportError::Aborted);
        }
        self.outbox.post(dest, message)
    }

    fn recv(&mut self, source: Rank, kind: MessageKind) -> Result<Message, TransportError> {
        match self.mailbox.take(Some(source), Some(kind), None)? {
            Some(env) => Ok(env.message),
            None => Err(TransportError::Disconnected { rank: self.rank }),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        self.mailbox.take(None, None, Some(timeout))
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        self.outbox.clone()
    }

    fn abort(&self, code: i32) {
        error!(code, "Aborting in-process fleet from rank {}", self.rank);
        self.aborted.store(true, Ordering::SeqCst);
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        let closed = |dest: &Sender<Inbound>| {
            let _ = dest.send(Inbound::Closed(self.rank));
        };
        if self.rank == COORDINATOR_RANK {
            self.outbox.senders.iter().skip(1).for_each(closed);
        } else if let Some(coordinator) = self.outbox.senders.get(COORDINATOR_RANK) {
            closed(coordinator);
        }
    }
}
