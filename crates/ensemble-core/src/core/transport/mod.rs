//! Rank-addressed, tagged message passing between the coordinator (rank 0) and its workers.
//!
//! Delivery is reliable and ordered per sender. Receives are either blocking and filtered by
//! `(source, kind)`, or polled with a timeout across all sources and kinds. Messages that do
//! not match a filtered receive are parked and handed out later in arrival order.

pub mod local;
pub(crate) mod mailbox;
pub mod message;
pub mod tcp;

pub use local::{LocalEndpoint, LocalFabric};
pub use message::{Envelope, Message, MessageKind};
pub use tcp::TcpTransport;

use crate::core::models::ids::Rank;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport channel closed while rank {rank} was receiving")]
    Disconnected { rank: Rank },

    #[error("Rank {rank} closed its connection")]
    PeerLost { rank: Rank },

    #[error("Fleet was aborted")]
    Aborted,

    #[error("Rank {rank} is not addressable from rank {from} (fleet size {size})")]
    UnknownRank { rank: Rank, from: Rank, size: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Failed to encode or decode a frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One rank's view of the fleet fabric.
pub trait Transport: Send {
    fn rank(&self) -> Rank;

    /// Total number of ranks, coordinator included.
    fn size(&self) -> usize;

    fn send(&self, dest: Rank, message: Message) -> Result<(), TransportError>;

    /// Blocks until a message of `kind` from `source` arrives.
    fn recv(&mut self, source: Rank, kind: MessageKind) -> Result<Message, TransportError>;

    /// Returns the next pending message from any rank, or `None` once `timeout` elapses. A rank
    /// whose link closed is reported once as [`TransportError::PeerLost`].
    fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError>;

    /// A detached send handle that may be shared with other threads.
    fn outbox(&self) -> Arc<dyn Outbox>;

    /// Hard-stops the whole fleet. Ranks blocked in a receive fail with
    /// [`TransportError::Aborted`] or [`TransportError::Disconnected`].
    fn abort(&self, code: i32);
}

pub trait Outbox: Send + Sync {
    fn post(&self, dest: Rank, message: Message) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }
    fn size(&self) -> usize {
        (**self).size()
    }
    fn send(&self, dest: Rank, message: Message) -> Result<(), TransportError> {
        (**self).send(dest, message)
    }
    fn recv(&mut self, source: Rank, kind: MessageKind) -> Result<Message, TransportError> {
        (**self).recv(source, kind)
    }
    fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        (**self).poll(timeout)
    }
    fn outbox(&self) -> Arc<dyn Outbox> {
        (**self).outbox()
    }
    fn abort(&self, code: i32) {
        (**self).abort(code)
    }
}
