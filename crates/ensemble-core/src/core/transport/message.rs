use crate::core::models::ids::Rank;
use crate::core::models::results::ResultTuple;
use crate::core::models::unit::Assignment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The fixed wire vocabulary of the fleet protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Done,
    Inputs,
    Log,
    IoRequest,
    IoTicket,
    IoFinished,
    Results,
    Shutdown,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Done,
        MessageKind::Inputs,
        MessageKind::Log,
        MessageKind::IoRequest,
        MessageKind::IoTicket,
        MessageKind::IoFinished,
        MessageKind::Results,
        MessageKind::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Done => "DONE",
            MessageKind::Inputs => "INPUTS",
            MessageKind::Log => "LOG",
            MessageKind::IoRequest => "IO_REQUEST",
            MessageKind::IoTicket => "IO_TICKET",
            MessageKind::IoFinished => "IO_FINISHED",
            MessageKind::Results => "RESULTS",
            MessageKind::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message together with its payload. Each variant corresponds to exactly one
/// [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Worker is idle and asks for work. `previous` is the archive of the unit it just
    /// finished, `None` on the first request or after an abandoned unit.
    Done { previous: Option<PathBuf> },
    Inputs(Assignment),
    Log(String),
    IoRequest,
    IoTicket,
    IoFinished,
    Results(ResultTuple),
    Shutdown,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Done { .. } => MessageKind::Done,
            Message::Inputs(_) => MessageKind::Inputs,
            Message::Log(_) => MessageKind::Log,
            Message::IoRequest => MessageKind::IoRequest,
            Message::IoTicket => MessageKind::IoTicket,
            Message::IoFinished => MessageKind::IoFinished,
            Message::Results(_) => MessageKind::Results,
            Message::Shutdown => MessageKind::Shutdown,
        }
    }
}

/// A received message and the rank that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: Rank,
    pub message: Message,
}

impl Envelope {
    pub fn new(source: Rank, message: Message) -> Self {
        Self { source, message }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}
