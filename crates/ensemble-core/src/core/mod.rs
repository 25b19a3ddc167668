//! # Core Module
//!
//! Fundamental building blocks shared by every rank of an ensemble fleet.
//!
//! - **Data Models** ([`models`]) - Work units, assignments, ranks, and result tuples
//! - **Messaging** ([`transport`]) - The tagged, rank-addressed message channel between the
//!   coordinator and its workers
//! - **File I/O** ([`io`]) - Archive containers, content digests, scratch directories, input
//!   discovery, and durable result sinks

pub mod io;
pub mod models;
pub mod transport;
