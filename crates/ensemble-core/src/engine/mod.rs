//! # Engine Module
//!
//! This module implements the fleet engine: the coordinator that owns the work queue and the
//! shared-storage admission tickets, and the worker agent that runs units and checkpoints them.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Timing and policy knobs for coordinators and workers
//! - **Fleet Context** ([`context`]) - Rank identity and transport handle, passed explicitly
//! - **Admission Control** ([`tickets`]) - FIFO ticket pool bounding concurrent archive I/O
//! - **Checkpointing** ([`checkpoint`]) - Incremental, content-addressed archive appends
//! - **Compute Steps** ([`step`]) - The opaque per-unit computation and its factory
//! - **Progress Monitoring** ([`progress`]) - Dispatch/completion events for front ends
//! - **Error Handling** ([`error`]) - Engine-level error type
//!
//! Each rank runs one single-threaded loop. All ticket-pool and queue state lives inside the
//! coordinator's loop; all checkpoint state lives inside a worker's loop.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod progress;
pub mod queue;
pub mod step;
pub mod termination;
pub mod tickets;
pub mod worker;
