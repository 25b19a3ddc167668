//! # CADEE Ensemble Core Library
//!
//! A master/worker coordinator for ensembles of long-running, independent simulation units.
//! One coordinator rank owns a static queue of work units and hands them to worker ranks on
//! request; workers unpack a unit into rank-private scratch space, drive an opaque compute
//! step to completion, and persist their progress incrementally into an append-only archive.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Plain data models (`WorkUnit`, `ResultTuple`), the
//!   rank-addressed message transport, and I/O utilities (archives, digests, scratch space,
//!   input discovery, and result sinks).
//!
//! - **[`engine`]: The Logic Core.** The stateful protocol participants: the admission-control
//!   `TicketPool`, the incremental `CheckpointEngine`, the `Worker` agent, and the
//!   `Coordinator` that supervises the fleet.
//!
//! - **[`workflows`]: The Public API.** Ready-made fleet drivers that wire the engine to a
//!   transport, such as running a complete fleet inside a single process.

pub mod core;
pub mod engine;
pub mod workflows;
