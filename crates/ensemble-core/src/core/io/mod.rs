//! Provides input/output functionality for the ensemble runner.
//!
//! This module contains the append-only archive container that holds a unit's inputs and
//! checkpoints, content hashing for change detection, scratch directory resolution, discovery
//! of simulation packages on disk, and the durable sinks that receive result tuples.

pub mod archive;
pub mod digest;
pub mod scan;
pub mod scratch;
pub mod sink;
