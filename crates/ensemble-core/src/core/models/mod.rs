//! Data models exchanged between the coordinator and its workers.

pub mod ids;
pub mod results;
pub mod unit;
