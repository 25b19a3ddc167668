/// A fleet member's numeric identity on the transport.
pub type Rank = usize;

/// The rank that owns the work queue, the ticket pool, and the result sink.
pub const COORDINATOR_RANK: Rank = 0;
