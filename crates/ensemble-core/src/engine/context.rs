use crate::core::models::ids::{COORDINATOR_RANK, Rank};
use crate::core::transport::Transport;

/// Everything a rank knows about its place in the fleet. Built once at startup and handed to
/// the coordinator or worker that runs on this rank.
pub struct FleetContext<T: Transport> {
    pub transport: T,
    pub hostname: String,
    pub fleet_id: String,
}

impl<T: Transport> FleetContext<T> {
    pub fn new(transport: T, fleet_id: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            transport,
            hostname,
            fleet_id: fleet_id.into(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn workers(&self) -> usize {
        self.size().saturating_sub(1)
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR_RANK
    }
}
