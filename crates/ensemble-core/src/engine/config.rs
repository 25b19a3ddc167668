use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_MARKER_SUFFIX: &str = ".log.zst";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(170);
pub const DEFAULT_IDLE_REPORT: Duration = Duration::from_millis(500);

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Minimum time between two periodic checkpoints of a running unit.
    pub checkpoint_interval: Duration,
    /// Entries ending with this suffix mark a cleanly finished unit and are written last.
    pub marker_suffix: String,
    /// Abandon a failed unit and fetch the next one instead of stopping the worker.
    pub tolerate_failures: bool,
    /// Leave the rank's scratch directory behind after retiring.
    pub keep_scratch: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            marker_suffix: DEFAULT_MARKER_SUFFIX.to_string(),
            tolerate_failures: true,
            keep_scratch: false,
        }
    }
}

#[derive(Default)]
pub struct WorkerConfigBuilder {
    checkpoint_interval: Option<Duration>,
    marker_suffix: Option<String>,
    tolerate_failures: Option<bool>,
    keep_scratch: Option<bool>,
}

impl WorkerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }
    pub fn marker_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.marker_suffix = Some(suffix.into());
        self
    }
    pub fn tolerate_failures(mut self, tolerate: bool) -> Self {
        self.tolerate_failures = Some(tolerate);
        self
    }
    pub fn keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = Some(keep);
        self
    }

    pub fn build(self) -> Result<WorkerConfig, ConfigError> {
        let defaults = WorkerConfig::default();
        let marker_suffix = self.marker_suffix.unwrap_or(defaults.marker_suffix);
        if marker_suffix.is_empty() {
            return Err(ConfigError::InvalidParameter {
                parameter: "marker_suffix",
                reason: "must not be empty".to_string(),
            });
        }

        Ok(WorkerConfig {
            checkpoint_interval: self
                .checkpoint_interval
                .unwrap_or(defaults.checkpoint_interval),
            marker_suffix,
            tolerate_failures: self.tolerate_failures.unwrap_or(defaults.tolerate_failures),
            keep_scratch: self.keep_scratch.unwrap_or(defaults.keep_scratch),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// How long one poll of the transport may block.
    pub poll_interval: Duration,
    /// How long live workers get to retire after a termination request.
    pub shutdown_grace: Duration,
    /// Overrides the fleet-size derived ticket capacity.
    pub io_tickets: Option<usize>,
    /// Idle time after which the coordinator reports that it is sleeping.
    pub idle_report: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            io_tickets: None,
            idle_report: DEFAULT_IDLE_REPORT,
        }
    }
}

#[derive(Default)]
pub struct CoordinatorConfigBuilder {
    poll_interval: Option<Duration>,
    shutdown_grace: Option<Duration>,
    io_tickets: Option<usize>,
    idle_report: Option<Duration>,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }
    pub fn io_tickets(mut self, tickets: usize) -> Self {
        self.io_tickets = Some(tickets);
        self
    }
    pub fn idle_report(mut self, after: Duration) -> Self {
        self.idle_report = Some(after);
        self
    }

    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        let defaults = CoordinatorConfig::default();
        let poll_interval = self.poll_interval.unwrap_or(defaults.poll_interval);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidParameter {
                parameter: "poll_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.io_tickets == Some(0) {
            return Err(ConfigError::InvalidParameter {
                parameter: "io_tickets",
                reason: "at least one ticket is required".to_string(),
            });
        }

        Ok(CoordinatorConfig {
            poll_interval,
            shutdown_grace: self.shutdown_grace.unwrap_or(defaults.shutdown_grace),
            io_tickets: self.io_tickets,
            idle_report: self.idle_report.unwrap_or(defaults.idle_report),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_builder_falls_back_to_defaults() {
        let config = WorkerConfigBuilder::new().build().unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.checkpoint_interval, Duration::from_secs(600));
        assert_eq!(config.marker_suffix, ".log.zst");
    }

    #[test]
    fn worker_builder_rejects_empty_marker() {
        let err = WorkerConfigBuilder::new().marker_suffix("").build().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidParameter {
                parameter: "marker_suffix",
                ..
            }
        ));
    }

    #[test]
    fn coordinator_builder_overrides_and_validates() {
        let config = CoordinatorConfigBuilder::new()
            .shutdown_grace(Duration::from_secs(5))
            .io_tickets(2)
            .build()
            .unwrap();
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.io_tickets, Some(2));
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);

        assert!(CoordinatorConfigBuilder::new().io_tickets(0).build().is_err());
        assert!(
            CoordinatorConfigBuilder::new()
                .poll_interval(Duration::ZERO)
                .build()
                .is_err()
        );
    }
}
