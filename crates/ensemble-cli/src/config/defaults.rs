use cadee_ensemble::core::io::sink::DEFAULT_COMMIT_INTERVAL;
use cadee_ensemble::engine::config::{
    DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_IDLE_REPORT, DEFAULT_MARKER_SUFFIX,
    DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_GRACE,
};
use std::time::Duration;

pub struct DefaultsConfig {
    pub workers: usize,
    pub listen: String,
    pub spawn: bool,
    pub in_process: bool,
    pub accept_timeout: Duration,
    pub connect_timeout: Duration,
    pub worker_fleet_id: String,
    pub checkpoint_interval: Duration,
    pub marker_suffix: String,
    pub tolerate_failures: bool,
    pub keep_scratch: bool,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub idle_report: Duration,
    pub database_name: String,
    pub fresh_db: bool,
    pub commit_interval: Duration,
    pub executable: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            listen: "127.0.0.1:0".to_string(),
            spawn: true,
            in_process: false,
            accept_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(60),
            worker_fleet_id: "external".to_string(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            marker_suffix: DEFAULT_MARKER_SUFFIX.to_string(),
            tolerate_failures: true,
            keep_scratch: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            idle_report: DEFAULT_IDLE_REPORT,
            database_name: "cadee.db".to_string(),
            fresh_db: false,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            executable: "qdyn5".to_string(),
        }
    }
}
