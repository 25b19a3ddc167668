use crate::error::{CliError, Result};
use cadee_ensemble::core::models::ids::Rank;
use cadee_ensemble::engine::config::WorkerConfig;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const REAP_POLL: Duration = Duration::from_millis(50);

/// Everything a spawned `worker` process needs to join the fleet.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub coordinator: SocketAddr,
    pub size: usize,
    pub fleet_id: String,
    pub scratch_root: PathBuf,
    pub executable: String,
    pub worker: WorkerConfig,
    pub verbosity: u8,
    pub quiet: bool,
}

impl LaunchPlan {
    pub fn worker_args(&self, rank: Rank) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if self.quiet {
            args.push("-q".into());
        } else if self.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(self.verbosity as usize)).into());
        }
        args.push("worker".into());
        args.push("--connect".into());
        args.push(self.coordinator.to_string().into());
        args.push("--rank".into());
        args.push(rank.to_string().into());
        args.push("--size".into());
        args.push(self.size.to_string().into());
        args.push("--fleet-id".into());
        args.push(self.fleet_id.clone().into());
        args.push("--scratch-dir".into());
        args.push(self.scratch_root.clone().into_os_string());
        args.push("--executable".into());
        args.push(self.executable.clone().into());
        args.push("--checkpoint-interval".into());
        args.push(self.worker.checkpoint_interval.as_secs().to_string().into());
        for (key, value) in [
            ("worker.marker-suffix", self.worker.marker_suffix.clone()),
            (
                "worker.tolerate-failures",
                self.worker.tolerate_failures.to_string(),
            ),
            ("worker.keep-scratch", self.worker.keep_scratch.to_string()),
        ] {
            args.push("-S".into());
            args.push(format!("{key}={value}").into());
        }
        args
    }
}

/// Child worker processes. Whatever is still running when this is dropped gets killed.
pub struct WorkerProcesses {
    children: Vec<(Rank, Child)>,
}

impl WorkerProcesses {
    pub fn spawn(plan: &LaunchPlan) -> Result<Self> {
        let mut processes = Self {
            children: Vec::with_capacity(plan.size.saturating_sub(1)),
        };
        for rank in 1..plan.size {
            let child = Command::new(&plan.program)
                .args(plan.worker_args(rank))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| {
                    CliError::Launch(format!(
                        "could not start worker {} from {}: {}",
                        rank,
                        plan.program.display(),
                        e
                    ))
                })?;
            debug!("Started worker {} as pid {}", rank, child.id());
            processes.children.push((rank, child));
        }
        info!("Launched {} worker process(es)", processes.children.len());
        Ok(processes)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Reaps children until all have exited or `timeout` passes. Returns the ranks that did not
    /// exit cleanly, including those still running.
    pub fn wait_all(&mut self, timeout: Duration) -> Vec<Rank> {
        let deadline = Instant::now() + timeout;
        let mut failed = Vec::new();
        while !self.children.is_empty() {
            let mut still_running = Vec::with_capacity(self.children.len());
            for (rank, mut child) in self.children.drain(..) {
                match child.try_wait() {
                    Ok(Some(status)) if status.success() => {
                        debug!("Worker {} exited cleanly", rank);
                    }
                    Ok(Some(status)) => {
                        warn!("Worker {} exited with {}", rank, status);
                        failed.push(rank);
                    }
                    Ok(None) => still_running.push((rank, child)),
                    Err(e) => {
                        error!("Could not query worker {}: {}", rank, e);
                        failed.push(rank);
                    }
                }
            }
            self.children = still_running;
            if self.children.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(REAP_POLL);
        }
        failed.extend(self.children.iter().map(|(rank, _)| *rank));
        failed.sort_unstable();
        failed
    }

    pub fn kill_all(&mut self) {
        for (rank, mut child) in self.children.drain(..) {
            if let Ok(Some(_)) = child.try_wait() {
                continue;
            }
            warn!("Killing worker {} (pid {})", rank, child.id());
            if let Err(e) = child.kill() {
                error!("Could not kill worker {}: {}", rank, e);
            }
            let _ = child.wait();
        }
    }
}

impl Drop for WorkerProcesses {
    fn drop(&mut self) {
        self.kill_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn plan(program: PathBuf) -> LaunchPlan {
        LaunchPlan {
            program,
            coordinator: "127.0.0.1:4567".parse().unwrap(),
            size: 3,
            fleet_id: "4242".to_string(),
            scratch_root: PathBuf::from("/scratch"),
            executable: "qdyn5".to_string(),
            worker: WorkerConfig::default(),
            verbosity: 2,
            quiet: false,
        }
    }

    #[test]
    fn worker_args_carry_identity_and_worker_settings() {
        let args: Vec<String> = plan(PathBuf::from("cadee-ensemble"))
            .worker_args(2)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        let joined = args.join(" ");
        assert!(joined.starts_with("-vv worker --connect 127.0.0.1:4567 --rank 2 --size 3"));
        assert!(joined.contains("--fleet-id 4242"));
        assert!(joined.contains("--scratch-dir /scratch"));
        assert!(joined.contains("--executable qdyn5"));
        assert!(joined.contains("--checkpoint-interval 600"));
        assert!(joined.contains("-S worker.marker-suffix=.log.zst"));
        assert!(joined.contains("-S worker.keep-scratch=false"));
    }

    #[test]
    fn quiet_wins_over_verbosity() {
        let mut plan = plan(PathBuf::from("cadee-ensemble"));
        plan.quiet = true;
        assert_eq!(plan.worker_args(1)[0], OsString::from("-q"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn exited_children_are_reaped_and_failures_reported() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-worker");
        std::fs::write(&script, "#!/bin/sh\ncase \"$6\" in 2) exit 1;; esac\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut processes = WorkerProcesses::spawn(&plan(script)).unwrap();
        assert_eq!(processes.len(), 2);
        assert_eq!(processes.wait_all(Duration::from_secs(10)), vec![2]);
        assert_eq!(processes.len(), 0);
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn hanging_children_are_reported_and_killed() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-worker");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut processes = WorkerProcesses::spawn(&plan(script)).unwrap();
        assert_eq!(processes.wait_all(Duration::from_millis(100)), vec![1, 2]);
        assert_eq!(processes.len(), 2);
        processes.kill_all();
        assert_eq!(processes.len(), 0);
    }
}
