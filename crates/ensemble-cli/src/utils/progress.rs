use cadee_ensemble::engine::progress::{Progress, ProgressCallback};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Clone)]
pub struct CliProgressHandler {
    pb: Arc<Mutex<ProgressBar>>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        let pb = ProgressBar::new(0)
            .with_style(Self::bar_style())
            .with_message("Waiting for workers");
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.finish_and_clear();

        Self {
            pb: Arc::new(Mutex::new(pb)),
        }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let pb_clone = self.pb.clone();

        Box::new(move |progress: Progress| {
            let Ok(pb_guard) = pb_clone.lock() else {
                warn!("Progress bar mutex was poisoned. Cannot update progress.");
                return;
            };

            match progress {
                Progress::FleetStart {
                    total_units,
                    workers,
                } => {
                    pb_guard.reset();
                    pb_guard.set_length(total_units);
                    pb_guard.set_position(0);
                    pb_guard.set_style(Self::bar_style());
                    pb_guard.set_message(format!("{} worker(s)", workers));
                }
                Progress::UnitDispatched { rank, name } => {
                    pb_guard.set_message(format!("{} -> rank {}", name, rank));
                }
                Progress::UnitCompleted { .. } => {
                    pb_guard.inc(1);
                }
                Progress::UnitAbandoned { rank, name } => {
                    pb_guard.inc(1);
                    pb_guard.println(format!("  ✗ {} abandoned by rank {}", name, rank));
                }
                Progress::WorkerRetired { rank, remaining } => {
                    pb_guard.set_message(format!(
                        "rank {} retired, {} worker(s) left",
                        rank, remaining
                    ));
                }
                Progress::ShutdownRequested { abandoned } => {
                    pb_guard.println(format!(
                        "  Shutdown requested; {} queued unit(s) will not run",
                        abandoned
                    ));
                    let length = pb_guard.length().unwrap_or(0);
                    pb_guard.set_length(length.saturating_sub(abandoned as u64));
                }
                Progress::FleetFinish => {
                    pb_guard.finish_with_message("✓ Done");
                }
                Progress::Message(msg) => {
                    if !pb_guard.is_finished() {
                        pb_guard.println(format!("  {}", msg));
                    } else {
                        pb_guard.set_message(msg);
                    }
                }
            }
        })
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template("{msg:<32} [{bar:40.cyan/blue}] {pos}/{len} ({secs})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .with_key(
                "secs",
                |state: &ProgressState, w: &mut dyn std::fmt::Write| {
                    let _ = write!(w, "{:.0}s", state.elapsed().as_secs_f64());
                },
            )
            .progress_chars("##-")
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn handler_initializes_in_a_clean_state() {
        let handler = CliProgressHandler::new();
        let pb = handler.pb.lock().unwrap();
        assert_eq!(pb.length(), Some(0));
        assert!(pb.is_finished());
    }

    #[test]
    fn callback_tracks_fleet_progress() {
        let handler = CliProgressHandler::new();
        let callback = handler.get_callback();

        callback(Progress::FleetStart {
            total_units: 4,
            workers: 2,
        });
        {
            let pb = handler.pb.lock().unwrap();
            assert_eq!(pb.length(), Some(4));
            assert_eq!(pb.position(), 0);
            assert_eq!(pb.message(), "2 worker(s)");
        }

        callback(Progress::UnitDispatched {
            rank: 1,
            name: "wt_0".to_string(),
        });
        assert_eq!(handler.pb.lock().unwrap().message(), "wt_0 -> rank 1");

        callback(Progress::UnitCompleted { rank: 1 });
        callback(Progress::UnitAbandoned {
            rank: 2,
            name: "wt_1".to_string(),
        });
        assert_eq!(handler.pb.lock().unwrap().position(), 2);

        callback(Progress::ShutdownRequested { abandoned: 2 });
        assert_eq!(handler.pb.lock().unwrap().length(), Some(2));

        callback(Progress::FleetFinish);
        {
            let pb = handler.pb.lock().unwrap();
            assert!(pb.is_finished());
            assert_eq!(pb.message(), "✓ Done");
        }
    }

    #[test]
    fn callback_is_thread_safe() {
        let handler = CliProgressHandler::new();
        let callback = Arc::new(handler.get_callback());
        callback(Progress::FleetStart {
            total_units: 100,
            workers: 10,
        });

        let handles: Vec<_> = (0..10)
            .map(|rank| {
                let cb = callback.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        cb(Progress::UnitCompleted { rank });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(handler.pb.lock().unwrap().position(), 100);
    }
}
