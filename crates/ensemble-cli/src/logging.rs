use crate::error::{CliError, Result};
use cadee_ensemble::core::models::ids::COORDINATOR_RANK;
use cadee_ensemble::core::transport::{Message, Outbox};
use std::cell::Cell;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, MakeWriter},
    prelude::*,
};

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

pub fn setup_logging(
    verbosity: u8,
    quiet: bool,
    log_file: Option<PathBuf>,
) -> Result<LogForwarder> {
    let level_filter = if quiet {
        LevelFilter::ERROR
    } else {
        match verbosity {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .compact();

    let forwarder = LogForwarder::default();
    let forward_layer = fmt::layer()
        .with_writer(forwarder.clone())
        .with_ansi(false)
        .with_target(false)
        .compact();

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(&path).map_err(CliError::Io)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_target(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(level_filter)
        .with(stderr_layer)
        .with(forward_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to install logger: {}", e)))?;

    Ok(forwarder)
}

/// Ships every formatted log line to the coordinator as a `LOG` message once a fleet connection
/// is attached. Until then, and on the coordinator itself, it discards its input.
#[derive(Clone, Default)]
pub struct LogForwarder {
    outbox: Arc<OnceLock<Arc<dyn Outbox>>>,
}

impl LogForwarder {
    /// Starts forwarding through `outbox`. Returns `false` if a connection was already attached.
    pub fn attach(&self, outbox: Arc<dyn Outbox>) -> bool {
        self.outbox.set(outbox).is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.outbox.get().is_some()
    }
}

impl<'a> MakeWriter<'a> for LogForwarder {
    type Writer = ForwardedLine;

    fn make_writer(&'a self) -> Self::Writer {
        // Events raised while a line is being posted must not be posted again.
        let outbox = if FORWARDING.with(Cell::get) {
            None
        } else {
            self.outbox.get().cloned()
        };
        ForwardedLine {
            outbox,
            buf: Vec::new(),
        }
    }
}

/// Buffers one formatted event and posts it when dropped.
pub struct ForwardedLine {
    outbox: Option<Arc<dyn Outbox>>,
    buf: Vec<u8>,
}

impl Write for ForwardedLine {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.outbox.is_some() {
            self.buf.extend_from_slice(bytes);
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ForwardedLine {
    fn drop(&mut self) {
        let Some(outbox) = self.outbox.take() else {
            return;
        };
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        FORWARDING.with(|f| f.set(true));
        // Nowhere left to report a failed post.
        let _ = outbox.post(COORDINATOR_RANK, Message::Log(line));
        FORWARDING.with(|f| f.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadee_ensemble::core::transport::{LocalFabric, MessageKind, Transport};
    use serial_test::serial;
    use std::sync::Once;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    static INIT: Once = Once::new();

    fn install_global_logger() {
        INIT.call_once(|| {
            setup_logging(2, false, None).unwrap();
        });
    }

    #[test]
    #[serial]
    fn logger_installs_once_per_process() {
        install_global_logger();

        let span = tracing::info_span!("rank", id = 3);
        let _entered = span.enter();
        warn!("Rank 3 stopped on a termination request");
        debug!("Checkpointed 4 file(s)");

        let again = setup_logging(0, true, None);
        assert!(matches!(again, Err(CliError::Other(_))));
    }

    #[test]
    #[serial]
    fn file_layer_records_rank_span_and_remote_target() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("fleet.log");

        let file = File::create(&log_path).unwrap();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        );
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("rank", id = 0);
            let _entered = span.enter();
            info!(target: "cadee::remote", "Worker 2 checkpointed 3 file(s)");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("rank{id=0}"), "{content}");
        assert!(content.contains("cadee::remote"), "{content}");
        assert!(content.contains("Worker 2 checkpointed 3 file(s)"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn unwritable_log_file_is_an_io_error() {
        let result = setup_logging(1, false, Some(PathBuf::from("/")));
        assert!(matches!(result, Err(CliError::Io(_))));
    }

    #[test]
    #[serial]
    fn detached_forwarder_discards_lines() {
        let forwarder = LogForwarder::default();
        assert!(!forwarder.is_attached());
        let mut line = forwarder.make_writer();
        line.write_all(b"dropped").unwrap();
        assert!(line.buf.is_empty());
    }

    #[test]
    #[serial]
    fn attached_forwarder_posts_lines_to_the_coordinator() {
        let mut endpoints = LocalFabric::new(2);
        let worker = endpoints.pop().unwrap();
        let mut coordinator = endpoints.pop().unwrap();

        let forwarder = LogForwarder::default();
        assert!(forwarder.attach(worker.outbox()));
        assert!(!forwarder.attach(worker.outbox()));

        let layer = fmt::layer()
            .with_writer(forwarder.clone())
            .with_ansi(false)
            .with_target(false);
        let subscriber = tracing_subscriber::registry()
            .with(LevelFilter::TRACE)
            .with(layer);

        tracing::subscriber::with_default(subscriber, || {
            info!("Initialized on testhost");
        });

        let Message::Log(line) = coordinator.recv(1, MessageKind::Log).unwrap() else {
            panic!("expected a LOG message");
        };
        assert!(line.contains("Initialized on testhost"));
        assert!(line.contains("INFO"));
        assert!(
            coordinator
                .poll(Duration::from_millis(50))
                .unwrap()
                .is_none(),
            "posting must not forward its own trace events"
        );
    }
}
