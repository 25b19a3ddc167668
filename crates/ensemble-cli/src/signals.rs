use crate::error::Result;
use cadee_ensemble::engine::termination::TerminationFlag;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Exit status after a second termination signal.
pub const FORCED_EXIT_CODE: i32 = 130;

#[cfg(unix)]
type TerminateStream = signal::unix::Signal;
#[cfg(not(unix))]
type TerminateStream = ();

/// Raises `flag` on the first Ctrl-C or SIGTERM; a second one exits the process at once.
pub fn install(flag: TerminationFlag) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate: TerminateStream =
        signal::unix::signal(signal::unix::SignalKind::terminate())?;
    #[cfg(not(unix))]
    let mut terminate: TerminateStream = ();

    Ok(tokio::spawn(async move {
        let name = wait_for_signal(&mut terminate).await;
        warn!(
            "Received {}. Checkpointing and shutting down; signal again to exit immediately.",
            name
        );
        flag.raise();

        let name = wait_for_signal(&mut terminate).await;
        error!("Received {} again. Exiting without a final checkpoint.", name);
        std::process::exit(FORCED_EXIT_CODE);
    }))
}

async fn wait_for_signal(terminate: &mut TerminateStream) -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        terminate.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = {
        let _ = terminate;
        std::future::pending::<()>()
    };

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn sigterm_raises_the_termination_flag() {
        let flag = TerminationFlag::new();
        let listener = install(flag.clone()).expect("install signal listener");

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .expect("run kill");
        assert!(status.success());

        let mut waited = Duration::ZERO;
        while !flag.is_raised() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert!(flag.is_raised());
        listener.abort();
    }
}
