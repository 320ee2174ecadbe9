/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod parse;
pub mod runtime;
pub mod control;
pub mod logger;

use control::{Coordinator, ExitDisposition, DEFAULT_KILL_TIMEOUT};
use logger::LineLogger;
use parse::CommandDescriptor;
use runtime::{forward_signals, Supervisor};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Grace period between SIGTERM and SIGKILL during a cascade.
    pub kill_timeout: Duration,
    /// How long to keep pumping child output after the last termination.
    pub drain_timeout: Duration,
    /// Turn SIGINT/SIGTERM on this process into a failure cascade.
    pub forward_signals: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            drain_timeout: Duration::from_millis(500),
            forward_signals: false,
        }
    }
}

/*
    @@@
    @run_commands();
    . Spawns every command, then hands the termination stream to the coordinator.
    . Resolves once the group is done (natural completion or finished cascade) and child output is drained.
    . The caller turns the disposition into the process exit status.
*/
pub async fn run_commands(
    commands: &[CommandDescriptor],
    logger: LineLogger,
    options: &RunOptions,
) -> anyhow::Result<ExitDisposition> {
    let (tx, rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(logger.clone(), tx.clone());

    supervisor.spawn_all(commands)?;
    if options.forward_signals {
        forward_signals(tx)?;
    }

    let disposition = Coordinator::new(supervisor.state(), logger)
        .with_kill_timeout(options.kill_timeout)
        .run(rx)
        .await?;

    supervisor.drain(options.drain_timeout).await;
    Ok(disposition)
}
