use crate::logger::{LineLogger, Stream};
use crate::parse::{CommandDescriptor, DescriptorError, Requirement};
use futures::future::join_all;
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::process::Child;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// How a managed process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationState {
    Exited(i32),
    Signaled(i32),
    SpawnError(String),
    /// Neither an exit code nor a signal was reported.
    Unknown,
}

impl TerminationState {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return TerminationState::Signaled(sig);
            }
        }
        match status.code() {
            Some(code) => TerminationState::Exited(code),
            None => TerminationState::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminationState::Exited(0))
    }

    /// Human-readable reason, as logged next to the process label.
    pub fn reason(&self) -> String {
        match self {
            TerminationState::Exited(code) => format!("Terminated with code {}", code),
            TerminationState::Signaled(sig) => format!("Killed with signal '{}'", signal_name(*sig)),
            TerminationState::SpawnError(err) => format!("Failed ({})", err),
            TerminationState::Unknown => "Terminated with no information".to_string(),
        }
    }
}

impl fmt::Display for TerminationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

pub fn signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => sig.to_string(),
    }
}

/// Runtime handle for one spawned command.
#[derive(Debug)]
pub struct ManagedProcess {
    pub id: usize,
    pub label: String,
    pub required: Requirement,
    pub pid: Option<u32>,
    // Signals go through the task that owns the child, never by raw pid.
    signals: Option<UnboundedSender<Signal>>,
    termination: OnceLock<TerminationState>,
}

impl ManagedProcess {
    pub fn is_running(&self) -> bool {
        self.termination.get().is_none()
    }

    pub fn termination(&self) -> Option<&TerminationState> {
        self.termination.get()
    }

    /*
        @@@
        @finish();
        . Records the terminal state; only the first call wins.
        . Returns the termination event to publish, or None if the state was already recorded.
    */
    pub fn finish(self: &Arc<Self>, state: TerminationState) -> Option<Event> {
        self.termination.set(state.clone()).ok()?;
        Some(Event::Terminated {
            process: Arc::clone(self),
            state,
        })
    }

    /// Asks the waiter task to deliver `signal`. Returns whether the request was queued.
    pub fn signal(&self, signal: Signal) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(signals) = &self.signals else {
            return false;
        };
        signals.send(signal).is_ok()
    }
}

/// Input to the shutdown coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    Terminated {
        process: Arc<ManagedProcess>,
        state: TerminationState,
    },
    /// This process itself received a termination signal.
    Interrupted(Signal),
    /// Child output could not be written to its sink. Fatal to the run.
    OutputFailed {
        label: String,
        error: Arc<io::Error>,
    },
}

/// Process-wide state for one invocation.
#[derive(Debug, Default)]
pub struct RunState {
    processes: RwLock<Vec<Arc<ManagedProcess>>>,
    shutdown_started: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, label: &str, required: Requirement, pid: Option<u32>) -> Arc<ManagedProcess> {
        self.insert(label, required, pid, None)
    }

    fn insert(
        &self,
        label: &str,
        required: Requirement,
        pid: Option<u32>,
        signals: Option<UnboundedSender<Signal>>,
    ) -> Arc<ManagedProcess> {
        let mut processes = match self.processes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let process = Arc::new(ManagedProcess {
            id: processes.len(),
            label: label.to_string(),
            required,
            pid,
            signals,
            termination: OnceLock::new(),
        });
        processes.push(Arc::clone(&process));
        process
    }

    pub fn processes(&self) -> Vec<Arc<ManagedProcess>> {
        match self.processes.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.processes.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flips the shutdown latch. Exactly one caller ever gets `true`.
    pub fn begin_shutdown(&self) -> bool {
        self.shutdown_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }
}

/*
    @@@
    @Supervisor;
    . Spawns every descriptor at once, pumps each child's stdout/stderr through the line logger and reports terminations on the event channel.
    . Holds the reader tasks so output can be drained before the process exits.
*/
pub struct Supervisor {
    state: Arc<RunState>,
    logger: LineLogger,
    events: UnboundedSender<Event>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(logger: LineLogger, events: UnboundedSender<Event>) -> Self {
        Self {
            state: Arc::new(RunState::new()),
            logger,
            events,
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    /// Validates every descriptor first; nothing is spawned if one is rejected.
    pub fn spawn_all(&self, commands: &[CommandDescriptor]) -> Result<Vec<Arc<ManagedProcess>>, DescriptorError> {
        for command in commands {
            command.validate()?;
        }
        Ok(commands.iter().map(|command| self.spawn(command)).collect())
    }

    /*
        @@@
        @spawn();
        . Starts one child with null stdin and piped stdout/stderr; never waits on it.
        . A spawn failure is registered like any other process and reported straight away as SpawnError.
    */
    pub fn spawn(&self, command: &CommandDescriptor) -> Arc<ManagedProcess> {
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %command.label.trim_end(), executable = %command.executable, error = %e, "spawn failed");
                let process = self.state.register(&command.label, command.required, None);
                if let Some(event) = process.finish(TerminationState::SpawnError(e.to_string())) {
                    self.publish(event);
                }
                return process;
            }
        };

        let (signal_tx, signal_rx) = unbounded_channel();
        let process = self
            .state
            .insert(&command.label, command.required, child.id(), Some(signal_tx));
        info!(program = %command.label.trim_end(), pid = ?process.pid, "spawned");

        if let Some(stdout) = child.stdout.take() {
            self.attach_reader(stdout, Stream::Stdout, &command.label);
        }
        if let Some(stderr) = child.stderr.take() {
            self.attach_reader(stderr, Stream::Stderr, &command.label);
        }

        let waiting = Arc::clone(&process);
        let events = self.events.clone();
        tokio::spawn(async move {
            let state = match wait_for_exit(&mut child, signal_rx, &waiting.label).await {
                Ok(status) => TerminationState::from_status(status),
                Err(e) => {
                    error!(program = %waiting.label.trim_end(), error = %e, "wait failed");
                    TerminationState::Unknown
                }
            };
            if let Some(event) = waiting.finish(state) {
                let _ = events.send(event);
            }
        });

        process
    }

    fn attach_reader<R>(&self, mut source: R, stream: Stream, label: &str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logger = self.logger.clone();
        let events = self.events.clone();
        let label = label.to_string();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = logger.log(stream, &label, &buf[..n]) {
                            error!(program = %label.trim_end(), error = %e, "failed writing output");
                            let _ = events.send(Event::OutputFailed {
                                label,
                                error: Arc::new(e),
                            });
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(program = %label.trim_end(), error = %e, "failed reading output");
                        break;
                    }
                }
            }
        });

        match self.readers.lock() {
            Ok(mut readers) => readers.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    fn publish(&self, event: Event) {
        if self.events.send(event).is_err() {
            warn!("termination event dropped: coordinator is gone");
        }
    }

    /// Waits up to `limit` for every output reader to hit EOF.
    pub async fn drain(&self, limit: Duration) {
        let handles = match self.readers.lock() {
            Ok(mut readers) => std::mem::take(&mut *readers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if timeout(limit, join_all(handles)).await.is_err() {
            warn!(timeout = ?limit, "output still open after exit; not waiting any longer");
        }
    }
}

/*
    @@@
    @wait_for_exit();
    . Owns the child until it is reaped, delivering queued signals in between.
    . A signal is only ever sent while wait() has not returned, so the pid cannot have been reused.
*/
async fn wait_for_exit(
    child: &mut Child,
    mut signals: UnboundedReceiver<Signal>,
    label: &str,
) -> io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status,
            Some(signal) = signals.recv() => deliver(child, signal, label),
        }
    }
}

fn deliver(child: &Child, signal: Signal, label: &str) {
    // id() is None once tokio has reaped the child.
    let Some(pid) = child.id() else {
        return;
    };
    info!(program = %label.trim_end(), pid, signal = ?signal, "sending signal");
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        error!(program = %label.trim_end(), pid, error = %e, "failed to send {}", signal);
    }
}

/// Turns SIGINT/SIGTERM sent to this process into `Event::Interrupted`.
pub fn forward_signals(events: UnboundedSender<Event>) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    tokio::spawn(async move {
        while let Some(raw) = signals.next().await {
            let Ok(signal) = Signal::try_from(raw) else {
                continue;
            };
            if events.send(Event::Interrupted(signal)).is_err() {
                break;
            }
        }
    });
    Ok(())
}
