use crate::logger::{LineLogger, Stream};
use crate::parse::Requirement;
use crate::runtime::{Event, ManagedProcess, RunState, TerminationState};
use nix::sys::signal::Signal;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Exit status after a cascade that a failure started.
pub const CASCADE_FAILURE_CODE: i32 = 5;

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

const CASCADE_ADVISORY: &str = "Terminated by previous command, killing remaining processes…";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Success,
    Failure,
}

impl ExitDisposition {
    pub fn from_success(success: bool) -> Self {
        if success {
            ExitDisposition::Success
        } else {
            ExitDisposition::Failure
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ExitDisposition::Success => 0,
            ExitDisposition::Failure => CASCADE_FAILURE_CODE,
        }
    }

    fn stream(self) -> Stream {
        Stream::for_outcome(self == ExitDisposition::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ShuttingDown(ExitDisposition),
    Done(ExitDisposition),
}

/// Whether a termination with this outcome brings the group down.
pub fn should_cascade(required: Requirement, success: bool) -> bool {
    match required {
        Requirement::Required => true,
        Requirement::Optional => false,
        Requirement::Unspecified => !success,
    }
}

/*
    @@@
    @Coordinator;
    . Consumes termination events one at a time, logs each outcome, and decides whether to start the cascade.
    . The cascade runs once (guarded by the RunState latch): signal every process not yet reported, wait for all of them, SIGKILL whatever outlives the kill timeout.
    . `run` resolves with the exit disposition; the caller owns the actual process exit.
*/
pub struct Coordinator {
    state: Arc<RunState>,
    logger: LineLogger,
    kill_timeout: Duration,
    phase: Phase,
    reported: HashSet<usize>,
    awaiting: HashSet<usize>,
    escalate_at: Option<Instant>,
}

impl Coordinator {
    pub fn new(state: Arc<RunState>, logger: LineLogger) -> Self {
        Self {
            state,
            logger,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            phase: Phase::Idle,
            reported: HashSet::new(),
            awaiting: HashSet::new(),
            escalate_at: None,
        }
    }

    pub fn with_kill_timeout(mut self, kill_timeout: Duration) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Must be started after every process has been registered in the RunState.
    pub async fn run(mut self, mut events: UnboundedReceiver<Event>) -> io::Result<ExitDisposition> {
        loop {
            if let Phase::Done(disposition) = self.phase {
                info!(code = disposition.code(), "all processes accounted for");
                return Ok(disposition);
            }
            if self.phase == Phase::Idle && self.reported.len() >= self.state.len() {
                self.phase = Phase::Done(ExitDisposition::Success);
                continue;
            }

            let next = match self.escalate_at {
                Some(at) => tokio::select! {
                    event = events.recv() => event,
                    _ = sleep_until(at) => {
                        self.escalate();
                        continue;
                    }
                },
                None => events.recv().await,
            };

            match next {
                Some(event) => {
                    if let Err(e) = self.handle(event) {
                        self.abort();
                        return Err(e);
                    }
                }
                None => {
                    warn!(phase = ?self.phase, "event channel closed before every process reported");
                    self.phase = match self.phase {
                        Phase::ShuttingDown(disposition) => Phase::Done(disposition),
                        _ => Phase::Done(ExitDisposition::Success),
                    };
                }
            }
        }
    }

    pub fn handle(&mut self, event: Event) -> io::Result<()> {
        match event {
            Event::Terminated { process, state } => self.on_terminated(&process, &state),
            Event::Interrupted(signal) => self.on_interrupted(signal),
            Event::OutputFailed { label, error } => {
                error!(program = %label.trim_end(), error = %error, "output sink failed");
                Err(io::Error::new(
                    error.kind(),
                    format!("writing output of `{}` failed: {}", label.trim_end(), error),
                ))
            }
        }
    }

    // The sinks are unusable at this point; stop the children without logging through them.
    fn abort(&mut self) {
        self.phase = Phase::Done(ExitDisposition::Failure);
        for process in self.state.processes() {
            process.signal(Signal::SIGTERM);
        }
    }

    fn on_terminated(&mut self, process: &ManagedProcess, state: &TerminationState) -> io::Result<()> {
        if !self.reported.insert(process.id) {
            debug!(program = %process.label.trim_end(), "duplicate termination ignored");
            return Ok(());
        }

        let success = state.is_success();
        // Outcome goes out before any cascade decision is acted on.
        self.logger.log(Stream::for_outcome(success), &process.label, state.reason().as_bytes())?;

        if should_cascade(process.required, success) {
            if self.state.begin_shutdown() {
                info!(program = %process.label.trim_end(), success, "shutdown triggered");
                self.begin_cascade(ExitDisposition::from_success(success), CASCADE_ADVISORY)?;
            } else {
                debug!(program = %process.label.trim_end(), "shutdown already in progress; trigger ignored");
            }
        }

        self.awaiting.remove(&process.id);
        if let Phase::ShuttingDown(disposition) = self.phase {
            if self.awaiting.is_empty() {
                self.phase = Phase::Done(disposition);
            }
        }
        Ok(())
    }

    fn on_interrupted(&mut self, signal: Signal) -> io::Result<()> {
        if !self.state.begin_shutdown() {
            debug!(signal = %signal, "shutdown already in progress; interrupt ignored");
            return Ok(());
        }

        warn!(signal = %signal, "interrupted");
        let advisory = format!("Interrupted by {}, killing remaining processes…", signal.as_str());
        self.begin_cascade(ExitDisposition::Failure, &advisory)
    }

    /*
        @@@
        @begin_cascade();
        . Every process whose termination has not been seen yet is awaited, even if it already exited and its event is still queued.
        . Only the ones still running get SIGTERM.
    */
    fn begin_cascade(&mut self, disposition: ExitDisposition, advisory: &str) -> io::Result<()> {
        let remaining: Vec<_> = self
            .state
            .processes()
            .into_iter()
            .filter(|p| !self.reported.contains(&p.id))
            .collect();

        if remaining.is_empty() {
            self.phase = Phase::Done(disposition);
            return Ok(());
        }

        self.logger.notice(disposition.stream(), advisory)?;

        for process in &remaining {
            process.signal(Signal::SIGTERM);
        }
        self.awaiting = remaining.iter().map(|p| p.id).collect();
        self.escalate_at = Some(Instant::now() + self.kill_timeout);
        self.phase = Phase::ShuttingDown(disposition);
        Ok(())
    }

    fn escalate(&mut self) {
        self.escalate_at = None;
        for process in self.state.processes() {
            if self.awaiting.contains(&process.id) && process.is_running() {
                warn!(program = %process.label.trim_end(), timeout = ?self.kill_timeout, "still running after stop signal; sending SIGKILL");
                process.signal(Signal::SIGKILL);
            }
        }
    }
}
