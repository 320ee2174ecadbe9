use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which aggregate stream a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn for_outcome(success: bool) -> Self {
        if success {
            Stream::Stdout
        } else {
            Stream::Stderr
        }
    }
}

/// Destination for fully formatted lines.
pub trait Output: Send + Sync {
    fn write_line(&self, stream: Stream, line: &str) -> io::Result<()>;
}

/// Writes to this process' own stdout/stderr, one write per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdOutput;

impl Output for StdOutput {
    fn write_line(&self, stream: Stream, line: &str) -> io::Result<()> {
        match stream {
            Stream::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.flush()
            }
            Stream::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(line.as_bytes())?;
                err.flush()
            }
        }
    }
}

/// Captures lines in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    lines: Mutex<Vec<(Stream, String)>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Stream, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn stream(&self, stream: Stream) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, line)| line)
            .collect()
    }
}

impl Output for MemoryOutput {
    fn write_line(&self, stream: Stream, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?
            .push((stream, line.to_string()));
        Ok(())
    }
}

pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/*
    @@@
    @format_line();
    . Builds "<timestamp> [<label>] <message>\n" from one raw chunk of child output.
    . The chunk may be partial or span several lines; it is decoded lossily and only trailing whitespace is stripped.
*/
pub fn format_line(timestamp: &str, label: &str, message: &[u8]) -> String {
    let text = String::from_utf8_lossy(message);
    format!("{} [{}] {}\n", timestamp, label, text.trim_end())
}

/// Shared handle that timestamps and routes lines to an [`Output`].
#[derive(Clone)]
pub struct LineLogger {
    out: Arc<dyn Output>,
}

impl LineLogger {
    pub fn new(out: Arc<dyn Output>) -> Self {
        Self { out }
    }

    pub fn stdio() -> Self {
        Self::new(Arc::new(StdOutput))
    }

    pub fn log(&self, stream: Stream, label: &str, message: &[u8]) -> io::Result<()> {
        self.out.write_line(stream, &format_line(&timestamp(), label, message))
    }

    // Untagged line, used for coordinator advisories.
    pub fn notice(&self, stream: Stream, message: &str) -> io::Result<()> {
        self.out
            .write_line(stream, &format!("{} {}\n", timestamp(), message.trim_end()))
    }
}

/*
    @@@
    @logs_tracing();
    . With a log directory: creates a daily-rotating log file (<dir>/aggregate-commands.log) behind a non-blocking writer, and returns the guard to keep it alive.
    . Without one: diagnostics go to stderr, so they never mix with the aggregated stdout stream.
    . `verbose` lowers the max level from WARN to INFO.
*/
pub fn logs_tracing(log_dir: Option<&Path>, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    match log_dir {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "aggregate-commands.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = SubscriberBuilder::default()
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_writer(non_blocking)
                .with_max_level(level)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = SubscriberBuilder::default()
                .with_target(false)
                .with_writer(io::stderr)
                .with_max_level(level)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
            Ok(None)
        }
    }
}
