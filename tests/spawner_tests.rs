use aggregate_commands::control::ExitDisposition;
use aggregate_commands::logger::{LineLogger, MemoryOutput, Output, Stream};
use aggregate_commands::parse::{pad_labels, parser_in, CommandDescriptor, Requirement};
use aggregate_commands::{run_commands, RunOptions};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn sh(required: Requirement, label: &str, script: &str) -> CommandDescriptor {
    CommandDescriptor::new(required, label, "sh", vec!["-c".into(), script.into()]).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        kill_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_millis(500),
        forward_signals: false,
    }
}

async fn run(mut commands: Vec<CommandDescriptor>, options: &RunOptions) -> (ExitDisposition, Arc<MemoryOutput>) {
    pad_labels(&mut commands);
    let out = Arc::new(MemoryOutput::new());
    let disposition = run_commands(&commands, LineLogger::new(out.clone()), options)
        .await
        .unwrap();
    (disposition, out)
}

fn count(lines: &[String], needle: &str) -> usize {
    lines.iter().filter(|l| l.contains(needle)).count()
}

#[tokio::test]
async fn required_success_kills_the_rest_and_exits_zero() {
    let (disposition, out) = run(
        vec![
            sh(Requirement::Required, "first", "sleep 0.01"),
            sh(Requirement::Unspecified, "second", "sleep 0.5"),
            sh(Requirement::Optional, "third", "exit 1"),
        ],
        &options(),
    )
    .await;

    assert_eq!(disposition, ExitDisposition::Success);
    assert_eq!(disposition.code(), 0);

    let stdout = out.stream(Stream::Stdout);
    let stderr = out.stream(Stream::Stderr);
    assert_eq!(count(&stdout, "[first ] Terminated with code 0"), 1);
    assert_eq!(count(&stdout, "killing remaining processes"), 1);
    assert_eq!(count(&stderr, "[third ] Terminated with code 1"), 1);
    assert_eq!(count(&stderr, "[second] Killed with signal 'SIGTERM'"), 1);
}

#[tokio::test]
async fn single_unspecified_failure_exits_with_sentinel() {
    let (disposition, out) = run(vec![sh(Requirement::Unspecified, "only", "exit 2")], &options()).await;

    assert_eq!(disposition.code(), 5);
    let stderr = out.stream(Stream::Stderr);
    assert_eq!(stderr.len(), 1);
    assert!(stderr[0].ends_with(" [only] Terminated with code 2\n"));
    assert!(out.stream(Stream::Stdout).is_empty());
}

#[tokio::test]
async fn all_optional_failures_terminate_with_zero() {
    let (disposition, out) = run(
        vec![
            sh(Requirement::Optional, "a", "exit 3"),
            sh(Requirement::Optional, "b", "sleep 0.05; exit 4"),
        ],
        &options(),
    )
    .await;

    assert_eq!(disposition, ExitDisposition::Success);
    let stderr = out.stream(Stream::Stderr);
    assert_eq!(count(&stderr, "[a] Terminated with code 3"), 1);
    assert_eq!(count(&stderr, "[b] Terminated with code 4"), 1);
    assert_eq!(count(&stderr, "killing remaining processes"), 0);
}

#[tokio::test]
async fn missing_executable_is_a_failure() {
    let missing = CommandDescriptor::new(
        Requirement::Unspecified,
        "ghost",
        "/definitely/not/a/real/binary",
        vec![],
    )
    .unwrap();
    let (disposition, out) = run(
        vec![missing, sh(Requirement::Unspecified, "sleeper", "sleep 5")],
        &options(),
    )
    .await;

    assert_eq!(disposition, ExitDisposition::Failure);
    let stderr = out.stream(Stream::Stderr);
    assert_eq!(count(&stderr, "[ghost  ] Failed ("), 1);
    assert_eq!(count(&stderr, "killing remaining processes"), 1);
    assert_eq!(count(&stderr, "[sleeper] Killed with signal 'SIGTERM'"), 1);
}

#[tokio::test]
async fn output_is_tagged_and_padded() {
    let (disposition, out) = run(
        vec![
            sh(Requirement::Optional, "abc", "echo out-abc"),
            sh(Requirement::Optional, "abcdefg", "echo err-abcdefg >&2"),
            sh(Requirement::Optional, "a", "echo out-a"),
        ],
        &options(),
    )
    .await;

    assert_eq!(disposition, ExitDisposition::Success);
    let stdout = out.stream(Stream::Stdout);
    let stderr = out.stream(Stream::Stderr);
    assert_eq!(count(&stdout, "[abc    ] out-abc"), 1);
    assert_eq!(count(&stdout, "[a      ] out-a"), 1);
    assert_eq!(count(&stderr, "[abcdefg] err-abcdefg"), 1);
    for (_, line) in out.lines() {
        let label = line.split('[').nth(1).and_then(|rest| rest.split(']').next()).unwrap();
        assert_eq!(label.chars().count(), 7, "unaligned line: {line:?}");
    }
}

#[tokio::test]
async fn stubborn_process_is_killed_after_timeout() {
    let options = RunOptions {
        kill_timeout: Duration::from_millis(200),
        ..options()
    };
    let started = Instant::now();
    let (disposition, out) = run(
        vec![
            sh(Requirement::Required, "quick", "sleep 0.3"),
            sh(Requirement::Unspecified, "stubborn", "trap '' TERM; exec sleep 30"),
        ],
        &options,
    )
    .await;

    assert_eq!(disposition, ExitDisposition::Success);
    assert!(started.elapsed() < Duration::from_secs(10));
    let stderr = out.stream(Stream::Stderr);
    assert_eq!(count(&stderr, "Killed with signal 'SIGKILL'"), 1);
}

#[tokio::test]
async fn config_file_drives_a_full_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("commands.json"),
        r#"[[false, "lint", "sh", "-c", "exit 1"], [true, "build", "sh", "-c", "echo built"]]"#,
    )
    .unwrap();

    let commands = parser_in(dir.path(), "commands").unwrap();
    let out = Arc::new(MemoryOutput::new());
    let disposition = run_commands(&commands, LineLogger::new(out.clone()), &options())
        .await
        .unwrap();

    assert_eq!(disposition, ExitDisposition::Success);
    let stdout = out.stream(Stream::Stdout);
    assert_eq!(count(&stdout, "[build] built"), 1);
    assert_eq!(count(&stdout, "[build] Terminated with code 0"), 1);
}

// Rejects every line that carries child output; coordinator lines still go through.
struct BrokenChildSink {
    inner: MemoryOutput,
}

impl Output for BrokenChildSink {
    fn write_line(&self, stream: Stream, line: &str) -> io::Result<()> {
        if line.contains("child-says-hi") {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        self.inner.write_line(stream, line)
    }
}

#[tokio::test]
async fn failed_output_write_aborts_the_run() {
    let sink = Arc::new(BrokenChildSink { inner: MemoryOutput::new() });
    let commands = vec![sh(Requirement::Required, "a", "echo child-says-hi; sleep 5")];

    let started = Instant::now();
    let result = run_commands(&commands, LineLogger::new(sink.clone()), &options()).await;

    let err = result.expect_err("a broken sink must fail the run");
    let io_err = err.downcast_ref::<io::Error>().expect("io error");
    assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
    // the sleeping child is stopped instead of waited out
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(sink.inner.lines().is_empty());
}
