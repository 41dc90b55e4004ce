//! Child processes under a [`RunControl`]: bounded capture, deadline and
//! cancellation polling, kill plus bounded reap on interrupt.
//!
//! Stdout is captured up to [`MAX_STDOUT_BYTES`]. Stderr is forwarded line by
//! line to `tracing` at debug level and its last [`STDERR_TAIL_LINES`] lines
//! are kept for error reports.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::{Interrupt, RunControl};

pub const MAX_STDOUT_BYTES: u64 = 1 << 20;
pub const STDERR_TAIL_LINES: usize = 40;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr_tail: String,
}

impl ProcessOutput {
    /// Stdout as UTF-8 with the trailing newline removed.
    #[must_use]
    pub fn stdout_line(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim_end().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {detail}")]
    Spawn { program: String, detail: String },
    #[error("{program} interrupted: {interrupt:?}")]
    Interrupted { program: String, interrupt: Interrupt },
    #[error("{program} could not be reaped within {}s", REAP_TIMEOUT.as_secs())]
    Reap { program: String },
}

/// Run `cmd` to completion, or until `ctl` interrupts it.
///
/// A non-zero exit status is not an error here; callers inspect
/// [`ProcessOutput::status`].
///
/// # Errors
///
/// Spawn failure, interruption, or a child that survives `kill`.
pub fn run(mut cmd: Command, ctl: &RunControl) -> Result<ProcessOutput, ProcessError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    ctl.check().map_err(|interrupt| ProcessError::Interrupted {
        program: program.clone(),
        interrupt,
    })?;

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessError::Spawn {
            program: program.clone(),
            detail: e.to_string(),
        })?;

    let stdout_reader = child.stdout.take().map(|out| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.take(MAX_STDOUT_BYTES).read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|err| {
        let label = program.clone();
        std::thread::spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in BufReader::new(err).lines().map_while(Result::ok) {
                tracing::debug!(target: "veribuild::process", program = %label, "{line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
    });

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(ProcessOutput {
                    status,
                    stdout: join(stdout_reader, Instant::now() + READER_JOIN_TIMEOUT)
                        .unwrap_or_default(),
                    stderr_tail: join(stderr_reader, Instant::now() + READER_JOIN_TIMEOUT)
                        .unwrap_or_default(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Err(ProcessError::Spawn {
                    program,
                    detail: format!("wait failed: {e}"),
                })
            }
        }

        if let Err(interrupt) = ctl.check() {
            tracing::warn!(%program, ?interrupt, "terminating child process");
            bounded_reap(&mut child, &program)?;
            drop(child);
            let join_deadline = Instant::now() + READER_JOIN_TIMEOUT;
            let _ = join(stdout_reader, join_deadline);
            let _ = join(stderr_reader, join_deadline);
            return Err(ProcessError::Interrupted { program, interrupt });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the child and poll `try_wait` until it is reaped or the bound passes.
fn bounded_reap(child: &mut Child, program: &str) -> Result<Option<ExitStatus>, ProcessError> {
    match child.try_wait() {
        Ok(None) => {}
        Ok(Some(status)) => return Ok(Some(status)),
        Err(_) => return Ok(None),
    }
    let _ = child.kill();
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Ok(Some(status)),
            Err(_) => return Ok(None),
        }
        if Instant::now() >= deadline {
            return Err(ProcessError::Reap {
                program: program.to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Join a reader thread, abandoning it if it outlives `deadline`.
fn join<T>(handle: Option<JoinHandle<T>>, deadline: Instant) -> Option<T> {
    let handle = handle?;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.join().ok()
}
