//! External process runner with a deadline and cooperative cancellation.
//!
//! The child runs in its own process group and is polled with `try_wait`. If
//! the deadline passes or shutdown is requested the whole group is killed and
//! the child reaped before the call returns. Background processes the child
//! left in its group are killed when it exits, so no stage ever leaves a
//! helper process running behind it.

use crate::shutdown::ShutdownCoordinator;
use crossbeam_channel::{bounded, Receiver};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a running child is polled
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output collection may outlast the child's exit
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Output wait when the deadline has already passed
const MIN_OUTPUT_WAIT: Duration = Duration::from_millis(200);

/// Bytes of stdout/stderr kept per stream (the tail)
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Errors from running an external program
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The deadline passed; the child was killed
    #[error("{program} timed out after {elapsed:?}")]
    TimedOut {
        /// Program name
        program: String,
        /// Time the child ran
        elapsed: Duration,
    },

    /// Shutdown was requested; the child was killed
    #[error("{program} cancelled")]
    Cancelled {
        /// Program name
        program: String,
    },

    /// Waiting on the child failed
    #[error("waiting for {program} failed: {source}")]
    Wait {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished child
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status
    pub status: ExitStatus,
    /// Tail of standard output
    pub stdout: String,
    /// Tail of standard error
    pub stderr: String,
    /// Wall time
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Whether the child exited with status 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Short failure description: exit code plus the last stderr line
    pub fn failure_summary(&self) -> String {
        let code = self
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("exit {code}: {}", line.trim()),
            None => format!("exit {code}"),
        }
    }
}

/// Run `command` to completion, killing it on deadline or shutdown
pub fn run(
    mut command: Command,
    deadline: Option<Instant>,
    shutdown: &ShutdownCoordinator,
) -> Result<CommandOutput, ProcessError> {
    let program = command.get_program().to_string_lossy().into_owned();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    if shutdown.is_shutdown_requested() {
        return Err(ProcessError::Cancelled { program });
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!(program = %program, pid = child.id(), "Spawned external process");

    // Drain pipes on their own threads so a chatty child never blocks on a full pipe
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill_and_reap(&mut child, &program);
                return Err(ProcessError::Wait { program, source });
            }
        }

        if shutdown.is_shutdown_requested() {
            warn!(program = %program, "Shutdown requested; killing external process");
            kill_and_reap(&mut child, &program);
            return Err(ProcessError::Cancelled { program });
        }

        let now = Instant::now();
        let mut wait = POLL_INTERVAL;
        if let Some(deadline) = deadline {
            if now >= deadline {
                warn!(program = %program, elapsed_ms = started.elapsed().as_millis() as u64, "Deadline passed; killing external process");
                kill_and_reap(&mut child, &program);
                return Err(ProcessError::TimedOut {
                    program,
                    elapsed: started.elapsed(),
                });
            }
            wait = wait.min(deadline - now);
        }
        shutdown.sleep(wait);
    };

    // Anything still in the group holds the pipes open
    kill_group(child.id(), &program);
    let now = Instant::now();
    let mut collect_until = now + OUTPUT_GRACE;
    if let Some(deadline) = deadline {
        collect_until = collect_until.min(deadline.max(now + MIN_OUTPUT_WAIT));
    }
    let output = CommandOutput {
        status,
        stdout: collect_output(stdout, collect_until, &program),
        stderr: collect_output(stderr, collect_until, &program),
        elapsed: started.elapsed(),
    };
    debug!(
        program = %program,
        success = output.success(),
        elapsed_ms = output.elapsed.as_millis() as u64,
        "External process finished"
    );
    Ok(output)
}

#[cfg(unix)]
fn kill_group(pid: u32, program: &str) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: signalling a process group id has no memory-safety requirements
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        debug!(program, pgid, "Killed external process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32, _program: &str) {}

fn kill_and_reap(child: &mut Child, program: &str) {
    kill_group(child.id(), program);
    if let Err(e) = child.kill() {
        debug!(program, error = %e, "Kill failed (process may have exited)");
    }
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let mut tail: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > OUTPUT_TAIL_BYTES * 2 {
                        tail.drain(..tail.len() - OUTPUT_TAIL_BYTES);
                    }
                }
            }
        }
        if tail.len() > OUTPUT_TAIL_BYTES {
            tail.drain(..tail.len() - OUTPUT_TAIL_BYTES);
        }
        let _ = tx.send(String::from_utf8_lossy(&tail).into_owned());
    });
    rx
}

fn collect_output(reader: Option<Receiver<String>>, until: Instant, program: &str) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    match reader.recv_deadline(until) {
        Ok(output) => output,
        Err(_) => {
            warn!(program, "Output pipe still held open after exit; dropping captured output");
            String::new()
        }
    }
}
