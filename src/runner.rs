//! Shell command execution with a hard timeout

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

/// Reported when a command outlives its timeout (same as coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Reported when the process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long to keep draining output after the process has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Result of a finished (or killed) command. A non-zero exit code is a
/// normal outcome for the caller to inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout and stderr interleaved, trailing whitespace trimmed
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs every command with the same timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, command: &str, working_dir: &Path) -> CommandOutput {
        run(command, working_dir, self.timeout).await
    }
}

/// Quote `value` as a single POSIX shell word.
pub fn quote(value: impl AsRef<str>) -> String {
    format!("'{}'", value.as_ref().replace('\'', r"'\''"))
}

/// Run `command` through `sh -c` inside `working_dir`.
///
/// The command runs in its own process group. Once `limit` elapses the
/// whole group is killed, including anything the shell started, and
/// whatever was printed up to that point is returned with
/// [`TIMEOUT_EXIT_CODE`].
pub async fn run(command: &str, working_dir: &Path, limit: Duration) -> CommandOutput {
    debug!("Running (cwd = '{}'): {}", working_dir.display(), command);

    // stderr is folded into stdout by the shell so the two stay interleaved
    let mut shell = Command::new("sh");
    shell
        .arg("-c")
        .arg(format!("exec 2>&1\n{}", command))
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    shell.process_group(0);
    let spawned = shell.spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!("Command failed to start: {}", e);
            return CommandOutput {
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                output: format!("failed to start '{}': {}", command, e),
                timed_out: false,
            };
        }
    };

    let captured = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mut reader = child.stdout.take().map(|mut stdout| {
        let sink = Arc::clone(&captured);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut out) = sink.lock() {
                            out.extend_from_slice(&buf[..n]);
                        }
                    }
                }
            }
        })
    });

    let waited = timeout(limit, child.wait()).await;
    let (exit_code, timed_out) = match waited {
        Ok(Ok(status)) => {
            // background children may hold the pipe open past our exit
            if let Some(handle) = reader.as_mut() {
                let _ = timeout(OUTPUT_DRAIN_GRACE, handle).await;
            }
            (exit_code_of(status), false)
        }
        Ok(Err(e)) => {
            warn!("Failed waiting for command: {}", e);
            (SPAWN_FAILURE_EXIT_CODE, false)
        }
        Err(_) => {
            warn!("Command timed out after {:?}: {}", limit, command);
            kill_process_group(&child);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out command: {}", e);
            }
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    if let Some(handle) = reader {
        handle.abort();
    }

    let output = captured
        .lock()
        .map(|bytes| String::from_utf8_lossy(&bytes).trim_end().to_string())
        .unwrap_or_default();

    debug!("Command exited with {}", exit_code);
    CommandOutput {
        exit_code,
        output,
        timed_out,
    }
}

/// SIGKILL every process in the child's group. The child was made group
/// leader at spawn, so its pid is the group id.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!("Failed to kill process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| signal_exit_code(&status))
        .unwrap_or(-1)
}

#[cfg(unix)]
fn signal_exit_code(status: &ExitStatus) -> Option<i32> {
    status.signal().map(|signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &ExitStatus) -> Option<i32> {
    None
}
