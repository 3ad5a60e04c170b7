//! Child process execution with a deadline and bounded capture.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::capture::TailBuffer;
use super::{CapturedText, CommandOutput, RunError};
use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

type SharedBuffer = Arc<Mutex<TailBuffer>>;

/// Spawn `command`, wait for it until `timeout`, and capture both streams.
///
/// On timeout the whole process group is killed and the output captured so far
/// is returned inside `RunError::Timeout`.
pub fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    cap: usize,
) -> std::result::Result<CommandOutput, RunError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let started = Instant::now();
    let deadline = started.checked_add(timeout);

    let mut child = command.spawn().map_err(|e| {
        RunError::Session(Error::ssh_session_failed(format!(
            "Failed to spawn command: {}",
            e
        )))
    })?;

    let stdout: SharedBuffer = Arc::new(Mutex::new(TailBuffer::new(cap)));
    let stderr: SharedBuffer = Arc::new(Mutex::new(TailBuffer::new(cap)));
    let readers = vec![
        spawn_reader(child.stdout.take(), Arc::clone(&stdout)),
        spawn_reader(child.stderr.take(), Arc::clone(&stderr)),
    ];

    let past_deadline = |now: Instant| deadline.is_some_and(|d| now >= d);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill_process_group(&mut child);
                return Err(RunError::Session(Error::ssh_session_failed(format!(
                    "Failed to wait for command: {}",
                    e
                ))));
            }
        }

        if past_deadline(Instant::now()) {
            kill_process_group(&mut child);
            return Err(RunError::Timeout {
                elapsed: started.elapsed(),
                output: CommandOutput {
                    exit_code: -1,
                    stdout: snapshot(&stdout),
                    stderr: snapshot(&stderr),
                },
            });
        }

        thread::sleep(POLL_INTERVAL);
    };

    // Background children may hold the pipes open after the command exits;
    // wait for the readers only until the command's own deadline.
    while readers.iter().flatten().any(|h| !h.is_finished()) && !past_deadline(Instant::now()) {
        thread::sleep(POLL_INTERVAL);
    }

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: snapshot(&stdout),
        stderr: snapshot(&stderr),
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
    buffer: SharedBuffer,
) -> Option<JoinHandle<()>> {
    let mut source = source?;
    Some(thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(&chunk[..n]),
            }
        }
    }))
}

fn snapshot(buffer: &SharedBuffer) -> CapturedText {
    buffer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .snapshot()
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            // SAFETY: signalling a process group we created; no memory is touched.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let output = run_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            1024,
        )
        .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.text, "out\n");
        assert_eq!(output.stderr.text, "err\n");
    }

    #[test]
    fn times_out_and_keeps_partial_output() {
        let started = Instant::now();
        let result = run_with_timeout(
            sh("echo started; sleep 5"),
            Duration::from_millis(300),
            1024,
        );
        assert!(started.elapsed() < Duration::from_secs(4));
        match result {
            Err(RunError::Timeout { output, .. }) => {
                assert_eq!(output.stdout.text, "started\n");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn noisy_output_is_truncated() {
        let output = run_with_timeout(
            sh("i=0; while [ $i -lt 200 ]; do echo line-$i; i=$((i+1)); done"),
            Duration::from_secs(10),
            64,
        )
        .unwrap();
        assert!(output.stdout.truncated);
        assert!(output.stdout.text.starts_with("[... "));
        assert!(output.stdout.text.ends_with("line-199\n"));
    }
}
