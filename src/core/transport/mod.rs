//! Remote command transport.
//!
//! A `Transport` opens one `Session` per run. The session is exclusively owned
//! by the run that opened it and is wrapped in a `SessionGuard`, which closes
//! it on every exit path.

pub mod capture;
pub mod local;
pub(crate) mod process;

use std::sync::Arc;
use std::time::Duration;

use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::ssh::SshTransport;
use crate::target::Target;

pub use capture::{CapturedText, TailBuffer};
pub use local::LocalTransport;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: CapturedText,
    pub stderr: CapturedText,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a command produced no exit status.
#[derive(Debug, Clone)]
pub enum RunError {
    /// Deadline passed; the command was killed. Output captured so far is kept.
    Timeout {
        elapsed: Duration,
        output: CommandOutput,
    },
    /// The session itself failed (spawn error, dropped connection).
    Session(Error),
}

impl RunError {
    pub fn message(&self) -> String {
        match self {
            RunError::Timeout { elapsed, .. } => {
                format!("Command timed out after {:.1}s", elapsed.as_secs_f64())
            }
            RunError::Session(err) => err.message.clone(),
        }
    }
}

pub trait Session: Send {
    /// Run one command, enforcing `timeout`.
    fn run(&mut self, command: &str, timeout: Duration) -> std::result::Result<CommandOutput, RunError>;

    /// Release the session. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

pub trait Transport: Send + Sync {
    /// Open a session to `target`. Failure here is a hard `ssh.connect_failed`.
    fn open(&self, target: &Target, credential: &Credential) -> Result<Box<dyn Session>>;
}

/// Scoped session ownership: closes the session when dropped.
pub struct SessionGuard {
    session: Box<dyn Session>,
    label: String,
    closed: bool,
}

impl SessionGuard {
    pub fn new(session: Box<dyn Session>, label: impl Into<String>) -> Self {
        Self {
            session,
            label: label.into(),
            closed: false,
        }
    }

    pub fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.close()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log_status!("ssh", "Failed to close session to {}: {}", self.label, err);
        }
    }
}

/// Routes localhost targets to local execution and everything else to SSH.
pub struct DefaultTransport {
    local: LocalTransport,
    ssh: SshTransport,
}

impl DefaultTransport {
    pub fn new(output_cap: usize) -> Self {
        Self {
            local: LocalTransport::new(output_cap),
            ssh: SshTransport::new(output_cap),
        }
    }

    pub fn shared(output_cap: usize) -> Arc<dyn Transport> {
        Arc::new(Self::new(output_cap))
    }
}

impl Transport for DefaultTransport {
    fn open(&self, target: &Target, credential: &Credential) -> Result<Box<dyn Session>> {
        if target.is_local() {
            log_status!(
                "ssh",
                "Target '{}' is localhost, using local execution",
                target.label()
            );
            return self.local.open(target, credential);
        }
        self.ssh.open(target, credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSession {
        closes: Arc<AtomicUsize>,
    }

    impl Session for CountingSession {
        fn run(&mut self, _command: &str, _timeout: Duration) -> std::result::Result<CommandOutput, RunError> {
            Ok(CommandOutput::default())
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn guard_closes_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let _guard = SessionGuard::new(
                Box::new(CountingSession { closes: Arc::clone(&closes) }),
                "web-1",
            );
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_close_is_not_repeated_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = SessionGuard::new(
            Box::new(CountingSession { closes: Arc::clone(&closes) }),
            "web-1",
        );
        guard.close().unwrap();
        guard.close().unwrap();
        drop(guard);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_error_messages() {
        let timeout = RunError::Timeout {
            elapsed: Duration::from_millis(2500),
            output: CommandOutput::default(),
        };
        assert_eq!(timeout.message(), "Command timed out after 2.5s");
        let session = RunError::Session(Error::ssh_session_failed("connection reset"));
        assert_eq!(session.message(), "connection reset");
    }
}
