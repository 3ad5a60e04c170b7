//! Local execution for localhost targets.

use std::process::Command;
use std::time::Duration;

use super::process::run_with_timeout;
use super::{CommandOutput, RunError, Session, Transport};
use crate::credentials::Credential;
use crate::error::Result;
use crate::target::Target;

#[derive(Debug, Clone)]
pub struct LocalTransport {
    output_cap: usize,
}

impl LocalTransport {
    pub fn new(output_cap: usize) -> Self {
        Self { output_cap }
    }
}

impl Transport for LocalTransport {
    fn open(&self, _target: &Target, _credential: &Credential) -> Result<Box<dyn Session>> {
        Ok(Box::new(LocalSession {
            output_cap: self.output_cap,
        }))
    }
}

pub struct LocalSession {
    output_cap: usize,
}

impl Session for LocalSession {
    fn run(&mut self, command: &str, timeout: Duration) -> std::result::Result<CommandOutput, RunError> {
        #[cfg(windows)]
        let cmd = {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        };

        #[cfg(not(windows))]
        let cmd = {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };

        run_with_timeout(cmd, timeout, self.output_cap)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn local_session_runs_shell_commands() {
        let transport = LocalTransport::new(1024);
        let target = Target::new("localhost", "/tmp");
        let mut session = transport.open(&target, &Credential::Agent).unwrap();

        let output = session
            .run("printf '%s' \"$((2 + 3))\"", Duration::from_secs(5))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.text, "5");
        session.close().unwrap();
    }
}
