use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::credentials::Credential;
use crate::defaults;
use crate::error::{Error, Result};
use crate::target::Target;
use crate::transport::process::run_with_timeout;
use crate::transport::{CommandOutput, RunError, Session, Transport};

/// Connection parameters shared by the master connection and every command.
#[derive(Debug, Clone)]
pub struct SshClient {
    pub host: String,
    pub destination: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl SshClient {
    pub fn new(target: &Target, credential: &Credential, connect_timeout_secs: u64) -> Self {
        let identity_file = match credential {
            Credential::IdentityFile(path) => Some(path.clone()),
            Credential::Agent => None,
        };

        Self {
            host: target.host.clone(),
            destination: target.destination(),
            port: target.port,
            identity_file,
            connect_timeout_secs,
        }
    }

    fn base_args(&self, control_path: &Path) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.to_string_lossy().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Never prompt; fail fast on dead links instead of hanging.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
        ]);

        args
    }

    /// `ssh -M -N`: the master connection that owns the session.
    pub fn master_args(&self, control_path: &Path) -> Vec<String> {
        let mut args = self.base_args(control_path);
        args.extend([
            "-M".to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "ControlPersist=no".to_string(),
            self.destination.clone(),
        ]);
        args
    }

    /// Command multiplexed over an existing master.
    pub fn command_args(&self, control_path: &Path, command: &str) -> Vec<String> {
        let mut args = self.base_args(control_path);
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            self.destination.clone(),
            command.to_string(),
        ]);
        args
    }

    /// `ssh -O <op>` against the control socket (`check`, `exit`).
    pub fn control_args(&self, control_path: &Path, op: &str) -> Vec<String> {
        let mut args = self.base_args(control_path);
        args.extend(["-O".to_string(), op.to_string(), self.destination.clone()]);
        args
    }
}

/// Opens one multiplexed SSH master connection per session.
#[derive(Debug, Clone)]
pub struct SshTransport {
    output_cap: usize,
    connect_timeout_secs: u64,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(output_cap: usize) -> Self {
        Self {
            output_cap,
            connect_timeout_secs: defaults::SSH_CONNECT_TIMEOUT_SECS,
            control_dir: std::env::temp_dir(),
        }
    }

    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    fn control_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.control_dir.join(format!("rollout-{}.sock", &id[..12]))
    }
}

impl Transport for SshTransport {
    fn open(&self, target: &Target, credential: &Credential) -> Result<Box<dyn Session>> {
        let client = SshClient::new(target, credential, self.connect_timeout_secs);
        let control_path = self.control_path();

        log_status!("ssh", "Opening session to {}", client.destination);

        let mut command = Command::new("ssh");
        command
            .args(client.master_args(&control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // Keep the master out of the terminal's process group so Ctrl-C
        // reaches only the orchestrator, never the connection in use.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut master = command
            .spawn()
            .map_err(|e| Error::ssh_connect_failed(&client.host, -1, format!("SSH error: {}", e)))?;

        let ready_deadline =
            Instant::now() + Duration::from_secs(self.connect_timeout_secs.saturating_add(5));

        loop {
            match master.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(&mut master);
                    return Err(Error::ssh_connect_failed(
                        &client.host,
                        status.code().unwrap_or(-1),
                        stderr,
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    stop_master(&mut master);
                    return Err(Error::ssh_connect_failed(&client.host, -1, e.to_string()));
                }
            }

            if control_ready(&client, &control_path) {
                break;
            }

            if Instant::now() >= ready_deadline {
                stop_master(&mut master);
                return Err(Error::ssh_connect_failed(
                    &client.host,
                    -1,
                    "Timed out waiting for the SSH master connection",
                ));
            }

            std::thread::sleep(Duration::from_millis(100));
        }

        Ok(Box::new(SshSession {
            client,
            master: Some(master),
            control_path,
            output_cap: self.output_cap,
        }))
    }
}

pub struct SshSession {
    client: SshClient,
    master: Option<Child>,
    control_path: PathBuf,
    output_cap: usize,
}

impl Session for SshSession {
    fn run(&mut self, command: &str, timeout: Duration) -> std::result::Result<CommandOutput, RunError> {
        if self.master.is_none() {
            return Err(RunError::Session(Error::ssh_session_failed(
                "Session is already closed",
            )));
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.client.command_args(&self.control_path, command));

        let output = run_with_timeout(cmd, timeout, self.output_cap)?;
        if is_connection_failure(&output) {
            return Err(RunError::Session(Error::ssh_session_failed(format!(
                "SSH connection to {} failed: {}",
                self.client.destination,
                output.stderr.text.trim()
            ))));
        }
        Ok(output)
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };

        let _ = Command::new("ssh")
            .args(self.client.control_args(&self.control_path, "exit"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        stop_master(&mut master);

        if self.control_path.exists() {
            std::fs::remove_file(&self.control_path).map_err(|e| {
                Error::internal_io(e.to_string(), Some("remove SSH control socket".to_string()))
            })?;
        }

        log_status!("ssh", "Closed session to {}", self.client.destination);
        Ok(())
    }
}

fn control_ready(client: &SshClient, control_path: &Path) -> bool {
    Command::new("ssh")
        .args(client.control_args(control_path, "check"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn read_stderr(child: &mut Child) -> String {
    use std::io::Read;

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    stderr.trim().to_string()
}

fn stop_master(master: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(Some(_)) = master.try_wait() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = master.kill();
    let _ = master.wait();
}

/// Exit 255 with a connection-level message means ssh itself failed, not the
/// remote command.
fn is_connection_failure(output: &CommandOutput) -> bool {
    if output.exit_code != 255 {
        return false;
    }

    let stderr = output.stderr.text.to_lowercase();
    let patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by",
        "control socket",
        "mux_client",
    ];

    patterns.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CapturedText;

    fn client() -> SshClient {
        let mut target = Target::new("web-1.example.com", "/srv/app");
        target.user = Some("deploy".to_string());
        target.port = 2222;
        SshClient::new(
            &target,
            &Credential::IdentityFile(PathBuf::from("/keys/deploy")),
            10,
        )
    }

    #[test]
    fn command_args_reuse_control_socket() {
        let args = client().command_args(Path::new("/tmp/rollout-x.sock"), "uptime");
        assert!(args.contains(&"ControlPath=/tmp/rollout-x.sock".to_string()));
        assert!(args.contains(&"ControlMaster=no".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("uptime"));
        let dest = args.iter().position(|a| a == "deploy@web-1.example.com").unwrap();
        assert_eq!(dest, args.len() - 2);
    }

    #[test]
    fn master_args_request_master_without_command() {
        let args = client().master_args(Path::new("/tmp/s.sock"));
        assert!(args.contains(&"-M".to_string()));
        assert!(args.contains(&"-N".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("deploy@web-1.example.com"));
        let port = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port + 1], "2222");
        let identity = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[identity + 1], "/keys/deploy");
    }

    #[test]
    fn control_sockets_are_unique_within_control_dir() {
        let transport = SshTransport::new(1024).with_control_dir("/run/rollout");
        let first = transport.control_path();
        let second = transport.control_path();
        assert!(first.starts_with("/run/rollout"));
        assert!(first.to_string_lossy().ends_with(".sock"));
        assert_ne!(first, second);
    }

    #[test]
    fn agent_credential_passes_no_identity() {
        let target = Target::new("web-1", "/srv");
        let client = SshClient::new(&target, &Credential::Agent, 10);
        let args = client.control_args(Path::new("/tmp/s.sock"), "check");
        assert!(!args.contains(&"-i".to_string()));
        assert!(!args.contains(&"-p".to_string()));
        assert_eq!(&args[args.len() - 3..], ["-O", "check", "web-1"]);
    }

    #[test]
    fn connection_failure_requires_ssh_exit_and_message() {
        let refused = CommandOutput {
            exit_code: 255,
            stdout: CapturedText::default(),
            stderr: CapturedText::from_str_capped("ssh: connect to host x: Connection refused", 1024),
        };
        assert!(is_connection_failure(&refused));

        let remote_255 = CommandOutput {
            exit_code: 255,
            stdout: CapturedText::default(),
            stderr: CapturedText::from_str_capped("build script exploded", 1024),
        };
        assert!(!is_connection_failure(&remote_255));

        let ordinary = CommandOutput {
            exit_code: 1,
            stdout: CapturedText::default(),
            stderr: CapturedText::from_str_capped("connection refused", 1024),
        };
        assert!(!is_connection_failure(&ordinary));
    }
}
