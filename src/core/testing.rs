//! Deterministic stand-ins for the transport, clock and probe checker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::credentials::{Credential, CredentialProvider};
use crate::error::{Error, Result};
use crate::health::{Probe, ProbeChecker, ProbeObservation, ProbeScope};
use crate::target::Target;
use crate::transport::{CapturedText, CommandOutput, RunError, Session, Transport};

#[derive(Debug, Clone)]
pub enum Reply {
    Exit(i32, &'static str),
    /// Exit 0 after printing this many bytes; the session keeps at most 1 KiB.
    Flood(usize),
    Timeout,
    SessionLost,
}

#[derive(Default)]
pub struct ScriptState {
    rules: Vec<(String, VecDeque<Reply>)>,
    pub commands: Vec<String>,
    pub opens: usize,
    pub closes: usize,
    pub fail_open: bool,
    cancel_on: Option<(String, CancelToken, bool)>,
}

impl ScriptState {
    fn reply_for(&mut self, command: &str) -> Reply {
        for (needle, replies) in self.rules.iter_mut() {
            if command.contains(needle.as_str()) {
                if replies.len() > 1 {
                    if let Some(reply) = replies.pop_front() {
                        return reply;
                    }
                }
                if let Some(reply) = replies.front() {
                    return reply.clone();
                }
            }
        }
        Reply::Exit(0, "")
    }
}

/// Replies are matched by substring; the last reply in a queue repeats.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, replies: Vec<Reply>) -> Self {
        self.state
            .lock()
            .unwrap()
            .rules
            .push((needle.to_string(), replies.into_iter().collect()));
        self
    }

    pub fn failing_open(self) -> Self {
        self.state.lock().unwrap().fail_open = true;
        self
    }

    /// Trip `token` when a command containing `needle` runs.
    pub fn cancel_when(self, needle: &str, token: &CancelToken, with_rollback: bool) -> Self {
        self.state.lock().unwrap().cancel_on =
            Some((needle.to_string(), token.clone(), with_rollback));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn opens_and_closes(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.opens, state.closes)
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, target: &Target, _credential: &Credential) -> Result<Box<dyn Session>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(Error::ssh_connect_failed(&target.host, 255, "Connection refused"));
        }
        state.opens += 1;
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct ScriptedSession {
    state: Arc<Mutex<ScriptState>>,
}

impl Session for ScriptedSession {
    fn run(&mut self, command: &str, timeout: Duration) -> std::result::Result<CommandOutput, RunError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        if let Some((needle, token, with_rollback)) = &state.cancel_on {
            if command.contains(needle.as_str()) {
                if *with_rollback {
                    token.cancel_with_rollback();
                } else {
                    token.cancel();
                }
            }
        }

        match state.reply_for(command) {
            Reply::Exit(code, stdout) => Ok(CommandOutput {
                exit_code: code,
                stdout: CapturedText::from_str_capped(stdout, 1024),
                stderr: if code == 0 {
                    CapturedText::default()
                } else {
                    CapturedText::from_str_capped("error: command failed\n", 1024)
                },
            }),
            Reply::Flood(bytes) => Ok(CommandOutput {
                exit_code: 0,
                stdout: CapturedText::from_str_capped(&"x".repeat(bytes), 1024),
                stderr: CapturedText::default(),
            }),
            Reply::Timeout => Err(RunError::Timeout {
                elapsed: timeout,
                output: CommandOutput {
                    exit_code: -1,
                    stdout: CapturedText::from_str_capped("partial\n", 1024),
                    stderr: CapturedText::default(),
                },
            }),
            Reply::SessionLost => Err(RunError::Session(Error::ssh_session_failed(
                "connection reset by peer",
            ))),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Virtual time: `sleep` advances `now` instantly and is recorded.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock().unwrap() += duration;
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Satisfies a probe on its Nth check (1-based); probes not listed never match.
#[derive(Default)]
pub struct ScriptedChecker {
    satisfy_on: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn satisfy(mut self, label: &str, on_check: u32) -> Self {
        self.satisfy_on.insert(label.to_string(), on_check);
        self
    }

    pub fn calls(&self, label: &str) -> u32 {
        self.calls.lock().unwrap().get(label).copied().unwrap_or(0)
    }
}

impl ProbeChecker for ScriptedChecker {
    fn check(&self, probe: &Probe, _scope: &mut ProbeScope<'_>) -> ProbeObservation {
        let label = probe.label();
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(label.clone()).or_insert(0);
        *count += 1;

        let satisfied = self.satisfy_on.get(&label).is_some_and(|n| *count >= *n);
        ProbeObservation {
            satisfied,
            detail: if satisfied { "matched".into() } else { "not yet".into() },
        }
    }
}

/// Resolves every reference to the agent.
pub struct AgentCredentials;

impl CredentialProvider for AgentCredentials {
    fn resolve(&self, _credential_ref: Option<&str>) -> Result<Credential> {
        Ok(Credential::Agent)
    }
}
