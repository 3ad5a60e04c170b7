//! Post-deployment health probes.
//!
//! The monitor polls every probe on its own interval until each has matched at
//! least once or the shared deadline passes. A deadline expiry is reported as
//! `timed-out` with the probes that never matched; it is never treated as
//! success.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::clock::{millis, seconds, Clock};
use crate::defaults;
use crate::error::{Error, Result};
use crate::target::Target;
use crate::transport::{RunError, Session};
use crate::utils::shell;
use crate::utils::template::{self, Variables};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeType {
    HttpStatus,
    OutputPattern,
    ProcessPresence,
}

impl ProbeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeType::HttpStatus => "http-status",
            ProbeType::OutputPattern => "output-pattern",
            ProbeType::ProcessPresence => "process-presence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    /// URL or path for `http-status`, regex for `output-pattern`, process
    /// pattern for `process-presence`.
    pub target: String,
    #[serde(default = "defaults::probe_interval_seconds")]
    pub interval_seconds: f64,
    #[serde(default = "defaults::probe_max_wait_seconds")]
    pub max_wait_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<u16>,
    /// Command whose stdout an `output-pattern` probe matches against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Probe {
    pub fn new(probe_type: ProbeType, target: impl Into<String>) -> Self {
        Self {
            name: None,
            probe_type,
            target: target.into(),
            interval_seconds: defaults::probe_interval_seconds(),
            max_wait_seconds: defaults::probe_max_wait_seconds(),
            expect_status: None,
            command: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn timing(mut self, interval_seconds: f64, max_wait_seconds: f64) -> Self {
        self.interval_seconds = interval_seconds;
        self.max_wait_seconds = max_wait_seconds;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{} {}", self.probe_type.as_str(), self.target),
        }
    }

    pub fn interval(&self) -> Duration {
        seconds(self.interval_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait_seconds)
    }

    pub(crate) fn collect_problems(&self, field: &str, problems: &mut Vec<String>) {
        if self.target.trim().is_empty() {
            problems.push(format!("{}.target must not be empty", field));
        }
        if !within_health_bound(self.interval_seconds) {
            problems.push(format!(
                "{}.intervalSeconds must be a positive number of at most {}",
                field,
                defaults::MAX_HEALTH_WAIT_SECS
            ));
        }
        if !within_health_bound(self.max_wait_seconds) {
            problems.push(format!(
                "{}.maxWaitSeconds must be a positive number of at most {}",
                field,
                defaults::MAX_HEALTH_WAIT_SECS
            ));
        }
        match self.probe_type {
            ProbeType::OutputPattern => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    problems.push(format!("{}.command is required for output-pattern probes", field));
                }
                if let Err(e) = Regex::new(&self.target) {
                    problems.push(format!("{}.target is not a valid regex: {}", field, e));
                }
            }
            ProbeType::HttpStatus | ProbeType::ProcessPresence => {}
        }
    }
}

/// Positive, finite and no longer than the health wait ceiling.
pub(crate) fn within_health_bound(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= defaults::MAX_HEALTH_WAIT_SECS
}

/// What a probe needs from the run while checking.
pub struct ProbeScope<'s> {
    pub session: &'s mut dyn Session,
    pub target: &'s Target,
    pub variables: &'s Variables,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeObservation {
    pub satisfied: bool,
    pub detail: String,
}

impl ProbeObservation {
    fn new(satisfied: bool, detail: impl Into<String>) -> Self {
        Self {
            satisfied,
            detail: detail.into(),
        }
    }
}

pub trait ProbeChecker: Send + Sync {
    fn check(&self, probe: &Probe, scope: &mut ProbeScope<'_>) -> ProbeObservation;
}

/// HTTP probes over `reqwest`; pattern and process probes over the run's session.
pub struct DefaultProbeChecker {
    http: reqwest::blocking::Client,
}

impl DefaultProbeChecker {
    pub fn new() -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("rollout/{}", env!("CARGO_PKG_VERSION")))
            .timeout(seconds(defaults::PROBE_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;
        Ok(Self { http })
    }

    fn check_http(&self, probe: &Probe, scope: &ProbeScope<'_>) -> ProbeObservation {
        let url = resolve_url(scope.target, &template::render_raw(&probe.target, scope.variables));
        let expected = probe.expect_status.unwrap_or_else(defaults::http_expect_status);

        match self.http.get(&url).send() {
            Ok(response) => {
                let status = response.status().as_u16();
                ProbeObservation::new(status == expected, format!("HTTP {} from {}", status, url))
            }
            Err(e) => ProbeObservation::new(false, format!("GET {} failed: {}", url, e)),
        }
    }

    fn check_command(&self, probe: &Probe, command: &str, scope: &mut ProbeScope<'_>) -> ProbeObservation {
        let timeout = probe
            .interval()
            .max(Duration::from_secs(1))
            .min(seconds(defaults::PROBE_COMMAND_TIMEOUT_SECS));

        let output = match scope.session.run(command, timeout) {
            Ok(output) => output,
            Err(RunError::Timeout { .. }) => {
                return ProbeObservation::new(false, "probe command timed out");
            }
            Err(RunError::Session(err)) => return ProbeObservation::new(false, err.message),
        };

        match probe.probe_type {
            ProbeType::ProcessPresence => {
                if output.success() {
                    ProbeObservation::new(true, format!("process '{}' running", probe.target))
                } else {
                    ProbeObservation::new(false, format!("process '{}' not found", probe.target))
                }
            }
            _ => match Regex::new(&probe.target) {
                Ok(re) => {
                    let matched = re.is_match(&output.stdout.text);
                    let detail = if matched {
                        format!("pattern '{}' matched", probe.target)
                    } else {
                        format!("pattern '{}' not found (exit {})", probe.target, output.exit_code)
                    };
                    ProbeObservation::new(matched, detail)
                }
                Err(e) => ProbeObservation::new(false, format!("invalid pattern: {}", e)),
            },
        }
    }
}

impl ProbeChecker for DefaultProbeChecker {
    fn check(&self, probe: &Probe, scope: &mut ProbeScope<'_>) -> ProbeObservation {
        match probe.probe_type {
            ProbeType::HttpStatus => self.check_http(probe, scope),
            ProbeType::ProcessPresence => {
                let pattern = template::render_raw(&probe.target, scope.variables);
                let command = format!("pgrep -f {} >/dev/null", shell::quote_arg(&pattern));
                self.check_command(probe, &command, scope)
            }
            ProbeType::OutputPattern => {
                let template = probe.command.as_deref().unwrap_or_default();
                match template::render(template, scope.variables, "probes.command") {
                    Ok(command) => {
                        let command = shell::in_directory(&scope.target.working_directory, &command);
                        self.check_command(probe, &command, scope)
                    }
                    Err(err) => ProbeObservation::new(false, err.message),
                }
            }
        }
    }
}

/// Join relative probe paths to the target's health base URL.
pub fn resolve_url(target: &Target, probe_target: &str) -> String {
    if probe_target.starts_with("http://") || probe_target.starts_with("https://") {
        return probe_target.to_string();
    }
    let path = probe_target.trim_start_matches('/');
    format!("{}/{}", target.health_base(), path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    Ok,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub name: String,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    pub target: String,
    pub satisfied: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satisfied_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOutcome {
    pub status: HealthStatus,
    pub elapsed_ms: u64,
    pub probes: Vec<ProbeResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsatisfied: Vec<String>,
}

impl HealthOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

struct ProbeState {
    next_due: Instant,
    expires: Instant,
    attempts: u32,
    satisfied_after: Option<Duration>,
    last: Option<String>,
}

pub struct HealthMonitor<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancelToken,
}

impl<'a> HealthMonitor<'a> {
    pub fn new(clock: &'a dyn Clock, cancel: &'a CancelToken) -> Self {
        Self { clock, cancel }
    }

    /// Poll `probes` until all have matched once, or `deadline` passes.
    pub fn await_healthy(
        &self,
        probes: &[Probe],
        deadline: Duration,
        checker: &dyn ProbeChecker,
        scope: &mut ProbeScope<'_>,
    ) -> HealthOutcome {
        let start = self.clock.now();
        let ceiling = seconds(defaults::MAX_HEALTH_WAIT_SECS);
        let overall = start.checked_add(deadline.min(ceiling)).unwrap_or(start);

        let mut states: Vec<ProbeState> = probes
            .iter()
            .map(|probe| ProbeState {
                next_due: start,
                expires: start.checked_add(probe.max_wait()).unwrap_or(overall).min(overall),
                attempts: 0,
                satisfied_after: None,
                last: None,
            })
            .collect();

        log_status!("health", "Waiting for {} probe(s)", probes.len());

        let status = loop {
            if states.iter().all(|s| s.satisfied_after.is_some()) {
                break HealthStatus::Ok;
            }
            if self.cancel.is_cancelled() {
                break HealthStatus::Cancelled;
            }

            let now = self.clock.now();
            for (probe, state) in probes.iter().zip(states.iter_mut()) {
                if state.satisfied_after.is_some() || state.next_due > now || now >= state.expires {
                    continue;
                }

                let observation = checker.check(probe, scope);
                state.attempts += 1;
                let checked_at = self.clock.now();

                if observation.satisfied {
                    state.satisfied_after = Some(checked_at.saturating_duration_since(start));
                    log_status!("health", "{}: {}", probe.label(), observation.detail);
                } else {
                    state.next_due = checked_at
                        .checked_add(probe.interval())
                        .unwrap_or(state.expires);
                }
                state.last = Some(observation.detail);
            }

            if states.iter().all(|s| s.satisfied_after.is_some()) {
                break HealthStatus::Ok;
            }

            let next_wake = states
                .iter()
                .filter(|s| s.satisfied_after.is_none() && s.next_due < s.expires)
                .map(|s| s.next_due)
                .min();

            let Some(wake) = next_wake else {
                break HealthStatus::TimedOut;
            };

            let now = self.clock.now();
            if wake > now {
                self.clock.sleep(wake - now);
            }
        };

        let results: Vec<ProbeResult> = probes
            .iter()
            .zip(states.iter())
            .map(|(probe, state)| ProbeResult {
                name: probe.label(),
                probe_type: probe.probe_type,
                target: probe.target.clone(),
                satisfied: state.satisfied_after.is_some(),
                attempts: state.attempts,
                last_observation: state.last.clone(),
                satisfied_after_ms: state.satisfied_after.map(millis),
            })
            .collect();

        let unsatisfied: Vec<String> = results
            .iter()
            .filter(|r| !r.satisfied)
            .map(|r| r.name.clone())
            .collect();

        let elapsed_ms = millis(self.clock.now().saturating_duration_since(start));
        match status {
            HealthStatus::Ok => log_status!("health", "All probes satisfied"),
            HealthStatus::TimedOut => log_status!(
                "health",
                "Deadline passed; unsatisfied: {}",
                unsatisfied.join(", ")
            ),
            HealthStatus::Cancelled => log_status!("health", "Cancelled while waiting"),
        }

        HealthOutcome {
            status,
            elapsed_ms,
            probes: results,
            unsatisfied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::core::testing::{ManualClock, Reply, ScriptedChecker, ScriptedTransport};
    use crate::transport::Transport;

    fn probes() -> Vec<Probe> {
        vec![
            Probe::new(ProbeType::HttpStatus, "/health")
                .named("P1")
                .timing(5.0, 60.0),
            Probe::new(ProbeType::ProcessPresence, "app-server")
                .named("P2")
                .timing(10.0, 60.0),
        ]
    }

    fn await_with(checker: &ScriptedChecker, clock: &ManualClock, probes: &[Probe], deadline: Duration) -> HealthOutcome {
        let transport = ScriptedTransport::new();
        let target = Target::new("web-1", "/srv/app");
        let mut session = transport.open(&target, &Credential::Agent).unwrap();
        let variables = Variables::new();
        let mut scope = ProbeScope {
            session: session.as_mut(),
            target: &target,
            variables: &variables,
        };
        let cancel = CancelToken::new();
        HealthMonitor::new(clock, &cancel).await_healthy(probes, deadline, checker, &mut scope)
    }

    #[test]
    fn ok_when_every_probe_matches_before_deadline() {
        let checker = ScriptedChecker::new().satisfy("P1", 3).satisfy("P2", 2);
        let clock = ManualClock::new();
        let outcome = await_with(&checker, &clock, &probes(), Duration::from_secs(60));

        assert_eq!(outcome.status, HealthStatus::Ok);
        assert!(outcome.unsatisfied.is_empty());
        assert_eq!(outcome.probes[0].attempts, 3);
        assert_eq!(outcome.probes[0].satisfied_after_ms, Some(10_000));
        assert_eq!(outcome.probes[1].attempts, 2);
        assert_eq!(outcome.probes[1].satisfied_after_ms, Some(10_000));
    }

    #[test]
    fn satisfied_probe_is_not_polled_again() {
        let checker = ScriptedChecker::new().satisfy("P1", 1).satisfy("P2", 4);
        let clock = ManualClock::new();
        let outcome = await_with(&checker, &clock, &probes(), Duration::from_secs(60));

        assert!(outcome.is_ok());
        assert_eq!(checker.calls("P1"), 1);
        assert_eq!(checker.calls("P2"), 4);
    }

    #[test]
    fn timed_out_lists_the_probe_that_never_matched() {
        let checker = ScriptedChecker::new().satisfy("P1", 1);
        let clock = ManualClock::new();
        let outcome = await_with(&checker, &clock, &probes(), Duration::from_secs(30));

        assert_eq!(outcome.status, HealthStatus::TimedOut);
        assert_eq!(outcome.unsatisfied, vec!["P2".to_string()]);
        assert!(outcome.probes[0].satisfied);
        assert_eq!(outcome.probes[1].attempts, 3);
        assert!(clock.elapsed() <= Duration::from_secs(30));
    }

    #[test]
    fn probe_stops_after_its_own_max_wait() {
        let probe = Probe::new(ProbeType::HttpStatus, "/ready")
            .named("short")
            .timing(5.0, 12.0);
        let checker = ScriptedChecker::new();
        let clock = ManualClock::new();
        let outcome = await_with(&checker, &clock, &[probe], Duration::from_secs(120));

        assert_eq!(outcome.status, HealthStatus::TimedOut);
        assert_eq!(checker.calls("short"), 3);
    }

    #[test]
    fn huge_interval_times_out_after_one_check() {
        let probe = Probe::new(ProbeType::HttpStatus, "/health")
            .named("slow")
            .timing(1e19, 60.0);
        let checker = ScriptedChecker::new();
        let clock = ManualClock::new();
        let outcome = await_with(&checker, &clock, &[probe], Duration::MAX);

        assert_eq!(outcome.status, HealthStatus::TimedOut);
        assert_eq!(outcome.unsatisfied, vec!["slow".to_string()]);
        assert_eq!(checker.calls("slow"), 1);
    }

    #[test]
    fn cancellation_ends_polling() {
        let checker = ScriptedChecker::new();
        let clock = ManualClock::new();
        let transport = ScriptedTransport::new();
        let target = Target::new("web-1", "/srv");
        let mut session = transport.open(&target, &Credential::Agent).unwrap();
        let variables = Variables::new();
        let mut scope = ProbeScope {
            session: session.as_mut(),
            target: &target,
            variables: &variables,
        };
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = HealthMonitor::new(&clock, &cancel).await_healthy(
            &probes(),
            Duration::from_secs(60),
            &checker,
            &mut scope,
        );
        assert_eq!(outcome.status, HealthStatus::Cancelled);
        assert_eq!(outcome.unsatisfied.len(), 2);
    }

    #[test]
    fn default_checker_runs_process_and_pattern_probes_over_session() {
        let transport = ScriptedTransport::new()
            .on("pgrep", vec![Reply::Exit(1, ""), Reply::Exit(0, "")])
            .on("tail", vec![Reply::Exit(0, "INFO listening on :8080\n")]);
        let target = Target::new("web-1", "/srv");
        let mut session = transport.open(&target, &Credential::Agent).unwrap();
        let variables = Variables::new();
        let mut scope = ProbeScope {
            session: session.as_mut(),
            target: &target,
            variables: &variables,
        };
        let checker = DefaultProbeChecker::new().unwrap();

        let process = Probe::new(ProbeType::ProcessPresence, "node server.js");
        assert!(!checker.check(&process, &mut scope).satisfied);
        assert!(checker.check(&process, &mut scope).satisfied);

        let pattern = Probe::new(ProbeType::OutputPattern, r"listening on :\d+")
            .with_command("tail -n 50 /var/log/app.log");
        assert!(checker.check(&pattern, &mut scope).satisfied);

        assert!(transport.commands()[0].contains("pgrep -f 'node server.js'"));
    }

    #[test]
    fn resolve_url_joins_relative_paths() {
        let mut target = Target::new("web-1", "/srv");
        assert_eq!(resolve_url(&target, "/health"), "http://web-1/health");
        target.health_base_url = Some("https://app.example.com/".to_string());
        assert_eq!(resolve_url(&target, "health"), "https://app.example.com/health");
        assert_eq!(
            resolve_url(&target, "http://10.0.0.1:8080/up"),
            "http://10.0.0.1:8080/up"
        );
    }

    #[test]
    fn output_pattern_requires_command_and_valid_regex() {
        let probe = Probe::new(ProbeType::OutputPattern, "([unclosed");
        let mut problems = Vec::new();
        probe.collect_problems("probes[0]", &mut problems);
        assert_eq!(problems.len(), 2);
    }
}
