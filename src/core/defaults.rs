//! Default values applied when a pipeline or target omits a field.

/// Per-step command timeout.
pub fn step_timeout_seconds() -> f64 {
    300.0
}

pub fn probe_interval_seconds() -> f64 {
    5.0
}

pub fn probe_max_wait_seconds() -> f64 {
    60.0
}

pub fn ssh_port() -> u16 {
    22
}

pub fn http_expect_status() -> u16 {
    200
}

/// Timeout for each `capture` command.
pub const CAPTURE_TIMEOUT_SECS: f64 = 60.0;

/// Bytes kept per stream (stdout, stderr) for a single command.
pub const OUTPUT_CAP_BYTES: usize = 64 * 1024;

/// `ssh -o ConnectTimeout=` value for the master connection.
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Longest probe interval, probe wait or health deadline a pipeline may declare.
pub const MAX_HEALTH_WAIT_SECS: f64 = 86_400.0;

/// Upper bound on a single HTTP probe request.
pub const PROBE_HTTP_TIMEOUT_SECS: f64 = 10.0;

/// Upper bound on a single remote probe command.
pub const PROBE_COMMAND_TIMEOUT_SECS: f64 = 30.0;
