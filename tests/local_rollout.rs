#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rollout::clock::SystemClock;
use rollout::config;
use rollout::credentials::DefaultCredentialProvider;
use rollout::health::{DefaultProbeChecker, HealthStatus, Probe, ProbeType};
use rollout::step::{FailurePolicy, Step, StepStatus};
use rollout::transport::LocalTransport;
use rollout::utils::template::Variables;
use rollout::{CancelToken, ErrorCode, Orchestrator, Pipeline, RunStatus, Target};

fn orchestrator(output_cap: usize) -> Orchestrator {
    Orchestrator::new(
        Arc::new(LocalTransport::new(output_cap)),
        Arc::new(DefaultCredentialProvider),
        Arc::new(DefaultProbeChecker::new().unwrap()),
        Arc::new(SystemClock),
    )
}

fn local_target(dir: &Path) -> Target {
    Target::new("localhost", dir.to_str().unwrap())
}

fn ready_probe() -> Probe {
    Probe::new(ProbeType::OutputPattern, "^ready")
        .named("status-file")
        .with_command("cat status.txt")
        .timing(0.1, 3.0)
}

#[test]
fn deploys_in_working_directory_and_verifies_health() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("VERSION"), "v1\n").unwrap();

    let pipeline = Pipeline::new(vec![
        Step::new("write", "printf '%s\\n' {{version}} > VERSION"),
        Step::new("build", "echo building && echo warn >&2"),
        Step::new("start", "echo ready > status.txt"),
    ])
    .with_capture("previousVersion", "cat VERSION")
    .with_probes(vec![ready_probe()]);

    let mut overrides = Variables::new();
    overrides.insert("version".to_string(), "v2".to_string());

    let report = orchestrator(64 * 1024)
        .run(&local_target(dir.path()), &pipeline, &overrides, &CancelToken::new())
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded, "{:#?}", report.notes);
    assert_eq!(report.captures[0].stdout.trim(), "v1");
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.steps[1].stdout, "building\n");
    assert_eq!(report.steps[1].stderr, "warn\n");
    assert_eq!(fs::read_to_string(dir.path().join("VERSION")).unwrap(), "v2\n");

    let health = report.health.unwrap();
    assert_eq!(health.status, HealthStatus::Ok);
    assert!(health.probes[0].satisfied);
}

#[test]
fn timed_out_step_triggers_rollback_to_captured_version() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("VERSION"), "v1").unwrap();

    let pipeline = Pipeline::new(vec![
        Step::new("write", "printf v2 > VERSION"),
        Step::new("restart", "sleep 5")
            .with_timeout(0.3)
            .on_failure(FailurePolicy::TriggerRollback),
    ])
    .with_capture("previousVersion", "cat VERSION")
    .with_rollback(vec![
        Step::new("restore", "printf '%s' {{previousVersion}} > VERSION"),
        Step::new("start", "echo ready > status.txt"),
    ])
    .with_probes(vec![ready_probe()]);

    let report = orchestrator(64 * 1024)
        .run(&local_target(dir.path()), &pipeline, &Variables::new(), &CancelToken::new())
        .unwrap();

    assert_eq!(report.status, RunStatus::RolledBack, "{:#?}", report.notes);
    assert_eq!(report.steps[1].status, StepStatus::TimedOut);
    assert!(report.steps[1].duration_ms < 5_000);
    assert_eq!(report.failed_step.as_deref(), Some("restart"));
    assert!(report.has_note(ErrorCode::RemoteCommandTimeout));
    assert!(report.health.is_none());

    let rollback = report.rollback.unwrap();
    assert_eq!(rollback.status, RunStatus::Succeeded);
    assert!(rollback.health.unwrap().is_ok());
    assert_eq!(fs::read_to_string(dir.path().join("VERSION")).unwrap(), "v1");
}

#[test]
fn noisy_output_is_capped_with_marker() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(vec![Step::new(
        "noisy",
        "i=0; while [ $i -lt 4000 ]; do echo line-$i; i=$((i+1)); done",
    )]);

    let report = orchestrator(1024)
        .run(&local_target(dir.path()), &pipeline, &Variables::new(), &CancelToken::new())
        .unwrap();

    let step = &report.steps[0];
    assert_eq!(step.status, StepStatus::Success);
    assert!(step.stdout_truncated);
    assert!(step.stdout.starts_with("[... "));
    assert!(step.stdout.contains("bytes truncated ...]"));
    assert!(step.stdout.trim_end().ends_with("line-3999"));
}

#[test]
fn yaml_definitions_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("app");
    fs::create_dir(&workdir).unwrap();

    let target_path = dir.path().join("target.yaml");
    fs::write(
        &target_path,
        format!("host: localhost\nworkingDirectory: {}\n", workdir.display()),
    )
    .unwrap();

    let pipeline_path = dir.path().join("pipeline.json");
    fs::write(
        &pipeline_path,
        r#"{
            "name": "smoke",
            "steps": [
                {"name": "flaky", "commandTemplate": "exit 3", "retryCount": 1, "onFailure": "warn-and-continue"},
                {"name": "touch", "commandTemplate": "touch deployed-{{runId}}"}
            ]
        }"#,
    )
    .unwrap();

    let targets = config::load_targets(target_path.to_str().unwrap()).unwrap();
    let pipeline = config::load_pipeline(pipeline_path.to_str().unwrap()).unwrap();

    let report = orchestrator(64 * 1024)
        .run(&targets[0], &pipeline, &Variables::new(), &CancelToken::new())
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.pipeline.as_deref(), Some("smoke"));
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(report.steps[0].exit_code, Some(3));
    assert_eq!(report.warnings.len(), 1);
    assert!(workdir.join(format!("deployed-{}", report.run_id)).exists());
}

#[test]
fn pre_cancelled_run_executes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(vec![Step::new("write", "touch should-not-exist")]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = orchestrator(64 * 1024)
        .run(&local_target(dir.path()), &pipeline, &Variables::new(), &cancel)
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.cancelled);
    assert!(report.steps.is_empty());
    assert!(!dir.path().join("should-not-exist").exists());
}
