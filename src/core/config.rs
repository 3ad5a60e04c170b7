//! Loading and validating target and pipeline definitions.
//!
//! A definition argument is a file path (`.json`, `.yaml`/`.yml`, `.toml`),
//! inline JSON (starts with `{` or `[`), or `-` for stdin.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;

use crate::credentials::CredentialRef;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::target::Target;
use crate::utils::io;
use crate::utils::template::{self, Variables};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(ConfigFormat::Json),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "toml" => Some(ConfigFormat::Toml),
            _ => None,
        }
    }
}

/// Detect if input is an inline JSON object or array.
pub(crate) fn is_json_input(input: &str) -> bool {
    let trimmed = input.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// Parse a document of the given format, naming `source` in errors.
pub fn parse_document<T: DeserializeOwned>(content: &str, format: ConfigFormat, source: &str) -> Result<T> {
    match format {
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| Error::config_invalid_json(source, e))
        }
        ConfigFormat::Yaml => {
            serde_yml::from_str(content).map_err(|e| Error::config_invalid_json(source, e))
        }
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| Error::config_invalid_json(source, e)),
    }
}

/// Read a definition argument and parse it.
pub fn load_document<T: DeserializeOwned>(spec: &str, what: &str) -> Result<T> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::validation_missing_argument(vec![what.to_string()]));
    }

    if spec == "-" {
        let content = io::read_stdin(what)?;
        let format = if is_json_input(&content) {
            ConfigFormat::Json
        } else {
            ConfigFormat::Yaml
        };
        return parse_document(&content, format, "<stdin>");
    }

    if is_json_input(spec) {
        return parse_document(spec, ConfigFormat::Json, "<inline>");
    }

    let expanded = shellexpand::tilde(spec).to_string();
    let path = Path::new(&expanded);
    let format = ConfigFormat::from_path(path).ok_or_else(|| Error::config_unsupported_format(&expanded))?;
    if !path.exists() {
        return Err(Error::config_missing_key(what, Some(expanded.clone()))
            .with_hint(format!("No file at {}", expanded)));
    }
    let content = io::read_file(path, &format!("read {}", what))?;
    parse_document(&content, format, &expanded)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetDocument {
    List(Vec<Target>),
    Wrapped { targets: Vec<Target> },
    Single(Target),
}

/// Load one or more targets: a single record, a list, or `{ "targets": [...] }`.
pub fn load_targets(spec: &str) -> Result<Vec<Target>> {
    let targets = match load_document::<TargetDocument>(spec, "target")? {
        TargetDocument::List(targets) | TargetDocument::Wrapped { targets } => targets,
        TargetDocument::Single(target) => vec![target],
    };

    if targets.is_empty() {
        return Err(Error::config_invalid_value(
            "targets",
            None,
            "at least one target is required",
        ));
    }
    Ok(targets)
}

pub fn load_pipeline(spec: &str) -> Result<Pipeline> {
    load_document(spec, "pipeline")
}

/// Parse repeated `--var key=value` arguments.
pub fn parse_overrides(pairs: &[String]) -> Result<Variables> {
    let mut vars = Variables::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::validation_invalid_argument("var", "expected key=value", Some(pair.clone()), None)
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::validation_invalid_argument(
                "var",
                "variable name must not be empty",
                Some(pair.clone()),
                None,
            ));
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Variables a run starts with, before captures: built-ins, then pipeline
/// variables, then overrides.
pub fn base_variables(target: &Target, pipeline: &Pipeline, overrides: &Variables, run_id: &str) -> Variables {
    let mut vars = target.builtin_variables(run_id);
    vars.extend(pipeline.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

/// Check everything that can be checked without touching the target.
///
/// Every problem is collected; a single problem is reported as
/// `config.invalid_value`, several as `validation.multiple_errors`. Template
/// placeholders with no value are `validation.unresolved_variable`.
pub fn validate(target: &Target, pipeline: &Pipeline, overrides: &Variables) -> Result<()> {
    let mut problems = Vec::new();
    target.collect_problems("target", &mut problems);
    pipeline.collect_problems(&mut problems);

    if let Some(reference) = target.credential_ref.as_deref() {
        if let Err(err) = CredentialRef::parse(reference) {
            problems.push(format!("target.credentialRef: {}", err.message));
        }
    }

    match problems.len() {
        0 => {}
        1 => {
            return Err(Error::config_invalid_value(
                "pipeline",
                None,
                problems.remove(0),
            ))
        }
        _ => return Err(Error::validation_multiple_errors(problems)),
    }

    check_placeholders(target, pipeline, overrides)
}

pub fn validate_all(targets: &[Target], pipeline: &Pipeline, overrides: &Variables) -> Result<()> {
    for target in targets {
        validate(target, pipeline, overrides)?;
    }
    Ok(())
}

fn check_placeholders(target: &Target, pipeline: &Pipeline, overrides: &Variables) -> Result<()> {
    let base = base_variables(target, pipeline, overrides, "validate");

    for (name, command) in &pipeline.capture {
        let missing = template::missing(command, &base);
        if !missing.is_empty() {
            return Err(Error::validation_unresolved_variable(
                format!("capture.{}", name),
                missing,
            ));
        }
    }

    let mut known = base;
    for name in pipeline.capture.keys() {
        known.insert(name.clone(), String::new());
    }

    let rollback_steps = pipeline.rollback.iter().flat_map(|plan| plan.steps.iter());
    let sections = pipeline
        .steps
        .iter()
        .map(|s| ("steps", s))
        .chain(rollback_steps.map(|s| ("rollback", s)));

    for (section, step) in sections {
        let mut missing = template::missing(&step.command_template, &known);
        if let Some(dir) = step.working_directory.as_deref() {
            missing.extend(template::missing(dir, &known));
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(Error::validation_unresolved_variable(
                format!("{}.{}", section, step.name),
                missing,
            ));
        }
    }

    for (idx, probe) in pipeline.probes.iter().enumerate() {
        if let Some(command) = probe.command.as_deref() {
            let missing = template::missing(command, &known);
            if !missing.is_empty() {
                return Err(Error::validation_unresolved_variable(
                    format!("probes[{}].command", idx),
                    missing,
                ));
            }
        }
    }

    Ok(())
}
