use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::utils::template::{TemplateVars, Variables};

/// A remote endpoint a pipeline runs against. Immutable for the life of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "defaults::ssh_port")]
    pub port: u16,
    /// Opaque handle resolved by a `CredentialProvider`; never a literal secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_base_url: Option<String>,
}

impl Target {
    pub fn new(host: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            name: None,
            host: host.into(),
            user: None,
            port: defaults::ssh_port(),
            credential_ref: None,
            working_directory: working_directory.into(),
            health_base_url: None,
        }
    }

    /// Display name used in reports and log lines.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.host)
    }

    /// `user@host`, or bare `host` when no user is configured.
    pub fn destination(&self) -> String {
        match self.user.as_deref() {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.host),
            _ => self.host.clone(),
        }
    }

    /// Commands for localhost targets run directly instead of over SSH.
    pub fn is_local(&self) -> bool {
        is_local_host(&self.host)
    }

    /// Base URL that relative HTTP probe targets are joined to.
    pub fn health_base(&self) -> String {
        match self.health_base_url.as_deref() {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}", self.host),
        }
    }

    /// Variables every command template can reference.
    pub fn builtin_variables(&self, run_id: &str) -> Variables {
        let mut vars = Variables::new();
        vars.insert(TemplateVars::HOST.to_string(), self.host.clone());
        vars.insert(
            TemplateVars::USER.to_string(),
            self.user.clone().unwrap_or_default(),
        );
        vars.insert(TemplateVars::PORT.to_string(), self.port.to_string());
        vars.insert(TemplateVars::TARGET.to_string(), self.label().to_string());
        vars.insert(
            TemplateVars::WORKING_DIRECTORY.to_string(),
            self.working_directory.clone(),
        );
        vars.insert(TemplateVars::RUN_ID.to_string(), run_id.to_string());
        vars
    }

    pub(crate) fn collect_problems(&self, field: &str, problems: &mut Vec<String>) {
        if self.host.trim().is_empty() {
            problems.push(format!("{}.host must not be empty", field));
        }
        if self.working_directory.trim().is_empty() {
            problems.push(format!("{}.workingDirectory must not be empty", field));
        }
        if self.port == 0 {
            problems.push(format!("{}.port must be between 1 and 65535", field));
        }
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}
