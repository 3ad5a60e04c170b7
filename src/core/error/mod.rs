use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidJson,
    ConfigInvalidValue,
    ConfigUnsupportedFormat,

    ValidationMissingArgument,
    ValidationInvalidArgument,
    ValidationMultipleErrors,
    ValidationUnresolvedVariable,

    CredentialUnresolved,
    CredentialUnsupportedScheme,

    SshIdentityFileNotFound,
    SshConnectFailed,
    SshSessionFailed,

    RemoteCommandFailed,
    RemoteCommandTimeout,

    ProbeUnsatisfied,
    RollbackFailed,
    RunCancelled,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigUnsupportedFormat => "config.unsupported_format",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationMultipleErrors => "validation.multiple_errors",
            ErrorCode::ValidationUnresolvedVariable => "validation.unresolved_variable",

            ErrorCode::CredentialUnresolved => "credential.unresolved",
            ErrorCode::CredentialUnsupportedScheme => "credential.unsupported_scheme",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",
            ErrorCode::SshSessionFailed => "ssh.session_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",

            ErrorCode::ProbeUnsatisfied => "health.probe_unsatisfied",
            ErrorCode::RollbackFailed => "rollback.failed",
            ErrorCode::RunCancelled => "run.cancelled",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidJsonDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectFailedDetails {
    pub host: String,
    pub exit_code: i32,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshIdentityFileNotFoundDetails {
    pub credential_ref: String,
    pub identity_file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDetails {
    pub credential_ref: String,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedVariableDetails {
    pub field: String,
    pub variables: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipleErrorsDetails {
    pub problems: Vec<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.into(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            "Invalid argument",
            details,
        )
    }

    pub fn validation_multiple_errors(problems: Vec<String>) -> Self {
        let message = format!("Configuration has {} problem(s)", problems.len());
        Self::new(
            ErrorCode::ValidationMultipleErrors,
            message,
            to_details(MultipleErrorsDetails { problems }),
        )
    }

    pub fn validation_unresolved_variable(field: impl Into<String>, variables: Vec<String>) -> Self {
        let field = field.into();
        let message = format!(
            "Template '{}' references undefined variable(s): {}",
            field,
            variables.join(", ")
        );
        Self::new(
            ErrorCode::ValidationUnresolvedVariable,
            message,
            to_details(UnresolvedVariableDetails { field, variables }),
        )
        .with_hint("Define the variable under 'variables' in the pipeline or pass --var key=value")
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let details = to_details(ConfigMissingKeyDetails {
            key: key.into(),
            path,
        });

        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            details,
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        let details = to_details(ConfigInvalidJsonDetails {
            path: path.into(),
            error: err.to_string(),
        });

        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid configuration document",
            details,
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            details,
        )
    }

    pub fn config_unsupported_format(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::ConfigUnsupportedFormat,
            format!("Unsupported configuration format: {}", path),
            serde_json::json!({ "path": path }),
        )
        .with_hint("Use a .json, .yaml, .yml or .toml file, or pass inline JSON")
    }

    pub fn credential_unresolved(
        credential_ref: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(CredentialDetails {
            credential_ref: credential_ref.into(),
            problem: problem.into(),
        });
        Self::new(
            ErrorCode::CredentialUnresolved,
            "Credential reference could not be resolved",
            details,
        )
    }

    pub fn credential_unsupported_scheme(credential_ref: impl Into<String>) -> Self {
        let details = to_details(CredentialDetails {
            credential_ref: credential_ref.into(),
            problem: "unknown scheme".to_string(),
        });
        Self::new(
            ErrorCode::CredentialUnsupportedScheme,
            "Unsupported credential reference scheme",
            details,
        )
        .with_hint("Supported schemes: agent, file:<path>, env:<VAR>, keyring:<service>/<account>")
    }

    pub fn ssh_identity_file_not_found(
        credential_ref: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        let details = to_details(SshIdentityFileNotFoundDetails {
            credential_ref: credential_ref.into(),
            identity_file: identity_file.into(),
        });

        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            "SSH identity file not found",
            details,
        )
    }

    pub fn ssh_connect_failed(host: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        let host = host.into();
        let message = format!("Could not open a session to {}", host);
        let mut err = Self::new(
            ErrorCode::SshConnectFailed,
            message,
            to_details(SshConnectFailedDetails {
                host,
                exit_code,
                stderr: stderr.into(),
            }),
        )
        .with_hint("Check the host address, network reachability and the credential reference");
        err.retryable = Some(true);
        err
    }

    pub fn ssh_session_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SshSessionFailed,
            message,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn remote_command_timeout(command: impl Into<String>, timeout_secs: f64) -> Self {
        let command = command.into();
        Self::new(
            ErrorCode::RemoteCommandTimeout,
            format!("Command exceeded its {}s timeout", timeout_secs),
            serde_json::json!({ "command": command, "timeoutSeconds": timeout_secs }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}
