//! Credential reference resolution.
//!
//! A target carries only an opaque `credentialRef`. Turning it into something
//! the transport can use is delegated to a `CredentialProvider`, so literal
//! secrets never live in pipeline or target files.
//!
//! Built-in reference schemes:
//! - `agent` (or no reference): rely on the ssh agent and default keys
//! - `file:<path>`: identity file on disk
//! - `env:<VAR>`: environment variable holding an identity file path
//! - `keyring:<service>/<account>`: OS keychain entry holding an identity file path

use keyring::Entry;
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Agent,
    IdentityFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    Agent,
    File(String),
    Env(String),
    Keyring { service: String, account: String },
}

impl CredentialRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "agent" {
            return Ok(CredentialRef::Agent);
        }

        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| Error::credential_unsupported_scheme(raw))?;

        if rest.is_empty() {
            return Err(Error::credential_unresolved(raw, "reference has no value"));
        }

        match scheme {
            "file" => Ok(CredentialRef::File(rest.to_string())),
            "env" => Ok(CredentialRef::Env(rest.to_string())),
            "keyring" => {
                let (service, account) = rest.split_once('/').ok_or_else(|| {
                    Error::credential_unresolved(raw, "expected keyring:<service>/<account>")
                })?;
                Ok(CredentialRef::Keyring {
                    service: service.to_string(),
                    account: account.to_string(),
                })
            }
            _ => Err(Error::credential_unsupported_scheme(raw)),
        }
    }
}

pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, credential_ref: Option<&str>) -> Result<Credential>;
}

/// Resolves the built-in schemes against the local environment and keychain.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCredentialProvider;

impl CredentialProvider for DefaultCredentialProvider {
    fn resolve(&self, credential_ref: Option<&str>) -> Result<Credential> {
        let raw = credential_ref.unwrap_or("agent");
        match CredentialRef::parse(raw)? {
            CredentialRef::Agent => Ok(Credential::Agent),
            CredentialRef::File(path) => identity_file(raw, &path),
            CredentialRef::Env(var) => {
                let path = std::env::var(&var).map_err(|_| {
                    Error::credential_unresolved(raw, format!("environment variable {} is not set", var))
                })?;
                identity_file(raw, &path)
            }
            CredentialRef::Keyring { service, account } => {
                let path = keyring_lookup(raw, &service, &account)?;
                identity_file(raw, &path)
            }
        }
    }
}

fn identity_file(raw: &str, path: &str) -> Result<Credential> {
    let expanded = shellexpand::tilde(path).to_string();
    if !std::path::Path::new(&expanded).exists() {
        return Err(Error::ssh_identity_file_not_found(raw, expanded));
    }
    Ok(Credential::IdentityFile(PathBuf::from(expanded)))
}

fn keyring_lookup(raw: &str, service: &str, account: &str) -> Result<String> {
    let entry = Entry::new(service, account)
        .map_err(|e| Error::credential_unresolved(raw, format!("Keychain error: {}", e)))?;

    match entry.get_password() {
        Ok(value) => Ok(value),
        Err(keyring::Error::NoEntry) => Err(Error::credential_unresolved(
            raw,
            "no keychain entry for this service/account",
        )),
        Err(e) => Err(Error::credential_unresolved(raw, format!("Keychain error: {}", e))),
    }
}
