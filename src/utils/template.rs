//! `{{name}}` command template rendering.
//!
//! Templates are trusted configuration; values substituted into them are not,
//! so every value is shell-quoted on the way in.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::utils::shell;

pub struct TemplateVars;

impl TemplateVars {
    pub const HOST: &'static str = "host";
    pub const USER: &'static str = "user";
    pub const PORT: &'static str = "port";
    pub const TARGET: &'static str = "target";
    pub const WORKING_DIRECTORY: &'static str = "workingDirectory";
    pub const RUN_ID: &'static str = "runId";
}

/// Run-scoped variable set used to render step commands.
pub type Variables = BTreeMap<String, String>;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("placeholder regex")
    })
}

/// Names of every placeholder in `template`, deduplicated and sorted.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Placeholders in `template` that have no value in `variables`.
pub fn missing(template: &str, variables: &Variables) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .filter(|name| !variables.contains_key(name))
        .collect()
}

/// Substitute placeholders with shell-quoted values.
///
/// Fails with `validation.unresolved_variable` when any placeholder has no value;
/// nothing is executed or evaluated, this is plain string substitution.
pub fn render(template: &str, variables: &Variables, field: &str) -> Result<String> {
    let unresolved = missing(template, variables);
    if !unresolved.is_empty() {
        return Err(Error::validation_unresolved_variable(field, unresolved));
    }

    let rendered = placeholder_re().replace_all(template, |caps: &regex::Captures| {
        variables
            .get(&caps[1])
            .map(|value| shell::quote_arg(value))
            .unwrap_or_default()
    });

    Ok(rendered.into_owned())
}

/// Substitute placeholders without quoting, leaving unknown ones untouched.
///
/// Used for non-shell strings such as probe URLs and for dry-run previews.
pub fn render_raw(template: &str, variables: &Variables) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_substitutes_and_quotes_values() {
        let v = vars(&[("branch", "main"), ("dir", "/srv/my app")]);
        let out = render("git checkout {{branch}} && ls {{dir}}", &v, "t").unwrap();
        assert_eq!(out, "git checkout main && ls '/srv/my app'");
    }

    #[test]
    fn render_neutralizes_injection_in_values() {
        let v = vars(&[("branch", "main; rm -rf /")]);
        let out = render("git checkout {{branch}}", &v, "t").unwrap();
        assert_eq!(out, "git checkout 'main; rm -rf /'");
    }

    #[test]
    fn render_tolerates_inner_whitespace() {
        let v = vars(&[("branch", "dev")]);
        assert_eq!(render("{{ branch }}", &v, "t").unwrap(), "dev");
    }

    #[test]
    fn render_fails_on_missing_variable() {
        let err = render("deploy {{tag}} {{env}}", &vars(&[("env", "prod")]), "steps[1]").unwrap_err();
        assert_eq!(err.code.as_str(), "validation.unresolved_variable");
        assert_eq!(err.details["variables"][0], "tag");
    }

    #[test]
    fn render_raw_leaves_unknown_placeholders() {
        let v = vars(&[("host", "web-1")]);
        assert_eq!(
            render_raw("http://{{host}}/{{path}}", &v),
            "http://web-1/{{path}}"
        );
    }

    #[test]
    fn placeholders_are_deduplicated() {
        let names = placeholders("{{a}} {{b}} {{a}}");
        assert_eq!(names.len(), 2);
        assert!(names.contains("a"));
        assert!(!names.contains("c"));
    }
}
