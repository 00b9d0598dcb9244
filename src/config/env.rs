//! Environment variable expansion for pipeline files.
//!
//! `$VAR` and `${VAR}` are replaced with the variable's value before the
//! YAML is parsed. Unset variables are left in place as `$VAR` so that shell
//! commands inside `run:` still see them.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::ConfigError;

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("Invalid regex for environment variables")
    })
}

/// Expands environment variables in `text` using the process environment.
///
/// # Errors
///
/// [`ConfigError::MissingEnvVar`] listing every name in `required` that is
/// not set.
pub fn expand_env(text: &str, required: &[String]) -> Result<String, ConfigError> {
    expand_with(text, required, |name| std::env::var(name).ok())
}

/// Expands variables using `lookup` instead of the process environment.
pub fn expand_with<F>(text: &str, required: &[String], lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<&str> = required
        .iter()
        .map(String::as_str)
        .filter(|name| lookup(name).is_none())
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        missing.dedup();
        return Err(ConfigError::MissingEnvVar(missing.join(", ")));
    }

    let expanded = env_pattern().replace_all(text, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        lookup(name).unwrap_or_else(|| format!("${}", name))
    });
    Ok(expanded.into_owned())
}
