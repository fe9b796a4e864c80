// ABOUTME: Configuration values that may be read from the environment.
// ABOUTME: Used for credentials that should stay out of the config file.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Either a literal string or a reference to an environment variable:
///
/// ```yaml
/// username: demo-bot
/// password: { env: IMAGER_PASSWORD, default: "" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl EnvValue {
    /// Reference to `var`, falling back to an empty string when it is unset.
    pub fn from_env_or_empty(var: &str) -> Self {
        EnvValue::FromEnv {
            var: var.to_string(),
            default: Some(String::new()),
        }
    }

    pub fn resolve(&self) -> Result<String> {
        match self {
            EnvValue::Literal(s) => Ok(s.clone()),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}
