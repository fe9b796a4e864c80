// ABOUTME: Deployment identifier validation.
// ABOUTME: Identifiers name image files, directories and compose projects on the host.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum identifier length, so derived names stay valid DNS labels.
const MAX_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeploymentIdentError {
    #[error("deployment identifier cannot be empty")]
    Empty,

    #[error("deployment identifier exceeds maximum length of 63 characters")]
    TooLong,

    #[error("deployment identifier must start with a letter or digit")]
    InvalidStart,

    #[error("deployment identifier must be lowercase")]
    NotLowercase,

    #[error("invalid character in deployment identifier: '{0}'")]
    InvalidChar(char),
}

/// Unique key of a deployment, matching the image catalog identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentIdent(String);

impl DeploymentIdent {
    pub fn new(value: &str) -> Result<Self, DeploymentIdentError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DeploymentIdentError::Empty);
        }

        if value.len() > MAX_LEN {
            return Err(DeploymentIdentError::TooLong);
        }

        if !value
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return match value.chars().next() {
                Some(c) if c.is_ascii_uppercase() => Err(DeploymentIdentError::NotLowercase),
                _ => Err(DeploymentIdentError::InvalidStart),
            };
        }

        for c in value.chars() {
            if c.is_ascii_uppercase() {
                return Err(DeploymentIdentError::NotLowercase);
            }
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
                return Err(DeploymentIdentError::InvalidChar(c));
            }
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeploymentIdent {
    type Err = DeploymentIdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for DeploymentIdent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_catalog_identifiers() {
        for ident in ["wikipedia", "wikipedia_fr_all", "kiwix-demo", "2048"] {
            assert!(DeploymentIdent::new(ident).is_ok(), "{ident} rejected");
        }
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let ident = DeploymentIdent::new("  wikipedia ").unwrap();
        assert_eq!(ident.as_str(), "wikipedia");
    }

    #[test]
    fn rejects_path_like_values() {
        assert_eq!(
            DeploymentIdent::new("../etc"),
            Err(DeploymentIdentError::InvalidStart)
        );
        assert_eq!(
            DeploymentIdent::new("a/b"),
            Err(DeploymentIdentError::InvalidChar('/'))
        );
    }

    #[test]
    fn rejects_uppercase_and_empty() {
        assert_eq!(
            DeploymentIdent::new("Wikipedia"),
            Err(DeploymentIdentError::NotLowercase)
        );
        assert_eq!(DeploymentIdent::new(""), Err(DeploymentIdentError::Empty));
        assert_eq!(
            DeploymentIdent::new(&"a".repeat(64)),
            Err(DeploymentIdentError::TooLong)
        );
    }
}
