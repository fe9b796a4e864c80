// ABOUTME: Diagnostics accumulator for non-fatal warnings during lifecycle operations.
// ABOUTME: Collects failures that must not abort an operation but should be shown to users.

use std::fmt;

/// Collects non-fatal warnings during deployment operations.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    /// Get all collected warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Check if any warnings were collected.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// A non-fatal warning collected during an operation.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    /// A compensating action failed while rolling back a deployment.
    pub fn rollback(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Rollback,
            message: message.into(),
        }
    }

    /// Unused containers or images could not be pruned.
    pub fn prune(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Prune,
            message: message.into(),
        }
    }

    /// The edge proxy could not be regenerated outside of a deployment.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Proxy,
            message: message.into(),
        }
    }

    /// Deployment bookkeeping on disk could not be updated.
    pub fn state(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::State,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Categories of warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// Rollback step failed; the deployment may need manual attention.
    Rollback,
    /// Pruning failed; disk space was not reclaimed.
    Prune,
    /// Edge proxy reconfiguration failed.
    Proxy,
    /// A state file (last image URL, lock) could not be written or removed.
    State,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WarningKind::Rollback => "rollback",
            WarningKind::Prune => "prune",
            WarningKind::Proxy => "proxy",
            WarningKind::State => "state",
        };
        f.write_str(label)
    }
}
