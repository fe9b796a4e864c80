// ABOUTME: Application-wide error type for offspot-demo.
// ABOUTME: Wraps module errors and maps them to process exit codes.

use crate::deploy::{DeployError, LockError};
use crate::engine::EngineError;
use crate::imager::ImagerError;
use crate::registry::RegistryError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("{0} deployment(s) failed to refresh")]
    RefreshFailed(usize),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Imager(#[from] ImagerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Process exit code: external tool failures pass their own code through.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Deploy(e) => e.exit_code(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
