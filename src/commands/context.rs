// ABOUTME: State shared by every command: configuration, deployment list and output.
// ABOUTME: Also acquires the operation lock and builds the clients mutating commands need.

use offspot_demo::config::Config;
use offspot_demo::deploy::{DeployError, DeployLock};
use offspot_demo::diagnostics::Diagnostics;
use offspot_demo::engine::BollardEngine;
use offspot_demo::error::Result;
use offspot_demo::host::{Host, LocalHost};
use offspot_demo::imager::ImagerClient;
use offspot_demo::output::Output;
use offspot_demo::registry::DeploymentRegistry;

pub struct Context {
    pub config: Config,
    pub registry: DeploymentRegistry,
    pub output: Output,
    pub force_lock: bool,
}

/// Clients used by commands that change the host.
pub struct Clients {
    pub host: LocalHost,
    pub engine: BollardEngine,
    pub imager: ImagerClient,
    /// Held until the command returns.
    _lock: DeployLock,
}

impl Context {
    pub fn new(config: Config, output: Output, force_lock: bool) -> Result<Self> {
        let registry = DeploymentRegistry::parse(&config.demos, &config)?;
        Ok(Self {
            config,
            registry,
            output,
            force_lock,
        })
    }

    /// Check privileges, take the lock, then connect the clients.
    pub fn clients(&self, command: &str) -> Result<Clients> {
        let host = LocalHost;
        if !host.is_root() {
            return Err(DeployError::NotRoot.into());
        }

        let lock = DeployLock::acquire(
            &self.config.paths.state_dir,
            command,
            self.force_lock,
            self.config.lock_stale_after,
        )?;
        tracing::debug!("Acquired lock {}", lock.path().display());

        let docker = &self.config.docker;
        let engine = BollardEngine::connect(&docker.socket, &docker.platform)?;
        let imager = ImagerClient::new(&self.config.imager, self.config.imager.credentials()?)?;

        Ok(Clients {
            host,
            engine,
            imager,
            _lock: lock,
        })
    }

    /// Show warnings collected during the command.
    pub fn report(&self, diag: &Diagnostics) {
        for warning in diag.warnings() {
            self.output.warning(&warning.to_string());
        }
    }
}
