// ABOUTME: Switches a deployment between its maintenance placeholder and its image's services.
// ABOUTME: The active manifest is a symlink replaced atomically; health is checked after a grace period.

use crate::compose::ComposeProject;
use crate::config::Config;
use crate::host::{Host, HostError};
use crate::registry::Deployment;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Which manifest a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Placeholder page served while the image is being replaced.
    Maintenance,
    /// The services shipped in the image.
    Image,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Maintenance => write!(f, "maint"),
            Mode::Image => write!(f, "image"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "maint" | "maintenance" => Ok(Mode::Maintenance),
            "image" => Ok(Mode::Image),
            other => Err(format!("unknown mode '{other}', expected maint or image")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToggleError {
    #[error("failed to write {}: {source}", .path.display())]
    MaintManifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to point {} at {}: {source}", .link.display(), .target.display())]
    Switch {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start containers: {0}")]
    Start(#[source] HostError),

    #[error("containers are not running properly in {0} mode")]
    Unhealthy(Mode),
}

/// Mode the active-manifest symlink points at. A missing or foreign link
/// counts as maintenance.
pub fn current_mode(deployment: &Deployment) -> Mode {
    match std::fs::read_link(deployment.paths.compose_path()) {
        Ok(target) if target == deployment.paths.image_compose_path() => Mode::Image,
        _ => Mode::Maintenance,
    }
}

/// Point `link` at `target`, replacing any existing link in one rename.
pub fn switch_symlink(link: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut staging = link.as_os_str().to_owned();
    staging.push(".switch");
    let staging = PathBuf::from(staging);

    match std::fs::remove_file(&staging) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, &staging)?;
    std::fs::rename(&staging, link)
}

/// Compose manifest of the maintenance placeholder for `deployment`.
pub fn render_maint_manifest(deployment: &Deployment, config: &Config) -> String {
    let label = &config.docker.maint_label;
    format!(
        r#"name: offspot_{ident}
services:
  maint:
    build:
      context: {context}
      labels:
        {label}: "true"
    labels:
      {label}: "true"
    environment:
      FQDN: {fqdn}
    ports:
      - "{port}:80"
"#,
        ident = deployment.ident,
        context = config.paths.maint_build_dir.display(),
        fqdn = deployment.fqdn,
        port = deployment.http_port,
    )
}

/// Applies mode switches for deployments.
pub struct ModeToggle<'a, H: Host> {
    config: &'a Config,
    compose: ComposeProject<'a, H>,
}

impl<'a, H: Host> ModeToggle<'a, H> {
    pub fn new(config: &'a Config, host: &'a H) -> Self {
        Self {
            config,
            compose: ComposeProject::new(host, &config.docker.compose_program),
        }
    }

    fn ensure_maint_manifest(&self, deployment: &Deployment) -> Result<(), ToggleError> {
        let path = deployment.paths.maint_compose_path();
        if path.exists() {
            return Ok(());
        }
        tracing::info!("Rendering maintenance manifest for {}", deployment.ident);
        let write = || -> io::Result<()> {
            std::fs::create_dir_all(&deployment.paths.compose_dir)?;
            std::fs::write(&path, render_maint_manifest(deployment, self.config))
        };
        write().map_err(|source| ToggleError::MaintManifest {
            path: path.clone(),
            source,
        })
    }

    /// Run `deployment` in `mode`: stop what runs, switch the manifest,
    /// start, wait for the grace period, then check health.
    pub async fn toggle(&self, deployment: &Deployment, mode: Mode) -> Result<(), ToggleError> {
        tracing::info!("Switching {} to {} mode", deployment.ident, mode);
        self.ensure_maint_manifest(deployment)?;

        let link = deployment.paths.compose_path();
        if std::fs::symlink_metadata(&link).is_ok() {
            self.compose.stop(&link).await;
        }

        let target = match mode {
            Mode::Maintenance => deployment.paths.maint_compose_path(),
            Mode::Image => deployment.paths.image_compose_path(),
        };
        switch_symlink(&link, &target).map_err(|source| ToggleError::Switch {
            link: link.clone(),
            target: target.clone(),
            source,
        })?;

        self.compose.start(&link).await.map_err(ToggleError::Start)?;

        if !self.config.startup_grace.is_zero() {
            tracing::info!(
                "Waiting {:?} before checking containers",
                self.config.startup_grace
            );
            tokio::time::sleep(self.config.startup_grace).await;
        }

        if !self.compose.is_healthy(&link).await {
            return Err(ToggleError::Unhealthy(mode));
        }
        tracing::info!("{} is running in {} mode", deployment.ident, mode);
        Ok(())
    }
}
