// ABOUTME: Lifecycle of a deployment's compose project: start, stop and health.
// ABOUTME: Drives the compose CLI through the Host abstraction.

use crate::host::{CommandLine, Host, HostError};
use serde::Deserialize;
use std::path::Path;

/// Container states that count as unhealthy.
const UNHEALTHY_STATES: [&str; 4] = ["restarting", "removing", "dead", "exited"];

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "State", default)]
    state: String,
}

/// Health of a compose project from its `ps --format json` output.
///
/// Accepts both one JSON object per line and a single JSON array. No
/// containers, or output that cannot be parsed, is unhealthy.
pub fn evaluate_health(ps_output: &str) -> bool {
    let ps_output = ps_output.trim();
    if ps_output.is_empty() {
        return false;
    }

    let entries: Vec<PsEntry> = if ps_output.starts_with('[') {
        match serde_json::from_str(ps_output) {
            Ok(entries) => entries,
            Err(_) => return false,
        }
    } else {
        let parsed: Result<Vec<PsEntry>, _> = ps_output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect();
        match parsed {
            Ok(entries) => entries,
            Err(_) => return false,
        }
    };

    !entries.is_empty()
        && entries
            .iter()
            .all(|entry| !UNHEALTHY_STATES.contains(&entry.state.to_lowercase().as_str()))
}

/// A compose project addressed by its manifest path.
pub struct ComposeProject<'a, H: Host> {
    host: &'a H,
    program: &'a str,
}

impl<'a, H: Host> ComposeProject<'a, H> {
    pub fn new(host: &'a H, program: &'a str) -> Self {
        Self { host, program }
    }

    fn command(&self, manifest: &Path) -> CommandLine {
        CommandLine::new(self.program)
            .arg("compose")
            .arg("-f")
            .arg(manifest.to_string_lossy())
    }

    /// Stop and remove the project's containers. Failures are only logged.
    pub async fn stop(&self, manifest: &Path) -> bool {
        let command = self
            .command(manifest)
            .args(["down", "--remove-orphans", "--volumes"]);
        self.host.run_failsafe(&command).await
    }

    /// Build if needed and start the project in the background.
    pub async fn start(&self, manifest: &Path) -> Result<(), HostError> {
        self.host
            .run(&self.command(manifest).args(["up", "--build", "--detach"]))
            .await?;
        Ok(())
    }

    /// Whether every container of the project is up.
    pub async fn is_healthy(&self, manifest: &Path) -> bool {
        match self
            .host
            .exec(
                &self
                    .command(manifest)
                    .args(["ps", "--all", "--format", "json"]),
            )
            .await
        {
            Ok(output) if output.success() => evaluate_health(&output.stdout),
            Ok(output) => {
                tracing::debug!("ps failed for {}: {}", manifest.display(), output.stderr);
                false
            }
            Err(e) => {
                tracing::debug!("{}", e);
                false
            }
        }
    }
}
