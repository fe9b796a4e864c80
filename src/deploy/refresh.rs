// ABOUTME: Brings the host in line with the configured deployment list.
// ABOUTME: Undeploys leftovers, then redeploys anything unhealthy or with a newer image.

use serde::Serialize;
use snafu::ResultExt;

use crate::diagnostics::{Diagnostics, Warning};
use crate::engine::ContainerEngine;
use crate::host::Host;
use crate::proxy::reconfigure_proxy;
use crate::registry::{Deployment, DeploymentRegistry, prepared_idents};

use super::error::{DeployError, FilesystemSnafu};
use super::orchestrator::{DeployOptions, DeployOrchestrator};

/// What a refresh did to each deployment.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RefreshReport {
    pub undeployed: Vec<String>,
    pub deployed: Vec<String>,
    pub up_to_date: Vec<String>,
    /// Ident and error message of every deployment that could not be handled.
    pub failed: Vec<(String, String)>,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<H: Host, E: ContainerEngine> DeployOrchestrator<'_, H, E> {
    /// Refresh every deployment.
    ///
    /// Each deployment is handled on its own; one failing does not stop the
    /// others. Failures are listed in the returned report.
    pub async fn refresh_all(
        &self,
        registry: &mut DeploymentRegistry,
        diag: &mut Diagnostics,
    ) -> Result<RefreshReport, DeployError> {
        self.ensure_root()?;
        let mut report = RefreshReport::default();

        if let Err(e) = reconfigure_proxy(self.host, &self.config.proxy, registry).await {
            diag.warn(Warning::proxy(e.to_string()));
        }

        let target_root = &self.config.paths.target_root;
        let prepared = prepared_idents(target_root).context(FilesystemSnafu {
            path: target_root.clone(),
        })?;
        for ident in prepared.iter().filter(|ident| !registry.contains(ident)) {
            let mut leftover = match Deployment::using(ident, None, None, Vec::new(), self.config) {
                Ok(deployment) => deployment,
                Err(e) => {
                    tracing::warn!("Ignoring {}: {}", target_root.join(ident).display(), e);
                    continue;
                }
            };
            tracing::info!("{} is no longer configured, undeploying", ident);
            match self.undeploy(&mut leftover, false).await {
                Ok(()) => report.undeployed.push(ident.clone()),
                Err(e) => {
                    tracing::error!("Undeploying {} failed: {}", ident, e);
                    report.failed.push((ident.clone(), e.to_string()));
                }
            }
        }

        if registry.is_empty() {
            tracing::info!("No deployment configured");
            return Ok(report);
        }

        for ident in registry.idents() {
            let ident = ident.as_str();
            let Some(deployment) = registry.get_mut(ident) else {
                continue;
            };

            let healthy = self
                .compose()
                .is_healthy(&deployment.paths.compose_path())
                .await;
            let url = match self.imager.refresh(deployment).await {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!("Could not resolve image of {}: {}", ident, e);
                    report.failed.push((ident.to_string(), e.to_string()));
                    continue;
                }
            };
            let has_new_image = deployment.last_image_url().as_deref() != Some(url.as_str());

            if healthy && !has_new_image {
                tracing::info!("{} is healthy and up to date", ident);
                report.up_to_date.push(ident.to_string());
                continue;
            }

            let reuse_image = !has_new_image && deployment.paths.image_path().exists();
            tracing::info!(
                "Redeploying {} (healthy: {}, new image: {}, reuse image: {})",
                ident,
                healthy,
                has_new_image,
                reuse_image
            );

            let options = DeployOptions {
                reuse_image,
                force_prepare: true,
            };
            match self.deploy(registry, ident, options, diag).await {
                Ok(()) => {
                    if let Some(deployment) = registry.get(ident)
                        && let Err(e) = deployment.write_last_image_url(&url)
                    {
                        diag.warn(Warning::state(format!(
                            "failed to record image of {}: {}",
                            ident, e
                        )));
                    }
                    report.deployed.push(ident.to_string());
                }
                Err(e) => report.failed.push((ident.to_string(), e.to_string())),
            }
        }

        Ok(report)
    }
}
