// ABOUTME: Deploy and undeploy sequences for a single deployment.
// ABOUTME: Any failure during deploy runs the rollback plan before the error is returned.

use std::panic::AssertUnwindSafe;
use std::path::Path;

use futures::FutureExt;
use snafu::{OptionExt, ResultExt, ensure};

use crate::blockdev::{BlockDevices, DATA_PARTITION};
use crate::compose::ComposeProject;
use crate::config::Config;
use crate::diagnostics::{Diagnostics, Warning};
use crate::download::ImageDownloader;
use crate::engine::ContainerEngine;
use crate::host::Host;
use crate::imager::{ImagerClient, ImagerError};
use crate::manifest::{ManifestRewriter, PrepareOutcome};
use crate::proxy::reconfigure_proxy;
use crate::registry::{Deployment, DeploymentRegistry};
use crate::toggle::{Mode, ModeToggle};

use super::error::{
    BlockDeviceSnafu, DeployError, DownloadSnafu, FilesystemSnafu, MissingImageSnafu, NotRootSnafu,
    PrepareSnafu, ProxySnafu, ResolveSnafu, ToggleSnafu, UnknownDeploymentSnafu,
    UnreachableUrlSnafu,
};
use super::rollback::{Compensation, RollbackPlan};

/// Options of a single deploy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Use the image already on disk instead of downloading.
    pub reuse_image: bool,
    /// Prepare again even if the target carries a prepared marker.
    pub force_prepare: bool,
}

/// Runs lifecycle operations against a host and its container engine.
pub struct DeployOrchestrator<'a, H: Host, E: ContainerEngine> {
    pub(super) config: &'a Config,
    pub(super) host: &'a H,
    pub(super) engine: &'a E,
    pub(super) imager: &'a ImagerClient,
}

fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl<'a, H: Host, E: ContainerEngine> DeployOrchestrator<'a, H, E> {
    pub fn new(config: &'a Config, host: &'a H, engine: &'a E, imager: &'a ImagerClient) -> Self {
        Self {
            config,
            host,
            engine,
            imager,
        }
    }

    pub(super) fn block_devices(&self) -> BlockDevices<'a, H> {
        BlockDevices::new(self.host, &self.config.paths.sysfs_block)
    }

    pub(super) fn compose(&self) -> ComposeProject<'a, H> {
        ComposeProject::new(self.host, &self.config.docker.compose_program)
    }

    fn mode_toggle(&self) -> ModeToggle<'a, H> {
        ModeToggle::new(self.config, self.host)
    }

    fn rewriter(&self) -> ManifestRewriter<'a, E> {
        ManifestRewriter::new(self.config, self.engine)
    }

    fn downloader(&self) -> ImageDownloader<'a, H> {
        ImageDownloader::new(self.host, self.imager, &self.config.download)
    }

    pub(super) fn ensure_root(&self) -> Result<(), DeployError> {
        ensure!(self.host.is_root(), NotRootSnafu);
        Ok(())
    }

    /// Deploy the latest image of `ident`.
    ///
    /// Users see the maintenance page while the image is swapped. On any
    /// failure the deployment is put back in maintenance mode and its image
    /// released; failures of those compensations land in `diag`.
    pub async fn deploy(
        &self,
        registry: &mut DeploymentRegistry,
        ident: &str,
        options: DeployOptions,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        self.ensure_root()?;
        ensure!(registry.contains(ident), UnknownDeploymentSnafu { ident });

        let mut plan = RollbackPlan::new();
        let steps = self.deploy_steps(registry, ident, options, &mut plan, diag);
        let outcome = AssertUnwindSafe(steps).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {
                plan.disarm();
                tracing::info!("Deployed {}", ident);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!("Deploying {} failed: {}", ident, e);
                if let Some(deployment) = registry.get(ident) {
                    self.roll_back(deployment, &plan, diag).await;
                }
                Err(e)
            }
            Err(panic) => {
                tracing::error!("Deploying {} panicked, rolling back", ident);
                if let Some(deployment) = registry.get(ident) {
                    self.roll_back(deployment, &plan, diag).await;
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn deploy_steps(
        &self,
        registry: &mut DeploymentRegistry,
        ident: &str,
        options: DeployOptions,
        plan: &mut RollbackPlan,
        diag: &mut Diagnostics,
    ) -> Result<(), DeployError> {
        plan.register(Compensation::ReleaseImage);
        plan.register(Compensation::SwitchToMaintenance);

        let deployment = registry
            .get_mut(ident)
            .context(UnknownDeploymentSnafu { ident })?;
        let url = self.imager.resolve(deployment).await.context(ResolveSnafu)?;
        tracing::info!("Deploying {} from {}", deployment.ident, url);

        ensure!(
            self.imager.is_url_reachable(&url).await,
            UnreachableUrlSnafu { url: url.clone() }
        );

        let deployment: &Deployment = deployment;
        let paths = &deployment.paths;
        let image_path = paths.image_path();

        if options.reuse_image {
            ensure!(
                image_path.exists(),
                MissingImageSnafu {
                    path: image_path.clone()
                }
            );
        } else {
            self.downloader()
                .download(&url, &paths.tmp_image_path())
                .await
                .context(DownloadSnafu)?;
        }

        self.mode_toggle()
            .toggle(deployment, Mode::Maintenance)
            .await
            .context(ToggleSnafu {
                mode: Mode::Maintenance,
            })?;

        let block_devices = self.block_devices();
        block_devices
            .release(&image_path, &paths.target_dir)
            .await
            .context(BlockDeviceSnafu)?;

        if !options.reuse_image {
            tokio::fs::rename(paths.tmp_image_path(), &image_path)
                .await
                .context(FilesystemSnafu {
                    path: image_path.clone(),
                })?;
        }

        match self
            .engine
            .prune_unlabelled(&self.config.docker.maint_label)
            .await
        {
            Ok(report) => tracing::info!(
                "Pruned {} container(s) and {} image(s), {} bytes reclaimed",
                report.containers_removed,
                report.images_removed,
                report.space_reclaimed
            ),
            Err(e) => diag.warn(Warning::prune(e.to_string())),
        }

        let device = block_devices
            .get_free_device()
            .await
            .context(BlockDeviceSnafu)?;
        block_devices
            .attach(&image_path, &device)
            .await
            .context(BlockDeviceSnafu)?;
        tokio::fs::create_dir_all(&paths.target_dir)
            .await
            .context(FilesystemSnafu {
                path: paths.target_dir.clone(),
            })?;
        block_devices
            .mount(&device, DATA_PARTITION, &paths.target_dir)
            .await
            .context(BlockDeviceSnafu)?;

        self.rewriter()
            .prepare(deployment, options.force_prepare)
            .await
            .context(PrepareSnafu)?;

        self.mode_toggle()
            .toggle(deployment, Mode::Image)
            .await
            .context(ToggleSnafu { mode: Mode::Image })?;

        reconfigure_proxy(self.host, &self.config.proxy, registry)
            .await
            .context(ProxySnafu)?;
        Ok(())
    }

    async fn roll_back(
        &self,
        deployment: &Deployment,
        plan: &RollbackPlan,
        diag: &mut Diagnostics,
    ) {
        for step in plan.steps() {
            tracing::info!("Rolling back {}: {:?}", deployment.ident, step);
            match step {
                Compensation::SwitchToMaintenance => {
                    if let Err(e) = self
                        .mode_toggle()
                        .toggle(deployment, Mode::Maintenance)
                        .await
                    {
                        diag.warn(Warning::rollback(format!(
                            "failed to restore maintenance mode for {}: {}",
                            deployment.ident, e
                        )));
                    }
                }
                Compensation::ReleaseImage => {
                    if let Err(e) = self
                        .block_devices()
                        .release(&deployment.paths.image_path(), &deployment.paths.target_dir)
                        .await
                    {
                        diag.warn(Warning::rollback(format!(
                            "failed to release image of {}: {}",
                            deployment.ident, e
                        )));
                    }
                }
            }
        }
    }

    /// Stop a deployment and remove it from the host.
    ///
    /// The downloaded image is kept when `keep_image` is set.
    pub async fn undeploy(
        &self,
        deployment: &mut Deployment,
        keep_image: bool,
    ) -> Result<(), DeployError> {
        self.ensure_root()?;

        let url = match self.imager.resolve(deployment).await {
            Ok(url) => url,
            Err(ImagerError::NotFound(_)) => {
                let gone = format!("Gone image ({})", deployment.ident);
                deployment.set_download_url(gone.clone());
                gone
            }
            Err(source) => return Err(DeployError::Resolve { source }),
        };
        tracing::info!("Undeploying {} ({})", deployment.ident, url);

        let paths = &deployment.paths;
        let compose_path = paths.compose_path();
        if std::fs::symlink_metadata(&compose_path).is_ok() {
            self.compose().stop(&compose_path).await;
        }

        let image_path = paths.image_path();
        self.block_devices()
            .release(&image_path, &paths.target_dir)
            .await
            .context(BlockDeviceSnafu)?;

        if !keep_image {
            for path in [image_path, paths.tmp_image_path(), paths.last_image_path()] {
                remove_if_exists(&path).context(FilesystemSnafu { path: path.clone() })?;
            }
            // Only succeeds once empty, which is all we want.
            let _ = std::fs::remove_dir(&paths.image_dir);
        }

        if let Err(e) = std::fs::remove_dir_all(&paths.target_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove {}: {}", paths.target_dir.display(), e);
        }

        tracing::info!("Undeployed {}", deployment.ident);
        Ok(())
    }

    /// Prepare the image mounted for `deployment`.
    pub async fn prepare(
        &self,
        deployment: &Deployment,
        force: bool,
    ) -> Result<PrepareOutcome, DeployError> {
        self.ensure_root()?;
        self.rewriter()
            .prepare(deployment, force)
            .await
            .context(PrepareSnafu)
    }

    /// Switch `deployment` to `mode`.
    pub async fn toggle(&self, deployment: &Deployment, mode: Mode) -> Result<(), DeployError> {
        self.mode_toggle()
            .toggle(deployment, mode)
            .await
            .context(ToggleSnafu { mode })
    }
}
