// ABOUTME: Container engine operations that go through the Docker API rather than compose.
// ABOUTME: Image pulls and pruning, via bollard on the local engine socket.

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{CreateImageOptions, PruneContainersOptions, PruneImagesOptions};
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to container engine: {0}")]
    Connection(String),

    #[error("failed to pull {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("failed to prune: {0}")]
    Prune(String),
}

/// What a prune pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub containers_removed: usize,
    pub images_removed: usize,
    pub space_reclaimed: u64,
}

/// Engine-level operations used while deploying.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull `reference` into the local image store.
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Remove stopped containers and unused images, except those carrying
    /// `keep_label`.
    async fn prune_unlabelled(&self, keep_label: &str) -> Result<PruneReport, EngineError>;
}

/// [`ContainerEngine`] backed by the Docker API on a unix socket.
pub struct BollardEngine {
    client: Docker,
    platform: String,
}

impl BollardEngine {
    /// Connect lazily: the socket is only opened on the first request.
    ///
    /// Pulls target `platform`, or the engine's own when it is empty.
    pub fn connect(socket: &str, platform: &str) -> Result<Self, EngineError> {
        let client = Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| EngineError::Connection(format!("{}: {}", socket, e)))?;
        Ok(Self {
            client,
            platform: platform.to_string(),
        })
    }
}

fn pull_options(reference: &str, platform: &str) -> CreateImageOptions {
    CreateImageOptions {
        from_image: Some(reference.to_string()),
        platform: platform.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        tracing::info!("Pulling {} for {}", reference, self.platform);
        let opts = pull_options(reference, &self.platform);

        // Pull returns a stream of progress updates - consume it
        let mut stream = self.client.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EngineError::Pull {
                image: reference.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn prune_unlabelled(&self, keep_label: &str) -> Result<PruneReport, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label!".to_string(), vec![keep_label.to_string()]);

        let containers = self
            .client
            .prune_containers(Some(PruneContainersOptions {
                filters: Some(filters.clone()),
                ..Default::default()
            }))
            .await
            .map_err(|e| EngineError::Prune(format!("containers: {}", e)))?;

        let images = self
            .client
            .prune_images(Some(PruneImagesOptions {
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| EngineError::Prune(format!("images: {}", e)))?;

        let reclaimed = containers.space_reclaimed.unwrap_or_default()
            + images.space_reclaimed.unwrap_or_default();
        Ok(PruneReport {
            containers_removed: containers.containers_deleted.map_or(0, |c| c.len()),
            images_removed: images.images_deleted.map_or(0, |i| i.len()),
            space_reclaimed: u64::try_from(reclaimed).unwrap_or_default(),
        })
    }
}
