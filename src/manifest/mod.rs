// ABOUTME: Prepares a mounted hotspot image to run as an isolated public demo.
// ABOUTME: Rewrites its dashboard and compose manifest, pulls its OCI images, marks it prepared.

mod compose;
mod dashboard;

pub use compose::{ComposeManifest, ComposeService, Environment, LongVolume, VolumeSpec};
pub use dashboard::Dashboard;

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::registry::Deployment;
use crate::types::ImageRef;
use serde::Deserialize;
use serde_yaml::Value;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Image-side documents, relative to the mounted data partition.
pub const IMAGE_DOCUMENT: &str = "image.yaml";
pub const DASHBOARD_DOCUMENT: &str = "contents/dashboard.yaml";

/// Root of hotspot data inside the image's manifest.
const IMAGE_DATA_ROOT: &str = "/data";
const SYSTEM_LOG_DIR: &str = "/var/log";

const EDGE_PROXY_SERVICE: &str = "reverse-proxy";
const EDGE_PROXY_IMAGE: &str = "ghcr.io/offspot/reverse-proxy";
const METRICS_SERVICE: &str = "metrics";
const METRICS_IMAGE: &str = "ghcr.io/offspot/metrics";
const CAPTIVE_PORTAL_SERVICE: &str = "home-portal";
const CAPTIVE_PORTAL_IMAGE: &str = "ghcr.io/offspot/captive-portal";

/// Environment keys left untouched by FQDN substitution.
const PROTECTED_ENV_KEYS: [&str; 1] = ["PROTECTED_SERVICES"];

/// Known-bad image tags and their replacement.
const TAG_CORRECTIONS: [(&str, &str, &str); 1] = [(EDGE_PROXY_IMAGE, "1.7", "1.8")];

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("missing {}", .0.display())]
    MissingDocument(PathBuf),

    #[error("invalid {}: {source}", .path.display())]
    InvalidDocument {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{} has no offspot.containers section", .0.display())]
    MissingContainers(PathBuf),

    #[error("{} has an empty metadata.fqdn", .0.display())]
    MissingFqdn(PathBuf),

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PrepareError + '_ {
    move |source| PrepareError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ImageDocument {
    #[serde(default)]
    offspot: Option<OffspotSection>,
    #[serde(default)]
    oci_images: Vec<OciImage>,
}

#[derive(Debug, Default, Deserialize)]
struct OffspotSection {
    #[serde(default)]
    containers: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OciImage {
    ident: String,
}

/// Result of [`ManifestRewriter::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Prepared earlier; nothing was touched.
    AlreadyPrepared,
    Prepared {
        subdomains: Vec<String>,
        pulled: usize,
        pull_failures: usize,
    },
}

/// Deployment-specific values substituted into an image's manifests.
#[derive(Debug, Clone)]
pub struct RewriteContext<'a> {
    pub ident: &'a str,
    pub fqdn: &'a str,
    pub original_fqdn: &'a str,
    pub target_dir: &'a Path,
    pub log_dir: &'a Path,
    pub http_port: u16,
    pub captive_http_port: u16,
    pub tls_email: &'a str,
}

/// What [`isolate`] found while rewriting a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub subdomains: Vec<String>,
    pub uses_log_dir: bool,
}

fn image_repository(service: &ComposeService) -> Option<String> {
    service
        .image
        .as_deref()
        .and_then(|image| ImageRef::parse(image).ok())
        .map(|image| image.repository().to_string())
}

fn is_service(name: &str, service: &ComposeService, expected_name: &str, image: &str) -> bool {
    name == expected_name && image_repository(service).as_deref() == Some(image)
}

/// Map a volume onto the host, or drop it (`None`).
fn remap_volume(
    name: &str,
    service: &ComposeService,
    volume: &VolumeSpec,
    ctx: &RewriteContext<'_>,
    summary: &mut RewriteSummary,
) -> Option<VolumeSpec> {
    let source = volume.source()?;

    if let Ok(relative) = Path::new(source).strip_prefix(IMAGE_DATA_ROOT) {
        let host_path = if relative.as_os_str().is_empty() {
            ctx.target_dir.to_path_buf()
        } else {
            ctx.target_dir.join(relative)
        };
        return Some(volume.with_source(&host_path.to_string_lossy()));
    }

    let logs_consumer = is_service(name, service, EDGE_PROXY_SERVICE, EDGE_PROXY_IMAGE)
        || is_service(name, service, METRICS_SERVICE, METRICS_IMAGE);
    if source == SYSTEM_LOG_DIR && logs_consumer {
        summary.uses_log_dir = true;
        return Some(volume.with_source(&ctx.log_dir.to_string_lossy()));
    }

    tracing::debug!("Dropping volume {} of service {}", source, name);
    None
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Rewrite `manifest` in place so it runs side by side with other deployments.
///
/// Volumes are confined to the target directory, privileges and host
/// networking are removed, only the edge proxy and captive portal publish a
/// port, and the original FQDN is replaced in environments.
pub fn isolate(manifest: &mut ComposeManifest, ctx: &RewriteContext<'_>) -> RewriteSummary {
    let mut summary = RewriteSummary::default();
    manifest.name = Some(format!("offspot_{}", ctx.ident));

    for (name, service) in &mut manifest.services {
        let name = name.as_str();
        service.container_name = None;

        let volumes = std::mem::take(&mut service.volumes);
        service.volumes = volumes
            .iter()
            .filter_map(|volume| remap_volume(name, service, volume, ctx, &mut summary))
            .collect();

        service.cap_add = None;
        service.network_mode = None;
        service.privileged = None;

        service.ports = if is_service(name, service, EDGE_PROXY_SERVICE, EDGE_PROXY_IMAGE) {
            Some(vec![Value::String(format!("{}:80", ctx.http_port))])
        } else if is_service(name, service, CAPTIVE_PORTAL_SERVICE, CAPTIVE_PORTAL_IMAGE) {
            Some(vec![Value::String(format!("{}:80", ctx.captive_http_port))])
        } else {
            None
        };

        if let Some(environment) = service.environment.as_mut()
            && !ctx.original_fqdn.is_empty()
        {
            environment.rewrite_values(&PROTECTED_ENV_KEYS, |value| {
                value.replace(ctx.original_fqdn, ctx.fqdn)
            });
        }

        if name == EDGE_PROXY_SERVICE {
            let environment = service
                .environment
                .get_or_insert_with(|| Environment::Map(Default::default()));
            environment.set("DEMO_TLS_EMAIL", ctx.tls_email);
            environment.set("IS_ONLINE_DEMO", "false");
            environment.set("FQDN", ctx.fqdn);

            summary.subdomains.extend(split_list(environment.get("SERVICES")));
            summary.subdomains.extend(
                split_list(environment.get("FILES_MAPPING"))
                    .into_iter()
                    .filter_map(|mapping| {
                        let subdomain = mapping.split(':').next().unwrap_or_default();
                        (!subdomain.is_empty()).then(|| subdomain.to_string())
                    }),
            );
        }
    }

    manifest.remove_shared_resources();
    summary
}

/// Replacement for image references with a known-bad tag.
pub fn correct_image_tag(reference: &str) -> String {
    let Ok(image) = ImageRef::parse(reference) else {
        return reference.to_string();
    };
    for (repository, bad, good) in TAG_CORRECTIONS {
        if image.repository() == repository && image.tag() == Some(bad) {
            return image.with_tag(good).to_string();
        }
    }
    reference.to_string()
}

fn read_document(path: &Path) -> Result<String, PrepareError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            PrepareError::MissingDocument(path.to_path_buf())
        } else {
            PrepareError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn parse_document<T: serde::de::DeserializeOwned>(
    path: &Path,
    content: &str,
) -> Result<T, PrepareError> {
    serde_yaml::from_str(content).map_err(|source| PrepareError::InvalidDocument {
        path: path.to_path_buf(),
        source,
    })
}

/// Turns a mounted image into a deployment-ready compose project.
pub struct ManifestRewriter<'a, E: ContainerEngine> {
    config: &'a Config,
    engine: &'a E,
}

impl<'a, E: ContainerEngine> ManifestRewriter<'a, E> {
    pub fn new(config: &'a Config, engine: &'a E) -> Self {
        Self { config, engine }
    }

    /// Prepare the image mounted at the deployment's target directory.
    ///
    /// Already-prepared targets are left alone unless `force` is set. All
    /// parsing and rewriting happens before anything is written, so a
    /// failure leaves the previous files in place.
    pub async fn prepare(
        &self,
        deployment: &Deployment,
        force: bool,
    ) -> Result<PrepareOutcome, PrepareError> {
        if deployment.is_prepared() && !force {
            tracing::info!("{} is already prepared", deployment.ident);
            return Ok(PrepareOutcome::AlreadyPrepared);
        }

        let target_dir = &deployment.paths.target_dir;
        let dashboard_path = target_dir.join(DASHBOARD_DOCUMENT);
        let image_path = target_dir.join(IMAGE_DOCUMENT);

        let mut dashboard: Dashboard =
            parse_document(&dashboard_path, &read_document(&dashboard_path)?)?;
        let image: ImageDocument = parse_document(&image_path, &read_document(&image_path)?)?;

        let original_fqdn = dashboard.original_fqdn().to_string();
        if original_fqdn.is_empty() {
            return Err(PrepareError::MissingFqdn(dashboard_path));
        }

        let containers = image
            .offspot
            .and_then(|offspot| offspot.containers)
            .filter(|containers| !containers.is_null())
            .ok_or_else(|| PrepareError::MissingContainers(image_path.clone()))?;
        let mut manifest: ComposeManifest =
            serde_yaml::from_value(containers).map_err(|source| PrepareError::InvalidDocument {
                path: image_path.clone(),
                source,
            })?;

        dashboard.retarget(&deployment.fqdn);
        let summary = isolate(
            &mut manifest,
            &RewriteContext {
                ident: deployment.ident.as_str(),
                fqdn: &deployment.fqdn,
                original_fqdn: &original_fqdn,
                target_dir,
                log_dir: &deployment.paths.log_dir,
                http_port: deployment.http_port,
                captive_http_port: deployment.captive_http_port,
                tls_email: &self.config.tls_email,
            },
        );

        let dashboard_yaml =
            serde_yaml::to_string(&dashboard).map_err(|source| PrepareError::Serialize {
                what: "dashboard",
                source,
            })?;
        let manifest_yaml =
            serde_yaml::to_string(&manifest).map_err(|source| PrepareError::Serialize {
                what: "compose manifest",
                source,
            })?;

        let mut pulled = 0;
        let mut pull_failures = 0;
        for oci_image in &image.oci_images {
            let reference = correct_image_tag(&oci_image.ident);
            match self.engine.pull_image(&reference).await {
                Ok(()) => pulled += 1,
                Err(e) => {
                    tracing::warn!("{}", e);
                    pull_failures += 1;
                }
            }
        }

        if summary.uses_log_dir {
            let log_dir = &deployment.paths.log_dir;
            std::fs::create_dir_all(log_dir).map_err(io_error(log_dir))?;
        }
        std::fs::write(&dashboard_path, dashboard_yaml).map_err(io_error(&dashboard_path))?;

        let compose_dir = &deployment.paths.compose_dir;
        std::fs::create_dir_all(compose_dir).map_err(io_error(compose_dir))?;
        let compose_path = deployment.paths.image_compose_path();
        std::fs::write(&compose_path, &manifest_yaml).map_err(io_error(&compose_path))?;
        tracing::debug!("Wrote {}:\n{}", compose_path.display(), manifest_yaml);

        let subdomains_path = deployment.paths.subdomains_path();
        deployment
            .persist_subdomains(&summary.subdomains)
            .map_err(io_error(&subdomains_path))?;

        let marker = deployment.paths.prepared_marker_path();
        std::fs::write(&marker, "").map_err(io_error(&marker))?;

        tracing::info!(
            "Prepared {} ({} image(s) pulled, {} failed)",
            deployment.ident,
            pulled,
            pull_failures
        );
        Ok(PrepareOutcome::Prepared {
            subdomains: summary.subdomains,
            pulled,
            pull_failures,
        })
    }
}
