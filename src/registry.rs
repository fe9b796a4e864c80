// ABOUTME: Deployment registry built from the configured deployment list.
// ABOUTME: Derives ports, FQDNs and on-disk paths for each deployment.

use crate::config::Config;
use crate::types::{DeploymentIdent, DeploymentIdentError, DnsLabel, DnsLabelError};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker written once an image has been prepared in its target directory.
pub const PREPARED_MARKER: &str = "prepared.ok";
/// Subdomains discovered while preparing, one per line.
pub const SUBDOMAINS_FILE: &str = "subdomains";
/// Active manifest: a symlink to one of the two manifests below.
pub const COMPOSE_FILE: &str = "compose.yaml";
pub const IMAGE_COMPOSE_FILE: &str = "image-compose.yaml";
pub const MAINT_COMPOSE_FILE: &str = "maint-compose.yaml";
pub const IMAGE_FILE: &str = "image.img";
pub const TMP_IMAGE_FILE: &str = "image.img.tmp";
pub const LAST_IMAGE_FILE: &str = "last_image";

const CAPTIVE_PORT_OFFSET: u16 = 10000;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid deployment identifier {value:?}: {source}")]
    InvalidIdent {
        value: String,
        #[source]
        source: DeploymentIdentError,
    },

    #[error("invalid alias {value:?} for {ident}: {source}")]
    InvalidAlias {
        ident: String,
        value: String,
        #[source]
        source: DnsLabelError,
    },

    #[error("deployment {0} is listed more than once")]
    Duplicate(String),
}

/// HTTP port of a deployment's edge proxy: 1024 plus the sum of the
/// identifier's lowercased character codes.
///
/// Different identifiers can map to the same port (anagrams do). Collisions
/// are not detected here; the registry only warns about them.
pub fn port_from(ident: &DeploymentIdent) -> u16 {
    let sum: u32 = ident
        .as_str()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| c as u32)
        .sum();
    // Identifiers are at most 63 ASCII characters, far below u16::MAX.
    (1024 + sum) as u16
}

/// Port of a deployment's captive portal, a fixed offset above its HTTP port.
pub fn captive_port_from(ident: &DeploymentIdent) -> u16 {
    port_from(ident) + CAPTIVE_PORT_OFFSET
}

/// Where a deployment lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPaths {
    pub target_dir: PathBuf,
    pub compose_dir: PathBuf,
    pub image_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl DeploymentPaths {
    pub fn for_ident(ident: &DeploymentIdent, config: &Config) -> Self {
        let paths = &config.paths;
        Self {
            target_dir: paths.target_root.join(ident.as_str()),
            compose_dir: paths.compose_root.join(ident.as_str()),
            image_dir: paths.images_root.join(ident.as_str()),
            log_dir: paths.log_root.join(format!("offspot-demo_{ident}")),
        }
    }

    pub fn image_path(&self) -> PathBuf {
        self.image_dir.join(IMAGE_FILE)
    }

    pub fn tmp_image_path(&self) -> PathBuf {
        self.image_dir.join(TMP_IMAGE_FILE)
    }

    pub fn last_image_path(&self) -> PathBuf {
        self.image_dir.join(LAST_IMAGE_FILE)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.compose_dir.join(COMPOSE_FILE)
    }

    pub fn image_compose_path(&self) -> PathBuf {
        self.compose_dir.join(IMAGE_COMPOSE_FILE)
    }

    pub fn maint_compose_path(&self) -> PathBuf {
        self.compose_dir.join(MAINT_COMPOSE_FILE)
    }

    pub fn prepared_marker_path(&self) -> PathBuf {
        self.target_dir.join(PREPARED_MARKER)
    }

    pub fn subdomains_path(&self) -> PathBuf {
        self.target_dir.join(SUBDOMAINS_FILE)
    }
}

/// One hotspot image exposed as a public demo.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub ident: DeploymentIdent,
    pub alias: DnsLabel,
    pub name: String,
    pub fqdn: String,
    pub http_port: u16,
    pub captive_http_port: u16,
    pub paths: DeploymentPaths,
    /// Subdomains from the configuration, used until the image was prepared.
    pub subdomains: Vec<String>,
    download_url: Option<String>,
}

impl Deployment {
    /// Build a deployment, defaulting alias and name to the identifier.
    pub fn using(
        ident: &str,
        alias: Option<&str>,
        name: Option<&str>,
        subdomains: Vec<String>,
        config: &Config,
    ) -> Result<Self, RegistryError> {
        let ident = DeploymentIdent::new(ident).map_err(|source| RegistryError::InvalidIdent {
            value: ident.to_string(),
            source,
        })?;
        let alias_value = match alias.filter(|a| !a.is_empty()) {
            Some(alias) => alias.to_string(),
            None => default_alias(&ident),
        };
        let alias = DnsLabel::new(&alias_value).map_err(|source| RegistryError::InvalidAlias {
            ident: ident.to_string(),
            value: alias_value.clone(),
            source,
        })?;
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(ident.as_str())
            .to_string();

        Ok(Self {
            fqdn: format!("{}.{}", alias, config.main_fqdn),
            http_port: port_from(&ident),
            captive_http_port: captive_port_from(&ident),
            paths: DeploymentPaths::for_ident(&ident, config),
            ident,
            alias,
            name,
            subdomains,
            download_url: None,
        })
    }

    /// Download URL resolved earlier in this run, if any.
    pub fn download_url(&self) -> Option<&str> {
        self.download_url.as_deref()
    }

    pub fn set_download_url(&mut self, url: impl Into<String>) {
        self.download_url = Some(url.into());
    }

    pub fn is_prepared(&self) -> bool {
        self.paths.prepared_marker_path().exists()
    }

    /// URL of the image currently deployed, recorded after the last refresh.
    pub fn last_image_url(&self) -> Option<String> {
        std::fs::read_to_string(self.paths.last_image_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn write_last_image_url(&self, url: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.paths.image_dir)?;
        std::fs::write(self.paths.last_image_path(), url)
    }

    /// Subdomains recorded by the last preparation, else the configured ones.
    pub fn effective_subdomains(&self) -> Vec<String> {
        match std::fs::read_to_string(self.paths.subdomains_path()) {
            Ok(content) => content
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => self.subdomains.clone(),
        }
    }

    pub fn persist_subdomains(&self, subdomains: &[String]) -> io::Result<()> {
        std::fs::write(self.paths.subdomains_path(), subdomains.join(","))
    }

    /// `ident:alias:name:sub|sub` entry understood by the edge proxy generator.
    pub fn proxy_entry(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.ident,
            self.alias,
            self.name,
            self.effective_subdomains().join("|")
        )
    }
}

/// Alias used when none is configured: the identifier with `_` turned into `-`.
fn default_alias(ident: &DeploymentIdent) -> String {
    ident.as_str().replace('_', "-").trim_matches('-').to_string()
}

/// All deployments configured on this host, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct DeploymentRegistry {
    deployments: Vec<Deployment>,
}

impl DeploymentRegistry {
    /// Parse a comma-separated `ident[:alias[:name[:sub|sub]]]` list.
    pub fn parse(list: &str, config: &Config) -> Result<Self, RegistryError> {
        let mut deployments: Vec<Deployment> = Vec::new();

        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut fields = entry.splitn(4, ':');
            let ident = fields.next().unwrap_or_default();
            let alias = fields.next();
            let name = fields.next();
            let subdomains = fields
                .next()
                .map(|s| {
                    s.split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();

            let deployment = Deployment::using(ident, alias, name, subdomains, config)?;
            if deployments.iter().any(|d| d.ident == deployment.ident) {
                return Err(RegistryError::Duplicate(deployment.ident.to_string()));
            }
            deployments.push(deployment);
        }

        let registry = Self { deployments };
        registry.warn_on_port_collisions();
        Ok(registry)
    }

    fn warn_on_port_collisions(&self) {
        let mut seen: HashMap<u16, &DeploymentIdent> = HashMap::new();
        for deployment in &self.deployments {
            if let Some(other) = seen.insert(deployment.http_port, &deployment.ident) {
                tracing::warn!(
                    "Deployments {} and {} share HTTP port {}",
                    other,
                    deployment.ident,
                    deployment.http_port
                );
            }
        }
    }

    pub fn get(&self, ident: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.ident.as_str() == ident)
    }

    pub fn get_mut(&mut self, ident: &str) -> Option<&mut Deployment> {
        self.deployments
            .iter_mut()
            .find(|d| d.ident.as_str() == ident)
    }

    pub fn contains(&self, ident: &str) -> bool {
        self.get(ident).is_some()
    }

    pub fn idents(&self) -> Vec<DeploymentIdent> {
        self.deployments.iter().map(|d| d.ident.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.iter()
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }

    /// Comma-joined proxy entries of every deployment.
    pub fn proxy_entries(&self) -> String {
        self.deployments
            .iter()
            .map(Deployment::proxy_entry)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Identifiers having a prepared directory under `target_root`.
pub fn prepared_idents(target_root: &Path) -> io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(target_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut idents = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.path().join(PREPARED_MARKER).is_file()
            && let Some(name) = entry.file_name().to_str()
        {
            idents.push(name.to_string());
        }
    }
    idents.sort();
    Ok(idents)
}
