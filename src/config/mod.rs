// ABOUTME: Configuration types and parsing for /etc/offspot-demo/config.yml.
// ABOUTME: Every field has a default, so an empty or missing file is a valid configuration.

mod env_value;

pub use env_value::EnvValue;

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH: &str = "/etc/offspot-demo/config.yml";
pub const CONFIG_PATH_ALT: &str = "/etc/offspot-demo/config.yaml";

/// Overrides `demos` when set, so the deployment list can be injected by the
/// service manager.
pub const DEMOS_ENV_VAR: &str = "OFFSPOT_DEMOS_LIST";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parent domain; each deployment is served at `<alias>.<main_fqdn>`.
    pub main_fqdn: String,

    /// Deployment list: comma-separated `ident[:alias[:name[:sub|sub]]]` entries.
    pub demos: String,

    /// Contact address handed to the edge proxy for certificate requests.
    pub tls_email: String,

    pub paths: PathsConfig,
    pub imager: ImagerConfig,
    pub docker: DockerConfig,
    pub download: DownloadConfig,
    pub proxy: ProxyConfig,

    /// Time given to containers to settle before their health is checked.
    #[serde(with = "humantime_serde")]
    pub startup_grace: Duration,

    /// Age after which an abandoned lock file is broken automatically.
    #[serde(with = "humantime_serde")]
    pub lock_stale_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            main_fqdn: "demo.hotspot.kiwix.org".to_string(),
            demos: String::new(),
            tls_email: "dev@kiwix.org".to_string(),
            paths: PathsConfig::default(),
            imager: ImagerConfig::default(),
            docker: DockerConfig::default(),
            download: DownloadConfig::default(),
            proxy: ProxyConfig::default(),
            startup_grace: Duration::from_secs(30),
            lock_stale_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Mount points, one `<ident>` directory per deployment.
    pub target_root: PathBuf,
    /// Downloaded images, one `<ident>/image.img` per deployment.
    pub images_root: PathBuf,
    /// Compose manifests and the active-mode symlink, per deployment.
    pub compose_root: PathBuf,
    /// Parent of the per-deployment log directories.
    pub log_root: PathBuf,
    /// Lock file location.
    pub state_dir: PathBuf,
    /// Build context of the maintenance placeholder container.
    pub maint_build_dir: PathBuf,
    /// Kernel block device metadata.
    pub sysfs_block: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from("/data"),
            images_root: PathBuf::from("/demo"),
            compose_root: PathBuf::from("/etc/offspot-demo/compose"),
            log_root: PathBuf::from("/var/log"),
            state_dir: PathBuf::from("/var/lib/offspot-demo"),
            maint_build_dir: PathBuf::from("/usr/share/offspot-demo/maint-compose"),
            sysfs_block: PathBuf::from("/sys/block"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagerConfig {
    pub api_url: String,
    pub username: EnvValue,
    pub password: EnvValue,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

impl Default for ImagerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.imager.kiwix.org".to_string(),
            username: EnvValue::from_env_or_empty("IMAGER_SERVICE_API_USERNAME"),
            password: EnvValue::from_env_or_empty("IMAGER_SERVICE_API_PASSWORD"),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl ImagerConfig {
    /// Resolved credentials, or `None` when either part is empty.
    pub fn credentials(&self) -> Result<Option<(String, String)>> {
        let username = self.username.resolve()?;
        let password = self.password.resolve()?;
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }
        Ok(Some((username, password)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Engine API socket, used for image pulls and pruning.
    pub socket: String,
    /// Program providing the `compose` subcommand.
    pub compose_program: String,
    /// Label carried by the maintenance container and image; exempt from pruning.
    pub maint_label: String,
    /// OCI platform images are pulled for. Empty leaves the choice to the engine.
    pub platform: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: "/var/run/docker.sock".to_string(),
            compose_program: "docker".to_string(),
            maint_label: "org.kiwix.offspot-demo.maint".to_string(),
            platform: "linux/arm64".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub program: String,
    pub extra_args: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            program: "aria2c".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Command regenerating the edge proxy; the deployment string is appended.
    /// An empty command disables proxy reconfiguration.
    pub command: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            command: ["docker", "exec", "multi-proxy", "gen-server", "--demos"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // serde_yaml rejects an empty document; treat it as all defaults.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ConfigNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_yaml(&content)
    }

    /// Load `explicit` if given, else the first default location that exists,
    /// else built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        for path in [CONFIG_PATH, CONFIG_PATH_ALT].map(Path::new) {
            if path.exists() {
                return Self::load(path);
            }
        }

        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Apply environment overrides on top of the file configuration.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(demos) = std::env::var(DEMOS_ENV_VAR) {
            self.demos = demos;
        }
        self
    }
}
