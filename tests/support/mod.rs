// ABOUTME: Test support utilities.
// ABOUTME: Provides a scripted host, a fake container engine, image fixtures and a catalog mock.

// Each test binary only uses some of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use offspot_demo::config::{Config, EnvValue};
use offspot_demo::engine::{ContainerEngine, EngineError, PruneReport};
use offspot_demo::host::{CommandLine, CommandOutput, Host, HostError};
use offspot_demo::imager::ImagerClient;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("offspot_demo=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const IMAGE_YAML: &str = r#"
name: Wikipedia hotspot
offspot:
  containers:
    services:
      reverse-proxy:
        image: ghcr.io/offspot/reverse-proxy:1.7
        container_name: reverse-proxy
        network_mode: host
        cap_add:
          - NET_ADMIN
        environment:
          FQDN: generic.hotspot
          SERVICES: kiwix,files
          FILES_MAPPING: "edupi:edupi/files"
          PROTECTED_SERVICES: generic.hotspot
        volumes:
          - /data/contents:/data:ro
          - /var/log:/var/log
          - /etc/ssl:/etc/ssl:ro
      home-portal:
        image: ghcr.io/offspot/captive-portal:1.4
        privileged: true
        ports:
          - "80:80"
        environment:
          - HOTSPOT_FQDN=generic.hotspot
      kiwix:
        image: ghcr.io/offspot/kiwix-serve:3.7.0
        volumes:
          - type: bind
            source: /data/zims
            target: /data
            read_only: true
    networks:
      default:
        name: offspot
oci_images:
  - ident: ghcr.io/offspot/reverse-proxy:1.7
  - ident: ghcr.io/offspot/captive-portal:1.4
  - ident: ghcr.io/offspot/kiwix-serve:3.7.0
"#;

pub const DASHBOARD_YAML: &str = r#"
metadata:
  name: Wikipedia
  fqdn: generic.hotspot
packages:
  - ident: wikipedia_en_all
    url: //kiwix.generic.hotspot/viewer#wikipedia_en_all
    download:
      url: //files.generic.hotspot/zims/wikipedia_en_all.zim
readers:
  - platform: android
    download_url: http://files.generic.hotspot/kiwix.apk
links:
  - name: Home
    url: https://generic.hotspot/
"#;

/// Documents found on the data partition of a fake image.
#[derive(Debug, Clone)]
pub struct ImageFixture {
    pub image_yaml: String,
    pub dashboard_yaml: String,
}

impl Default for ImageFixture {
    fn default() -> Self {
        Self {
            image_yaml: IMAGE_YAML.to_string(),
            dashboard_yaml: DASHBOARD_YAML.to_string(),
        }
    }
}

impl ImageFixture {
    pub fn write_into(&self, dir: &Path) {
        std::fs::create_dir_all(dir.join("contents")).unwrap();
        std::fs::write(dir.join("image.yaml"), &self.image_yaml).unwrap();
        std::fs::write(dir.join("contents/dashboard.yaml"), &self.dashboard_yaml).unwrap();
    }
}

pub const DEFAULT_PAYLOAD: &[u8] = b"offspot image payload";

#[derive(Debug)]
pub struct FakeState {
    pub root: bool,
    pub calls: Vec<CommandLine>,
    /// (device, canonical backing file)
    pub attached: Vec<(PathBuf, PathBuf)>,
    pub mounted: HashMap<PathBuf, (u64, u64)>,
    /// Content of each fake image partition, keyed by the image's (dev, inode).
    pub disks: HashMap<(u64, u64), PathBuf>,
    pub fixture: ImageFixture,
    pub payload: Vec<u8>,
    pub download_exit_code: i32,
    /// Compose manifests (link targets) whose project is up.
    pub running: HashSet<PathBuf>,
    /// Manifest file names whose containers exit right after start.
    pub crashing: HashSet<String>,
    /// Command prefixes that fail with the given exit code.
    pub failing: Vec<(String, i32)>,
}

/// A host whose tools are simulated inside a temporary directory.
///
/// Loop devices are files under `<root>/dev`; mounting copies the image's
/// partition content into the mount point and unmounting stores it back.
pub struct FakeHost {
    root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new(root: &Path) -> Self {
        std::fs::create_dir_all(root.join("dev")).unwrap();
        std::fs::create_dir_all(root.join("disks")).unwrap();
        Self {
            root: root.to_path_buf(),
            state: Mutex::new(FakeState {
                root: true,
                calls: Vec::new(),
                attached: Vec::new(),
                mounted: HashMap::new(),
                disks: HashMap::new(),
                fixture: ImageFixture::default(),
                payload: DEFAULT_PAYLOAD.to_vec(),
                download_exit_code: 0,
                running: HashSet::new(),
                crashing: HashSet::new(),
                failing: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn set_root(&self, root: bool) {
        self.state.lock().root = root;
    }

    pub fn fail(&self, prefix: &str, exit_code: i32) {
        self.state.lock().failing.push((prefix.to_string(), exit_code));
    }

    pub fn crash_on(&self, manifest_file_name: &str) {
        self.state
            .lock()
            .crashing
            .insert(manifest_file_name.to_string());
    }

    /// Commands run so far, rendered as strings.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().calls.iter().map(|c| c.to_string()).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().mounted.contains_key(path)
    }

    pub fn attached_count(&self) -> usize {
        self.state.lock().attached.len()
    }

    pub fn is_running(&self, manifest: &Path) -> bool {
        self.state.lock().running.contains(manifest)
    }

    fn simulate(&self, state: &mut FakeState, command: &CommandLine) -> CommandOutput {
        let args: Vec<&str> = command.get_args().iter().map(String::as_str).collect();
        match (command.program(), args.as_slice()) {
            ("losetup", ["-f"]) => {
                let used: HashSet<&PathBuf> = state.attached.iter().map(|(d, _)| d).collect();
                let device = (0..)
                    .map(|n| self.root.join("dev").join(format!("loop{n}")))
                    .find(|d| !used.contains(d))
                    .unwrap();
                CommandOutput::ok(format!("{}\n", device.display()))
            }
            ("losetup", ["--partscan", device, image]) => {
                let Ok(image) = std::fs::canonicalize(image) else {
                    return CommandOutput::failed(1, "losetup: cannot find image");
                };
                std::fs::write(device, "").unwrap();
                for n in 1..=3 {
                    std::fs::write(format!("{device}p{n}"), "").unwrap();
                }
                state.attached.push((PathBuf::from(*device), image));
                CommandOutput::ok("")
            }
            ("losetup", ["--json"]) => {
                if state.attached.is_empty() {
                    return CommandOutput::ok("");
                }
                let devices: Vec<serde_json::Value> = state
                    .attached
                    .iter()
                    .map(|(device, back)| {
                        serde_json::json!({"name": device, "back-file": back})
                    })
                    .collect();
                CommandOutput::ok(serde_json::json!({ "loopdevices": devices }).to_string())
            }
            ("losetup", ["--detach", device]) => {
                let before = state.attached.len();
                state.attached.retain(|(d, _)| d != Path::new(device));
                if state.attached.len() == before {
                    return CommandOutput::failed(1, "losetup: no such device");
                }
                CommandOutput::ok("")
            }
            ("mount", ["-t", "ext4", node, mount_point]) => {
                let mount_point = PathBuf::from(mount_point);
                if !mount_point.is_dir() {
                    return CommandOutput::failed(32, "mount point does not exist");
                }
                let device = node.trim_end_matches(char::is_numeric).trim_end_matches('p');
                let Some((_, back)) = state
                    .attached
                    .iter()
                    .find(|(d, _)| d == Path::new(device))
                else {
                    return CommandOutput::failed(32, "special device does not exist");
                };
                let meta = std::fs::metadata(back).unwrap();
                let key = (meta.dev(), meta.ino());
                match state.disks.get(&key) {
                    Some(stored) => copy_tree(stored, &mount_point),
                    None => state.fixture.write_into(&mount_point),
                }
                state.mounted.insert(mount_point, key);
                CommandOutput::ok("")
            }
            ("umount", [mount_point]) => {
                let mount_point = PathBuf::from(mount_point);
                let Some(key) = state.mounted.remove(&mount_point) else {
                    return CommandOutput::failed(32, "not mounted");
                };
                let stored = self
                    .root
                    .join("disks")
                    .join(format!("{}-{}", key.0, key.1));
                let _ = std::fs::remove_dir_all(&stored);
                copy_tree(&mount_point, &stored);
                clear_dir(&mount_point);
                state.disks.insert(key, stored);
                CommandOutput::ok("")
            }
            ("mountpoint", ["-q", path]) => {
                if state.mounted.contains_key(Path::new(path)) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            ("sync", ["-f", _]) | ("mknod", _) => CommandOutput::ok(""),
            ("aria2c", _) => self.download(state, command),
            ("docker", ["compose", "-f", manifest, rest @ ..]) => {
                let link = Path::new(manifest);
                let target = std::fs::read_link(link).unwrap_or_else(|_| link.to_path_buf());
                match rest {
                    ["up", ..] => {
                        if !target.exists() {
                            return CommandOutput::failed(1, "no such file");
                        }
                        state.running.insert(target);
                        CommandOutput::ok("")
                    }
                    ["down", ..] => {
                        state.running.remove(&target);
                        CommandOutput::ok("")
                    }
                    ["ps", ..] => {
                        if !state.running.contains(&target) {
                            return CommandOutput::ok("");
                        }
                        let crashed = target
                            .file_name()
                            .is_some_and(|n| state.crashing.contains(&*n.to_string_lossy()));
                        let container_state = if crashed { "exited" } else { "running" };
                        CommandOutput::ok(format!(
                            "{{\"Name\":\"demo-1\",\"State\":\"{container_state}\"}}\n"
                        ))
                    }
                    _ => CommandOutput::failed(1, "unsupported compose command"),
                }
            }
            ("docker", ["exec", ..]) => CommandOutput::ok(""),
            _ => CommandOutput::failed(127, format!("{}: command not found", command.program())),
        }
    }

    fn download(&self, state: &mut FakeState, command: &CommandLine) -> CommandOutput {
        if state.download_exit_code != 0 {
            return CommandOutput::failed(state.download_exit_code, "download failed");
        }
        let (Some(dir), Some(out)) = (command.flag_value("--dir"), command.flag_value("--out"))
        else {
            return CommandOutput::failed(28, "missing --dir or --out");
        };
        if let Some(expected) = command
            .flag_value("--checksum")
            .and_then(|c| c.strip_prefix("md5="))
            && format!("{:x}", md5::compute(&state.payload)) != expected
        {
            return CommandOutput::failed(32, "checksum validation failed");
        }
        std::fs::write(Path::new(dir).join(out), &state.payload).unwrap();
        CommandOutput::ok("")
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn exec(&self, command: &CommandLine) -> Result<CommandOutput, HostError> {
        let mut state = self.state.lock();
        state.calls.push(command.clone());

        let rendered = command.to_string();
        if let Some((_, code)) = state
            .failing
            .iter()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
        {
            return Ok(CommandOutput::failed(*code, "scripted failure"));
        }
        Ok(self.simulate(&mut state, command))
    }

    fn is_root(&self) -> bool {
        self.state.lock().root
    }
}

fn copy_tree(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let dest = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &dest);
        } else {
            std::fs::copy(entry.path(), dest).unwrap();
        }
    }
}

fn clear_dir(dir: &Path) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
    }
}

/// Container engine recording pulls and prunes.
#[derive(Default)]
pub struct FakeEngine {
    pub pulls: Mutex<Vec<String>>,
    pub prunes: Mutex<usize>,
    pub fail_pulls: bool,
    pub fail_prune: bool,
}

impl FakeEngine {
    pub fn pulled(&self) -> Vec<String> {
        self.pulls.lock().clone()
    }

    pub fn prune_count(&self) -> usize {
        *self.prunes.lock()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        self.pulls.lock().push(reference.to_string());
        if self.fail_pulls {
            return Err(EngineError::Pull {
                image: reference.to_string(),
                reason: "registry unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn prune_unlabelled(&self, _keep_label: &str) -> Result<PruneReport, EngineError> {
        *self.prunes.lock() += 1;
        if self.fail_prune {
            return Err(EngineError::Prune("engine unreachable".to_string()));
        }
        Ok(PruneReport::default())
    }
}

/// Configuration rooted in `root`, talking to the catalog at `imager_url`.
pub fn test_config(root: &Path, imager_url: &str) -> Config {
    let mut config = Config::default();
    config.paths.target_root = root.join("data");
    config.paths.images_root = root.join("demo");
    config.paths.compose_root = root.join("compose");
    config.paths.log_root = root.join("log");
    config.paths.state_dir = root.join("state");
    config.paths.maint_build_dir = root.join("maint-compose");
    config.paths.sysfs_block = root.join("sys/block");
    config.imager.api_url = imager_url.to_string();
    config.imager.username = EnvValue::Literal(String::new());
    config.imager.password = EnvValue::Literal(String::new());
    config.imager.http_timeout = Duration::from_secs(5);
    config.startup_grace = Duration::ZERO;
    config
}

pub fn imager_client(config: &Config) -> ImagerClient {
    ImagerClient::new(&config.imager, None).unwrap()
}

/// URL the catalog mock advertises for `ident`.
pub fn image_download_url(server: &MockServer, ident: &str, version: &str) -> String {
    format!("{}/images/{}_{}.img", server.uri(), ident, version)
}

/// Publish `payload` as the current image of `ident`, with a plain MD5 ETag.
pub async fn publish_image(server: &MockServer, ident: &str, version: &str, payload: &[u8]) {
    let url = image_download_url(server, ident, version);
    Mock::given(method("GET"))
        .and(path(format!("/auto-images/{ident}/json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "http_url": url,
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/images/{ident}_{version}.img")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", format!("\"{:x}\"", md5::compute(payload)).as_str())
                .set_body_bytes(payload.to_vec()),
        )
        .mount(server)
        .await;
}
