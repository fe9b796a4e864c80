// ABOUTME: Tests for preparing a mounted image as an isolated demo.
// ABOUTME: Checks the rewritten compose manifest, dashboard, pulls and preparation marker.

mod support;

use offspot_demo::config::Config;
use offspot_demo::manifest::{
    ComposeManifest, Dashboard, ManifestRewriter, PrepareError, PrepareOutcome, VolumeSpec,
};
use offspot_demo::registry::{Deployment, DeploymentRegistry};
use support::*;
use tempfile::TempDir;

struct Setup {
    _dir: TempDir,
    config: Config,
    deployment: Deployment,
    engine: FakeEngine,
}

fn setup(fixture: ImageFixture) -> Setup {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "http://imager.invalid");
    let registry = DeploymentRegistry::parse("wikipedia:wp", &config).unwrap();
    let deployment = registry.get("wikipedia").unwrap().clone();
    fixture.write_into(&deployment.paths.target_dir);

    Setup {
        _dir: dir,
        config,
        deployment,
        engine: FakeEngine::default(),
    }
}

impl Setup {
    async fn prepare(&self, force: bool) -> Result<PrepareOutcome, PrepareError> {
        ManifestRewriter::new(&self.config, &self.engine)
            .prepare(&self.deployment, force)
            .await
    }

    fn manifest(&self) -> ComposeManifest {
        let content =
            std::fs::read_to_string(self.deployment.paths.image_compose_path()).unwrap();
        serde_yaml::from_str(&content).unwrap()
    }

    fn dashboard(&self) -> Dashboard {
        let path = self.deployment.paths.target_dir.join("contents/dashboard.yaml");
        serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }
}

const FQDN: &str = "wp.demo.hotspot.kiwix.org";

#[tokio::test]
async fn volumes_are_confined_to_the_deployment() {
    let s = setup(ImageFixture::default());
    s.prepare(false).await.unwrap();

    let manifest = s.manifest();
    let target = s.deployment.paths.target_dir.display().to_string();
    let log_dir = s.deployment.paths.log_dir.display().to_string();

    let proxy = manifest.service("reverse-proxy").unwrap();
    assert_eq!(
        proxy.volumes,
        [
            VolumeSpec::Short(format!("{target}/contents:/data:ro")),
            VolumeSpec::Short(format!("{log_dir}:/var/log")),
        ]
    );
    assert!(s.deployment.paths.log_dir.is_dir());

    let kiwix = manifest.service("kiwix").unwrap();
    assert_eq!(kiwix.volumes.len(), 1);
    assert_eq!(kiwix.volumes[0].source(), Some(format!("{target}/zims").as_str()));
}

#[tokio::test]
async fn only_proxy_and_portal_publish_ports() {
    let s = setup(ImageFixture::default());
    s.prepare(false).await.unwrap();

    let manifest = s.manifest();
    assert_eq!(manifest.name.as_deref(), Some("offspot_wikipedia"));

    let proxy = manifest.service("reverse-proxy").unwrap();
    assert_eq!(proxy.ports, Some(vec!["1975:80".into()]));
    assert!(proxy.container_name.is_none());
    assert!(proxy.network_mode.is_none());
    assert!(proxy.cap_add.is_none());

    let portal = manifest.service("home-portal").unwrap();
    assert_eq!(portal.ports, Some(vec!["11975:80".into()]));
    assert!(portal.privileged.is_none());

    assert!(manifest.service("kiwix").unwrap().ports.is_none());
    assert!(!manifest.extra.contains_key("networks"));
}

#[tokio::test]
async fn environment_points_at_public_fqdn() {
    let s = setup(ImageFixture::default());
    s.prepare(false).await.unwrap();

    let manifest = s.manifest();
    let proxy_env = manifest
        .service("reverse-proxy")
        .unwrap()
        .environment
        .as_ref()
        .unwrap();
    assert_eq!(proxy_env.get("FQDN").as_deref(), Some(FQDN));
    assert_eq!(
        proxy_env.get("PROTECTED_SERVICES").as_deref(),
        Some("generic.hotspot")
    );
    assert_eq!(proxy_env.get("IS_ONLINE_DEMO").as_deref(), Some("false"));
    assert_eq!(
        proxy_env.get("DEMO_TLS_EMAIL").as_deref(),
        Some(s.config.tls_email.as_str())
    );

    let portal_env = manifest
        .service("home-portal")
        .unwrap()
        .environment
        .as_ref()
        .unwrap();
    assert_eq!(portal_env.get("HOTSPOT_FQDN").as_deref(), Some(FQDN));
}

#[tokio::test]
async fn dashboard_links_follow_public_fqdn() {
    let s = setup(ImageFixture::default());
    s.prepare(false).await.unwrap();

    let dashboard = s.dashboard();
    assert_eq!(dashboard.original_fqdn(), FQDN);
    assert_eq!(
        dashboard.packages[0].url.as_deref(),
        Some(format!("//kiwix.{FQDN}/viewer#wikipedia_en_all").as_str())
    );
    assert_eq!(
        dashboard.readers[0].download_url.as_deref(),
        Some(format!("http://files.{FQDN}/kiwix.apk").as_str())
    );
    assert_eq!(
        dashboard.links[0].url.as_deref(),
        Some(format!("https://{FQDN}/").as_str())
    );
}

#[tokio::test]
async fn records_subdomains_and_pulls_corrected_images() {
    let s = setup(ImageFixture::default());

    let outcome = s.prepare(false).await.unwrap();
    assert_eq!(
        outcome,
        PrepareOutcome::Prepared {
            subdomains: vec!["kiwix".into(), "files".into(), "edupi".into()],
            pulled: 3,
            pull_failures: 0,
        }
    );
    assert!(s.deployment.is_prepared());
    assert_eq!(
        s.deployment.proxy_entry(),
        "wikipedia:wp:wikipedia:kiwix|files|edupi"
    );
    assert_eq!(
        s.engine.pulled(),
        [
            "ghcr.io/offspot/reverse-proxy:1.8",
            "ghcr.io/offspot/captive-portal:1.4",
            "ghcr.io/offspot/kiwix-serve:3.7.0",
        ]
    );
}

#[tokio::test]
async fn prepared_image_is_left_alone_unless_forced() {
    let s = setup(ImageFixture::default());
    s.prepare(false).await.unwrap();

    assert_eq!(s.prepare(false).await.unwrap(), PrepareOutcome::AlreadyPrepared);
    assert_eq!(s.engine.pulled().len(), 3);

    assert!(matches!(
        s.prepare(true).await.unwrap(),
        PrepareOutcome::Prepared { .. }
    ));
    assert_eq!(s.engine.pulled().len(), 6);
    // The dashboard was already retargeted; preparing again keeps it valid.
    assert_eq!(s.dashboard().original_fqdn(), FQDN);
}

#[tokio::test]
async fn pull_failures_are_counted_not_fatal() {
    let mut s = setup(ImageFixture::default());
    s.engine.fail_pulls = true;

    let outcome = s.prepare(false).await.unwrap();
    assert!(matches!(
        outcome,
        PrepareOutcome::Prepared {
            pulled: 0,
            pull_failures: 3,
            ..
        }
    ));
    assert!(s.deployment.is_prepared());
}

#[tokio::test]
async fn empty_dashboard_fqdn_is_rejected() {
    let s = setup(ImageFixture {
        dashboard_yaml: "metadata:\n  fqdn: \"\"\n".to_string(),
        ..ImageFixture::default()
    });

    let err = s.prepare(false).await.unwrap_err();
    assert!(matches!(err, PrepareError::MissingFqdn(_)), "{err}");
    assert!(!s.deployment.paths.image_compose_path().exists());
    assert!(!s.deployment.is_prepared());
}

#[tokio::test]
async fn image_without_containers_is_rejected() {
    let s = setup(ImageFixture {
        image_yaml: "name: empty\noci_images: []\n".to_string(),
        ..ImageFixture::default()
    });

    let err = s.prepare(false).await.unwrap_err();
    assert!(matches!(err, PrepareError::MissingContainers(_)), "{err}");
    assert!(s.engine.pulled().is_empty());
}

#[tokio::test]
async fn missing_image_document_is_reported() {
    let s = setup(ImageFixture::default());
    std::fs::remove_file(s.deployment.paths.target_dir.join("image.yaml")).unwrap();

    let err = s.prepare(false).await.unwrap_err();
    assert!(matches!(err, PrepareError::MissingDocument(_)), "{err}");
}
