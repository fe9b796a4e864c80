// ABOUTME: Typed view of the hotspot dashboard configuration (contents/dashboard.yaml).
// ABOUTME: Rewrites every URL carrying the image's original FQDN to the public demo FQDN.

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub metadata: DashboardMetadata,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<Package>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readers: Vec<Reader>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardMetadata {
    pub fqdn: String,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<PackageDownload>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDownload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

fn retarget_url(url: &mut Option<String>, from: &str, to: &str) {
    if let Some(url) = url {
        *url = url.replace(from, to);
    }
}

impl Dashboard {
    /// FQDN the image was built for.
    pub fn original_fqdn(&self) -> &str {
        &self.metadata.fqdn
    }

    /// Point the dashboard at `fqdn`: metadata, package, reader and link URLs.
    pub fn retarget(&mut self, fqdn: &str) {
        let original = std::mem::replace(&mut self.metadata.fqdn, fqdn.to_string());
        if original.is_empty() {
            return;
        }

        for package in &mut self.packages {
            retarget_url(&mut package.url, &original, fqdn);
            if let Some(download) = &mut package.download {
                retarget_url(&mut download.url, &original, fqdn);
            }
        }
        for reader in &mut self.readers {
            retarget_url(&mut reader.download_url, &original, fqdn);
        }
        for link in &mut self.links {
            retarget_url(&mut link.url, &original, fqdn);
        }
    }
}
