// ABOUTME: Client for the image catalog service that publishes hotspot images.
// ABOUTME: Resolves a deployment identifier to the download URL of its latest image.

use crate::checksum::ChecksumDigest;
use crate::config::ImagerConfig;
use crate::registry::Deployment;
use crate::types::DeploymentIdent;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const USER_AGENT_VALUE: &str = concat!("offspot-demo/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ImagerError {
    #[error("no image published for {0}")]
    NotFound(String),

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected response from {0}")]
    UnexpectedResponse(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct AutoImage {
    #[serde(default)]
    http_url: Option<String>,
}

/// HTTP client for the image catalog.
#[derive(Debug, Clone)]
pub struct ImagerClient {
    http: reqwest::Client,
    api_url: String,
    credentials: Option<(String, String)>,
}

impl ImagerClient {
    /// Build a client. `credentials` are sent to obtain a token before each
    /// catalog lookup; without them lookups are anonymous.
    pub fn new(
        config: &ImagerConfig,
        credentials: Option<(String, String)>,
    ) -> Result<Self, ImagerError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let http = reqwest::Client::builder()
            .connect_timeout(config.http_timeout)
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Shared HTTP client, also used to probe image URLs.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Catalog endpoint describing the latest image for `ident`.
    pub fn image_url(&self, ident: &DeploymentIdent) -> String {
        format!(
            "{}/auto-images/{}/json",
            self.api_url,
            urlencoding::encode(ident.as_str())
        )
    }

    async fn access_token(&self, username: &str, password: &str) -> Result<String, ImagerError> {
        let url = format!("{}/auth/authorize", self.api_url);
        debug!(url = %url, "requesting catalog access token");

        let response = self
            .http
            .post(&url)
            .header("username", username)
            .header("password", password)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ImagerError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|_| ImagerError::UnexpectedResponse(url))?;
        Ok(token.access_token)
    }

    /// Ask the catalog for the current download URL of `ident`.
    pub async fn fetch_download_url(&self, ident: &DeploymentIdent) -> Result<String, ImagerError> {
        let url = self.image_url(ident);
        debug!(url = %url, "resolving download URL");

        let mut request = self.http.get(&url);
        if let Some((username, password)) = &self.credentials {
            let token = self.access_token(username, password).await?;
            request = request.header("token", token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(ImagerError::NotFound(ident.to_string())),
            status if !status.is_success() => {
                return Err(ImagerError::Status {
                    url,
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let image: AutoImage = response
            .json()
            .await
            .map_err(|_| ImagerError::UnexpectedResponse(url.clone()))?;
        image
            .http_url
            .filter(|u| !u.is_empty())
            .ok_or(ImagerError::UnexpectedResponse(url))
    }

    /// Download URL of a deployment, resolved at most once per run.
    pub async fn resolve(&self, deployment: &mut Deployment) -> Result<String, ImagerError> {
        if let Some(url) = deployment.download_url() {
            return Ok(url.to_string());
        }
        self.refresh(deployment).await
    }

    /// Resolve again, replacing any cached URL.
    pub async fn refresh(&self, deployment: &mut Deployment) -> Result<String, ImagerError> {
        let url = self.fetch_download_url(&deployment.ident).await?;
        deployment.set_download_url(url.clone());
        Ok(url)
    }

    /// Whether `url` answers 200. Only headers are read.
    pub async fn is_url_reachable(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("{} is unreachable: {}", url, e);
                false
            }
        }
    }

    /// Checksum advertised for `url`.
    ///
    /// Missing headers or an error status yield the not-found digest; only a
    /// failed request is an error.
    pub async fn fetch_checksum(&self, url: &str) -> Result<ChecksumDigest, ImagerError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            tracing::warn!(
                "{} answered {} to the checksum lookup",
                url,
                response.status().as_u16()
            );
            return Ok(ChecksumDigest::not_found());
        }
        Ok(ChecksumDigest::from_header_map(response.headers()))
    }
}
