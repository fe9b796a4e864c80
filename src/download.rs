// ABOUTME: Image download through an external downloader with checksum verification.
// ABOUTME: Downloads into a scratch directory next to the destination, then moves into place.

use crate::checksum::{self, ChecksumDigest};
use crate::config::DownloadConfig;
use crate::host::{CommandLine, Host, HostError};
use crate::imager::{ImagerClient, ImagerError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit code reported when a multipart checksum does not match.
pub const CHECKSUM_MISMATCH_EXIT_CODE: i32 = 32;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("downloader exited with code {0}")]
    ToolFailed(i32),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("failed to fetch image checksum: {0}")]
    Checksum(#[from] ImagerError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Host(#[from] HostError),
}

impl DownloadError {
    /// Process exit code: the downloader's own code, 32 on checksum mismatch.
    pub fn exit_code(&self) -> i32 {
        match self {
            DownloadError::ToolFailed(code) => *code,
            DownloadError::ChecksumMismatch { .. } => CHECKSUM_MISMATCH_EXIT_CODE,
            _ => 1,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Fetches images with the configured downloader program.
pub struct ImageDownloader<'a, H: Host> {
    host: &'a H,
    imager: &'a ImagerClient,
    settings: &'a DownloadConfig,
}

impl<'a, H: Host> ImageDownloader<'a, H> {
    pub fn new(host: &'a H, imager: &'a ImagerClient, settings: &'a DownloadConfig) -> Self {
        Self {
            host,
            imager,
            settings,
        }
    }

    fn command(
        &self,
        url: &str,
        dir: &Path,
        file_name: &str,
        digest: &ChecksumDigest,
    ) -> CommandLine {
        let mut command = CommandLine::new(&self.settings.program)
            .arg("--dir")
            .arg(dir.to_string_lossy())
            .arg("--out")
            .arg(file_name);
        // The downloader can only verify plain MD5 digests itself.
        if digest.is_singlepart() {
            command = command
                .arg("--checksum")
                .arg(format!("md5={}", digest.checksum));
        }
        command
            .args(self.settings.extra_args.iter().cloned())
            .arg(url)
            .stream_output()
    }

    /// Download `url` to `destination`, verifying its checksum when advertised.
    ///
    /// Nothing is written at `destination` unless the download completed and
    /// verified; the scratch directory is removed in every case.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<ChecksumDigest, DownloadError> {
        let digest = self.imager.fetch_checksum(url).await?;
        if !digest.found() {
            tracing::warn!("No checksum advertised for {}, skipping verification", url);
        }

        let parent = destination.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;

        let scratch = tempfile::Builder::new()
            .suffix(".aria2")
            .tempdir_in(parent)
            .map_err(io_error(parent))?;
        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.img".to_string());
        let downloaded = scratch.path().join(&file_name);

        tracing::info!("Downloading {} to {}", url, destination.display());
        let output = self
            .host
            .exec(&self.command(url, scratch.path(), &file_name, &digest))
            .await?;
        if !output.success() {
            tracing::error!("Downloader exited with code {}", output.exit_code);
            return Err(DownloadError::ToolFailed(output.exit_code));
        }

        if digest.is_multipart() {
            tracing::info!("Verifying multipart checksum ({} parts)", digest.nb_parts);
            let computed = checksum::compute_s3etag(downloaded.clone(), digest.clone())
                .await
                .map_err(io_error(&downloaded))?;
            let expected = digest.etag();
            if computed != expected {
                tracing::error!("Checksum mismatch: {} != {}", computed, expected);
                return Err(DownloadError::ChecksumMismatch { expected, computed });
            }
        }

        tokio::fs::rename(&downloaded, destination)
            .await
            .map_err(io_error(destination))?;
        if let Err(e) = scratch.close() {
            tracing::warn!("Failed to remove download directory: {}", e);
        }

        tracing::info!("Downloaded {}", destination.display());
        Ok(digest)
    }
}
