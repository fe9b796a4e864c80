// ABOUTME: Error type for deployment lifecycle operations, with SNAFU context selectors.
// ABOUTME: Classifies failures by kind and maps them to process exit codes.

use std::path::PathBuf;

use snafu::Snafu;

use crate::blockdev::BlockDeviceError;
use crate::download::DownloadError;
use crate::host::HostError;
use crate::imager::ImagerError;
use crate::manifest::PrepareError;
use crate::toggle::{Mode, ToggleError};

/// Failure of deploy, undeploy, prepare or refresh.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeployError {
    #[snafu(display("must be run as root"))]
    NotRoot,

    #[snafu(display("unknown deployment: {ident}"))]
    UnknownDeployment { ident: String },

    #[snafu(display("failed to resolve download URL: {source}"))]
    Resolve { source: ImagerError },

    #[snafu(display("image URL is not reachable: {url}"))]
    UnreachableUrl { url: String },

    #[snafu(display("no image to reuse at {}", path.display()))]
    MissingImage { path: PathBuf },

    #[snafu(display("failed to download image: {source}"))]
    Download { source: DownloadError },

    #[snafu(display("failed to switch to {mode} mode: {source}"))]
    Toggle { mode: Mode, source: ToggleError },

    #[snafu(display("block device operation failed: {source}"))]
    BlockDevice { source: BlockDeviceError },

    #[snafu(display("failed to prepare image: {source}"))]
    Prepare { source: PrepareError },

    #[snafu(display("failed to reconfigure edge proxy: {source}"))]
    Proxy { source: HostError },

    #[snafu(display("filesystem operation on {} failed: {source}", path.display()))]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployErrorKind {
    /// Something required before starting was missing or wrong.
    Precondition,
    /// Downloaded data did not match its advertised checksum.
    Integrity,
    /// An external tool or service failed.
    ExternalTool,
    /// Containers did not come up healthy.
    Health,
    /// Local filesystem failure.
    Io,
}

impl DeployError {
    /// Returns the error kind for programmatic handling.
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            DeployError::NotRoot
            | DeployError::UnknownDeployment { .. }
            | DeployError::UnreachableUrl { .. }
            | DeployError::MissingImage { .. } => DeployErrorKind::Precondition,
            DeployError::Resolve { source } => match source {
                ImagerError::NotFound(_) => DeployErrorKind::Precondition,
                _ => DeployErrorKind::ExternalTool,
            },
            DeployError::Download { source } => match source {
                DownloadError::ChecksumMismatch { .. } => DeployErrorKind::Integrity,
                DownloadError::Io { .. } => DeployErrorKind::Io,
                _ => DeployErrorKind::ExternalTool,
            },
            DeployError::Toggle { source, .. } => match source {
                ToggleError::Unhealthy(_) => DeployErrorKind::Health,
                ToggleError::MaintManifest { .. } | ToggleError::Switch { .. } => {
                    DeployErrorKind::Io
                }
                ToggleError::Start(_) => DeployErrorKind::ExternalTool,
            },
            DeployError::BlockDevice { source } => match source {
                BlockDeviceError::Io { .. } => DeployErrorKind::Io,
                _ => DeployErrorKind::ExternalTool,
            },
            DeployError::Prepare { source } => match source {
                PrepareError::Io { .. } => DeployErrorKind::Io,
                _ => DeployErrorKind::Precondition,
            },
            DeployError::Proxy { .. } => DeployErrorKind::ExternalTool,
            DeployError::Filesystem { .. } => DeployErrorKind::Io,
        }
    }

    /// Process exit code; download failures carry the downloader's own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Download { source } => source.exit_code(),
            _ => 1,
        }
    }
}
