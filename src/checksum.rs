// ABOUTME: S3-style ETag checksums for images published on object storage.
// ABOUTME: Parses ETag/Content-Length headers and recomputes multi-part digests from local files.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Object storage part sizes are whole mebibytes.
pub const ONE_MIB: u64 = 1024 * 1024;

/// Most parts a multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;

/// Expected checksum of a remote file, as advertised by its HTTP headers.
///
/// `nb_parts == 0` means no usable checksum was found; `nb_parts == 1` is a
/// plain MD5 of the whole file; more parts is an S3 multipart ETag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDigest {
    pub checksum: String,
    pub nb_parts: u64,
    pub parts_size: u64,
    pub filesize: u64,
}

impl ChecksumDigest {
    pub fn not_found() -> Self {
        Self {
            checksum: String::new(),
            nb_parts: 0,
            parts_size: 0,
            filesize: 0,
        }
    }

    /// Build a digest from raw `Content-Length` and `ETag` header values.
    ///
    /// Never fails: anything unparsable yields [`ChecksumDigest::not_found`].
    pub fn from_headers(content_length: Option<&str>, etag: Option<&str>) -> Self {
        let (Some(content_length), Some(etag)) = (content_length, etag) else {
            return Self::not_found();
        };
        let Ok(filesize) = content_length.trim().parse::<u64>() else {
            return Self::not_found();
        };

        let etag: String = etag
            .trim()
            .chars()
            .filter(|c| *c != '"' && *c != '\'')
            .collect();
        if etag.is_empty() {
            return Self::not_found();
        }

        let Some((checksum, parts)) = etag.split_once('-') else {
            return Self {
                checksum: etag,
                nb_parts: 1,
                parts_size: filesize,
                filesize,
            };
        };

        let Ok(nb_parts) = parts.parse::<u64>() else {
            return Self::not_found();
        };
        if nb_parts == 0 || nb_parts > MAX_PARTS || nb_parts > filesize || checksum.is_empty() {
            return Self::not_found();
        }

        Self {
            checksum: checksum.to_string(),
            nb_parts,
            parts_size: guess_parts_size(filesize, nb_parts),
            filesize,
        }
    }

    /// Build a digest from a response's headers.
    pub fn from_header_map(headers: &reqwest::header::HeaderMap) -> Self {
        let header = |name: reqwest::header::HeaderName| {
            headers.get(name).and_then(|v| v.to_str().ok())
        };
        Self::from_headers(
            header(reqwest::header::CONTENT_LENGTH),
            header(reqwest::header::ETAG),
        )
    }

    /// ETag string in `<hex>-<parts>` form, as produced by [`compute_s3etag_for`].
    pub fn etag(&self) -> String {
        format!("{}-{}", self.checksum, self.nb_parts)
    }

    pub fn found(&self) -> bool {
        self.nb_parts >= 1
    }

    pub fn is_singlepart(&self) -> bool {
        self.nb_parts == 1
    }

    pub fn is_multipart(&self) -> bool {
        self.nb_parts > 1
    }
}

/// Part size used by the uploader, floored to whole mebibytes.
///
/// When the size in MiB divides evenly by the part count every part has the
/// same size; otherwise the last part is the short remainder.
fn guess_parts_size(filesize: u64, nb_parts: u64) -> u64 {
    let size_in_mib = filesize / ONE_MIB;
    let raw = if size_in_mib % nb_parts != 0 && nb_parts > 1 {
        filesize / (nb_parts - 1)
    } else {
        filesize / nb_parts
    };
    (raw / ONE_MIB) * ONE_MIB
}

/// Recompute the S3 ETag of a local file using the part layout of `digest`.
///
/// Each part is hashed with MD5, then the concatenated raw part digests are
/// hashed again. Reads stream in 1 MiB chunks.
pub fn compute_s3etag_for(path: &Path, digest: &ChecksumDigest) -> io::Result<String> {
    if digest.nb_parts > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} parts exceed the multipart limit", digest.nb_parts),
        ));
    }
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; ONE_MIB as usize];
    let mut part_digests = Vec::new();

    for _ in 0..digest.nb_parts {
        let mut context = md5::Context::new();
        let mut remaining = digest.parts_size;
        while remaining > 0 {
            let wanted = remaining.min(buffer.len() as u64) as usize;
            let read = file.read(&mut buffer[..wanted])?;
            if read == 0 {
                break;
            }
            context.consume(&buffer[..read]);
            remaining -= read as u64;
        }
        part_digests.extend_from_slice(&context.compute().0);
    }

    Ok(format!(
        "{:x}-{}",
        md5::compute(&part_digests),
        digest.nb_parts
    ))
}

/// Async wrapper around [`compute_s3etag_for`] running on the blocking pool.
pub async fn compute_s3etag(path: PathBuf, digest: ChecksumDigest) -> io::Result<String> {
    tokio::task::spawn_blocking(move || compute_s3etag_for(&path, &digest))
        .await
        .map_err(io::Error::other)?
}
