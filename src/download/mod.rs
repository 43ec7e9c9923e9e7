//! Source references and file downloads
//!
//! Sources are URLs: `http`/`https` for remote files and `file` for local
//! ones. Bare filesystem paths are turned into `file://` URLs.

use crate::checksum::{file_digest, HashType};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

/// Error types for downloads
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} downloading {url}")]
    Status { url: String, status: u16 },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A checksum a downloaded file must match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChecksum {
    pub hash_type: HashType,
    pub value: String,
}

impl ExpectedChecksum {
    pub fn new(hash_type: HashType, value: impl Into<String>) -> Self {
        Self {
            hash_type,
            value: value.into().to_lowercase(),
        }
    }
}

/// Normalize a source reference into a downloadable URL
///
/// Local paths, relative or absolute, become absolute `file://` URLs. The
/// file does not have to exist yet.
pub fn downloadable_url(original: &str) -> Result<Url, DownloadError> {
    match Url::parse(original) {
        // A one-letter scheme is a Windows drive, not a URL
        Ok(url) if url.scheme().len() > 1 => match url.scheme() {
            "http" | "https" | "file" => Ok(url),
            other => Err(DownloadError::UnsupportedScheme(other.to_string())),
        },
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = Path::new(original);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };

            Url::from_file_path(&path).map_err(|_| DownloadError::InvalidUrl {
                url: original.to_string(),
                reason: "not a valid file path".to_string(),
            })
        }
        Err(e) => Err(DownloadError::InvalidUrl {
            url: original.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// The last path element of a source reference
pub fn source_file_name(source: &str) -> String {
    let trimmed = source.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Location in the local cache for a downloaded URL
pub fn cache_path(url: &Url, extension: &str) -> PathBuf {
    let mut hasher = HashType::Sha256.hasher();
    hasher.update(url.as_str().as_bytes());

    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ovfbuild")
        .join(format!("{}.{}", hasher.finalize_hex(), extension))
}

/// Check a file on disk against an expected checksum
pub async fn verify_file(path: &Path, expected: &ExpectedChecksum) -> Result<(), DownloadError> {
    let owned = path.to_path_buf();
    let hash_type = expected.hash_type;
    let actual = tokio::task::spawn_blocking(move || file_digest(owned, hash_type))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

    if actual != expected.value {
        return Err(DownloadError::Mismatch {
            path: path.display().to_string(),
            expected: expected.value.clone(),
            actual,
        });
    }

    debug!("Verified {} checksum of {}", hash_type, path.display());
    Ok(())
}

/// Make `url` available as a local file and verify it
///
/// `file` URLs are verified in place. Remote files are streamed to
/// `target` through a `.part` file and only moved into place once the
/// checksum matches. A verified file already at `target` is reused.
pub async fn fetch(
    url: &Url,
    target: &Path,
    checksum: Option<&ExpectedChecksum>,
    progress: &ProgressBar,
) -> Result<PathBuf, DownloadError> {
    match url.scheme() {
        "file" => {
            let path = url.to_file_path().map_err(|_| DownloadError::InvalidUrl {
                url: url.to_string(),
                reason: "not a local file path".to_string(),
            })?;

            if let Some(expected) = checksum {
                verify_file(&path, expected).await?;
            }
            Ok(path)
        }
        "http" | "https" => {
            if let Some(expected) = checksum {
                if target.is_file() && verify_file(target, expected).await.is_ok() {
                    info!("Using cached download: {}", target.display());
                    return Ok(target.to_path_buf());
                }
            }

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            info!("Downloading {} to {}", url, target.display());
            let mut response = reqwest::get(url.as_str()).await?;
            if !response.status().is_success() {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }

            if let Some(length) = response.content_length() {
                progress.set_length(length);
            }

            let partial = PathBuf::from(format!("{}.part", target.display()));
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut hasher = checksum.map(|c| c.hash_type.hasher());

            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                progress.inc(chunk.len() as u64);
            }
            file.flush().await?;
            drop(file);
            progress.finish_and_clear();

            if let (Some(hasher), Some(expected)) = (hasher, checksum) {
                let actual = hasher.finalize_hex();
                if actual != expected.value {
                    if let Err(e) = tokio::fs::remove_file(&partial).await {
                        warn!("Failed to remove partial download {}: {}", partial.display(), e);
                    }
                    return Err(DownloadError::Mismatch {
                        path: url.to_string(),
                        expected: expected.value.clone(),
                        actual,
                    });
                }
            }

            tokio::fs::rename(&partial, target).await?;
            Ok(target.to_path_buf())
        }
        other => Err(DownloadError::UnsupportedScheme(other.to_string())),
    }
}
