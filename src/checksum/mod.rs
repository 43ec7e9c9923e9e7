//! Checksum resolution
//!
//! A build's checksum is either given inline or looked up in a manifest
//! published next to the appliance. Resolution happens while the config is
//! prepared, before any large transfer starts.

pub mod hash;
pub mod manifest;

pub use hash::{file_digest, HashType, Hasher};
pub use manifest::find_checksum;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Error types for checksum resolution
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("checksum not found for file \"{file}\" at {location}")]
    NotFound { file: String, location: String },

    #[error("error parsing checksum url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("error parsing checksum url {url}, scheme not supported: {scheme}")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("unsupported checksum type: {0}")]
    UnsupportedType(String),

    #[error("error getting checksum from url {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("error getting checksum from url {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("error reading checksum manifest: {0}")]
    Io(#[from] std::io::Error),
}

/// Look up the checksum for `file_name` in the manifest at `checksum_url`
///
/// `http`/`https` URLs are fetched over the network and `file` URLs are
/// read from disk. A value without a scheme has not been resolved into a
/// URL yet and yields `Ok(None)`; every other scheme is an error.
pub async fn resolve_from_url(
    checksum_url: &str,
    file_name: &str,
    checksum_type: &str,
) -> Result<Option<String>, ChecksumError> {
    let url = match Url::parse(checksum_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            debug!("Checksum url {} has no scheme, skipping", checksum_url);
            return Ok(None);
        }
        Err(e) => {
            return Err(ChecksumError::InvalidUrl {
                url: checksum_url.to_string(),
                reason: e.to_string(),
            })
        }
    };

    info!("Resolving {} checksum for {} from {}", checksum_type, file_name, checksum_url);

    let checksum = match url.scheme() {
        "http" | "https" => {
            let response = reqwest::get(url.as_str())
                .await
                .map_err(|source| ChecksumError::Fetch {
                    url: checksum_url.to_string(),
                    source,
                })?;

            if !response.status().is_success() {
                return Err(ChecksumError::Status {
                    url: checksum_url.to_string(),
                    status: response.status().as_u16(),
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|source| ChecksumError::Fetch {
                    url: checksum_url.to_string(),
                    source,
                })?;

            find_checksum(body.as_ref(), file_name, checksum_type, checksum_url)?
        }
        "file" => {
            let path = url.to_file_path().map_err(|_| ChecksumError::InvalidUrl {
                url: checksum_url.to_string(),
                reason: "not a local file path".to_string(),
            })?;
            let data = tokio::fs::read(&path).await?;
            find_checksum(data.as_slice(), file_name, checksum_type, checksum_url)?
        }
        scheme => {
            return Err(ChecksumError::UnsupportedScheme {
                url: checksum_url.to_string(),
                scheme: scheme.to_string(),
            })
        }
    };

    Ok(Some(checksum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn manifest_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_resolve_from_file_url() {
        let file = manifest_file("abc123  the-OS.ova\n");
        let url = Url::from_file_path(file.path()).unwrap();

        let found = resolve_from_url(url.as_str(), "the-OS.ova", "sha256")
            .await
            .unwrap();
        assert_eq!(found, Some("abc123".to_string()));
    }

    /// Serve one canned HTTP response on 127.0.0.1 and return its base url
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_resolve_from_http_url() {
        let base = serve_once("200 OK", "0123  other.ova\nabc123 *the-OS.ova\n").await;

        let found = resolve_from_url(&format!("{}/SHA256SUMS", base), "the-OS.ova", "sha256")
            .await
            .unwrap();
        assert_eq!(found, Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let base = serve_once("404 Not Found", "").await;

        let result = resolve_from_url(&format!("{}/SHA256SUMS", base), "the-OS.ova", "sha256").await;
        assert!(matches!(result, Err(ChecksumError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_http_manifest_without_entry() {
        let base = serve_once("200 OK", "0123  other.ova\n").await;

        let result = resolve_from_url(&format!("{}/SHA256SUMS", base), "the-OS.ova", "sha256").await;
        assert!(matches!(result, Err(ChecksumError::NotFound { ref file, .. }) if file == "the-OS.ova"));
    }

    #[tokio::test]
    async fn test_missing_scheme_is_skipped() {
        let found = resolve_from_url("SHA256SUMS", "the-OS.ova", "sha256")
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let result = resolve_from_url("ftp://example.com/SUMS", "the-OS.ova", "md5").await;
        assert!(matches!(result, Err(ChecksumError::UnsupportedScheme { ref scheme, .. }) if scheme == "ftp"));
    }

    #[tokio::test]
    async fn test_unreadable_file() {
        let result = resolve_from_url("file:///not_read", "the-OS.ova", "md5").await;
        assert!(matches!(result, Err(ChecksumError::Io(_))));
    }
}
