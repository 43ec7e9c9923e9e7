//! Checksum manifest parsing
//!
//! Two line formats are understood:
//!
//! - BSD: `MD5 (the-OS.ova) = d41d8cd9...`
//! - GNU: `d41d8cd9...  the-OS.ova`, or `d41d8cd9... *the-OS.ova` for
//!   binary mode

use crate::checksum::ChecksumError;
use std::io::BufRead;
use tracing::debug;

/// Find the checksum for `file_name` in a manifest stream
///
/// `checksum_type` is matched against the leading algorithm token of BSD
/// lines without regard to case. `source` is only used in the not-found
/// error. The first matching line wins. Lines are decoded lossily, so a
/// line that is not valid UTF-8 simply fails to match.
pub fn find_checksum<R: BufRead>(
    reader: R,
    file_name: &str,
    checksum_type: &str,
    source: &str,
) -> Result<String, ChecksumError> {
    let bsd_name = format!("({})", file_name);

    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        if parts[0].eq_ignore_ascii_case(checksum_type) {
            if parts[1] == bsd_name {
                if let Some(hash) = parts.get(3) {
                    debug!("Found BSD-style checksum for {}", file_name);
                    return Ok(hash.to_string());
                }
            }
        } else {
            let name = parts[1].strip_prefix('*').unwrap_or(parts[1]);
            if name == file_name {
                debug!("Found GNU-style checksum for {}", file_name);
                return Ok(parts[0].to_string());
            }
        }
    }

    Err(ChecksumError::NotFound {
        file: file_name.to_string(),
        location: source.to_string(),
    })
}
