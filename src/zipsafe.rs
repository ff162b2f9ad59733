//! Archive safety validation and extraction.
//!
//! Untrusted archives are fully validated against declared metadata before a
//! single byte is written: size caps, member count, zip-bomb compression
//! ratio, path traversal, and symlink members. Only archives passing every
//! rule are extracted into the destination directory.

use std::io::Cursor;
use std::path::Path;

use thiserror::Error;
use zip::ZipArchive;

pub const MAX_COMPRESSED_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_UNCOMPRESSED_SIZE: u64 = 200 * 1024 * 1024;
pub const MAX_FILE_COUNT: usize = 500;
pub const MAX_COMPRESSION_RATIO: u64 = 100;

#[derive(Debug, Error)]
pub enum ZipSafetyError {
    #[error("compressed size {size} exceeds limit {limit}")]
    CompressedTooLarge { size: usize, limit: usize },

    #[error("invalid zip file: {0}")]
    InvalidArchive(#[from] zip::result::ZipError),

    #[error("too many files: {count} exceeds limit {limit}")]
    TooManyFiles { count: usize, limit: usize },

    #[error("uncompressed size {size} exceeds limit {limit}")]
    UncompressedTooLarge { size: u64, limit: u64 },

    #[error("compression ratio exceeds limit {limit}")]
    CompressionRatio { limit: u64 },

    #[error("absolute path in zip: {0}")]
    AbsolutePath(String),

    #[error("path traversal in zip: {0}")]
    PathTraversal(String),

    #[error("symlink in zip: {0}")]
    Symlink(String),

    #[error("failed to extract archive: {0}")]
    Extract(#[from] std::io::Error),
}

/// Validate `zip_bytes` against every safety rule, then extract into
/// `dest_dir`. Validation reads only declared metadata; nothing touches the
/// filesystem until the whole archive has passed. On error the caller owns
/// tearing down `dest_dir`.
pub fn validate_and_extract(zip_bytes: &[u8], dest_dir: &Path) -> Result<(), ZipSafetyError> {
    if zip_bytes.len() > MAX_COMPRESSED_SIZE {
        return Err(ZipSafetyError::CompressedTooLarge {
            size: zip_bytes.len(),
            limit: MAX_COMPRESSED_SIZE,
        });
    }

    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;

    let member_count = archive.len();
    if member_count > MAX_FILE_COUNT {
        return Err(ZipSafetyError::TooManyFiles {
            count: member_count,
            limit: MAX_FILE_COUNT,
        });
    }

    // by_index_raw reads central-directory metadata without decompressing.
    let mut total_uncompressed: u64 = 0;
    for i in 0..member_count {
        let member = archive.by_index_raw(i)?;
        total_uncompressed = total_uncompressed.saturating_add(member.size());
    }
    if total_uncompressed > MAX_UNCOMPRESSED_SIZE {
        return Err(ZipSafetyError::UncompressedTooLarge {
            size: total_uncompressed,
            limit: MAX_UNCOMPRESSED_SIZE,
        });
    }
    if !zip_bytes.is_empty()
        && total_uncompressed > MAX_COMPRESSION_RATIO * zip_bytes.len() as u64
    {
        return Err(ZipSafetyError::CompressionRatio {
            limit: MAX_COMPRESSION_RATIO,
        });
    }

    for i in 0..member_count {
        let member = archive.by_index_raw(i)?;
        let name = member.name().to_string();

        if name.starts_with('/') {
            return Err(ZipSafetyError::AbsolutePath(name));
        }
        if name.split('/').any(|segment| segment == "..") {
            return Err(ZipSafetyError::PathTraversal(name));
        }

        // The upper 16 bits of the external attributes carry the Unix mode;
        // a recorded S_IFLNK file type means the member is a symlink.
        if let Some(mode) = member.unix_mode()
            && mode != 0
            && mode & 0o170000 == 0o120000
        {
            return Err(ZipSafetyError::Symlink(name));
        }
    }

    extract_all(&mut archive, dest_dir)
}

fn extract_all(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    dest_dir: &Path,
) -> Result<(), ZipSafetyError> {
    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;

        // enclosed_name re-checks containment on the platform path form,
        // catching quirks the forward-slash validation cannot see.
        let Some(relative) = member.enclosed_name() else {
            return Err(ZipSafetyError::PathTraversal(member.name().to_string()));
        };
        let target = dest_dir.join(relative);

        if member.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut member, &mut out)?;
    }
    Ok(())
}
