//! Project file materialization and content fingerprinting.
//!
//! A project's file set is written into a working directory (text inline,
//! binaries downloaded concurrently) and hashed into the deterministic
//! fingerprint that keys the compilation cache.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ServiceError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub entrypoint: String,
    #[serde(default)]
    pub compiler: String,
    #[serde(default)]
    pub halt_on_error: bool,
    pub files: Vec<ProjectFile>,
}

/// One project file: a relative forward-slash `name` and exactly one of
/// inline UTF-8 `content` or a `storageUrl` pointing at binary bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub storage_url: Option<String>,
}

impl ProjectFile {
    /// The value that enters the fingerprint: the storage URL when present,
    /// else the inline content.
    fn hash_value(&self) -> &str {
        self.storage_url
            .as_deref()
            .unwrap_or_else(|| self.content.as_deref().unwrap_or_default())
    }
}

fn sorted_by_name(files: &[ProjectFile]) -> Vec<&ProjectFile> {
    let mut sorted: Vec<&ProjectFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    sorted
}

/// Canonical byte sequence the fingerprint is computed over: compact JSON of
/// `[[name, value], ...]` sorted byte-wise by name. Must stay byte-identical
/// with the client-side encoder (`JSON.stringify` of the same nested arrays),
/// or every client hash turns into a cache miss.
pub fn canonical_bytes(files: &[ProjectFile]) -> Vec<u8> {
    let pairs: Vec<[&str; 2]> = sorted_by_name(files)
        .into_iter()
        .map(|f| [f.name.as_str(), f.hash_value()])
        .collect();
    serde_json::to_vec(&pairs).expect("string pairs always serialize")
}

/// Lowercase hex SHA-256 over [`canonical_bytes`]; the cache key for a
/// project's file set.
pub fn fingerprint(files: &[ProjectFile]) -> String {
    hex::encode(Sha256::digest(canonical_bytes(files)))
}

/// Write all project files under `work_dir`: text content inline, storage
/// URLs downloaded concurrently. Any failure (bad path, write error,
/// non-success download) aborts the whole materialization.
pub async fn materialize(
    client: &reqwest::Client,
    files: &[ProjectFile],
    work_dir: &Path,
) -> Result<(), ServiceError> {
    let mut downloads = Vec::new();
    for file in sorted_by_name(files) {
        let path = checked_path(work_dir, &file.name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Materialize(format!("{}: {e}", file.name)))?;
        }
        if let Some(url) = &file.storage_url {
            downloads.push(download_blob(client, &file.name, url.clone(), path));
        } else {
            let content = file.content.as_deref().unwrap_or_default();
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| ServiceError::Materialize(format!("{}: {e}", file.name)))?;
        }
    }
    futures_util::future::try_join_all(downloads).await?;
    Ok(())
}

/// File names come from the metadata backend, not the client, but they still
/// must not address anything outside the working directory.
fn checked_path(work_dir: &Path, name: &str) -> Result<PathBuf, ServiceError> {
    let relative = Path::new(name);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ServiceError::Materialize(format!("unsafe file name: {name}")));
    }
    Ok(work_dir.join(relative))
}

async fn download_blob(
    client: &reqwest::Client,
    name: &str,
    url: String,
    path: PathBuf,
) -> Result<(), ServiceError> {
    let response = client
        .get(&url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| ServiceError::Materialize(format!("download {name}: {e}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ServiceError::Materialize(format!("download {name}: {e}")))?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ServiceError::Materialize(format!("{name}: {e}")))?;
    Ok(())
}
