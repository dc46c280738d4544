//! Snapshot resolution against the model hub.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;

use crate::error::DeliveryError;

/// Hub endpoint override variable.
pub const ENDPOINT_ENV: &str = "HF_ENDPOINT";
const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// What a model snapshot must contain.
#[derive(Debug, Clone)]
pub struct SnapshotManifest {
    /// Filename patterns fetched from the repository.
    pub allow_globs: Vec<String>,
    /// Files that must be present after the fetch.
    pub required_files: Vec<String>,
}

impl Default for SnapshotManifest {
    fn default() -> Self {
        Self {
            allow_globs: ["*.json", "*.safetensors", "*.txt", "*.model", "*.tiktoken", "*.jinja"]
                .iter()
                .map(|g| (*g).to_string())
                .collect(),
            required_files: vec!["config.json".to_string()],
        }
    }
}

/// Minimal `*` glob matching over path basenames.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// The effective hub endpoint, honoring the env override.
#[must_use]
pub fn hub_endpoint() -> String {
    std::env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
}

/// A fetched snapshot: its directory and pinned revision.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub snapshot_dir: PathBuf,
    pub revision: String,
}

/// Download a snapshot of `model_id` into the given hub cache, restricted to
/// the manifest globs. Returns the content-addressed snapshot directory.
pub fn fetch_snapshot(
    model_id: &str,
    cache_dir: &Path,
    manifest: &SnapshotManifest,
) -> Result<FetchedSnapshot, DeliveryError> {
    std::fs::create_dir_all(cache_dir)?;
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_endpoint(hub_endpoint())
        .with_progress(false)
        .build()
        .map_err(|e| DeliveryError::HubRequestFailed(format!("api init: {e}")))?;
    let repo = api.model(model_id.to_string());
    let info = repo
        .info()
        .map_err(|e| DeliveryError::HubRequestFailed(format!("{model_id} info: {e}")))?;

    let mut snapshot_dir: Option<PathBuf> = None;
    for sibling in &info.siblings {
        let name = &sibling.rfilename;
        let basename = name.rsplit('/').next().unwrap_or(name);
        if !manifest.allow_globs.iter().any(|g| glob_match(g, basename)) {
            continue;
        }
        let local = repo
            .get(name)
            .map_err(|e| DeliveryError::HubRequestFailed(format!("{model_id}/{name}: {e}")))?;
        if snapshot_dir.is_none() {
            // Walk up past any subdirectories of the entry.
            let mut dir = local.parent().map(Path::to_path_buf);
            for _ in 0..name.matches('/').count() {
                dir = dir.as_deref().and_then(Path::parent).map(Path::to_path_buf);
            }
            snapshot_dir = dir;
        }
        log::debug!("fetched {model_id}/{name}");
    }
    let snapshot_dir = snapshot_dir.ok_or_else(|| {
        DeliveryError::HubRequestFailed(format!("{model_id}: no files matched manifest globs"))
    })?;
    Ok(FetchedSnapshot {
        snapshot_dir,
        revision: info.sha,
    })
}

/// Remote metadata for one file, from a HEAD probe.
#[derive(Debug, Clone, Default)]
pub struct RemoteFileMeta {
    pub etag: Option<String>,
    pub commit_hash: Option<String>,
}

/// HEAD-probe a file's ETag and revision on the hub.
pub fn probe_remote_meta(
    model_id: &str,
    revision: &str,
    relative_path: &str,
) -> Result<RemoteFileMeta, DeliveryError> {
    let url = format!(
        "{}/{model_id}/resolve/{revision}/{relative_path}",
        hub_endpoint()
    );
    let response = ureq::head(&url)
        .call()
        .map_err(|e| DeliveryError::HubRequestFailed(format!("HEAD {url}: {e}")))?;
    let etag = response
        .header("x-linked-etag")
        .or_else(|| response.header("etag"))
        .map(ToString::to_string);
    let commit_hash = response.header("x-repo-commit").map(ToString::to_string);
    Ok(RemoteFileMeta { etag, commit_hash })
}
