//! Model delivery: content-addressed snapshot resolution, integrity
//! computation, offline verification, and durable state.

mod integrity;
mod snapshot;
mod state;

pub use integrity::{is_sha256, normalize_etag, sha256_file};
pub use snapshot::{
    fetch_snapshot, glob_match, hub_endpoint, probe_remote_meta, FetchedSnapshot,
    RemoteFileMeta, SnapshotManifest, ENDPOINT_ENV,
};
pub use state::{DeliveredFile, DeliveryState, ModelState};

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};

use crate::error::{DeliveryError, GlmOcrError, Result};

/// Resolved local directories for both models.
#[derive(Debug, Clone)]
pub struct ResolvedModels {
    pub recognizer_dir: PathBuf,
    pub layout_dir: PathBuf,
}

/// The delivery layer, rooted at the application-support directory.
#[derive(Debug, Clone)]
pub struct ModelDelivery {
    root: PathBuf,
    manifest: SnapshotManifest,
}

impl ModelDelivery {
    /// Root under `<app_support>/GlmOCRSwift`.
    pub fn with_default_root() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "GlmOCRSwift").ok_or_else(|| {
            GlmOcrError::from(DeliveryError::HubRequestFailed(
                "no application-support directory available".to_string(),
            ))
        })?;
        Ok(Self::with_root(dirs.data_dir().to_path_buf()))
    }

    /// Explicit root, used by tests.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            manifest: SnapshotManifest::default(),
        }
    }

    #[must_use]
    pub fn with_manifest(mut self, manifest: SnapshotManifest) -> Self {
        self.manifest = manifest;
        self
    }

    /// `<root>/ModelDelivery/model-delivery-state.json`
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.root.join("ModelDelivery").join("model-delivery-state.json")
    }

    /// `<root>/huggingface/hub`
    #[must_use]
    pub fn hub_cache_dir(&self) -> PathBuf {
        self.root.join("huggingface").join("hub")
    }

    /// Resolve both model snapshots.
    pub fn ensure_ready(&self, recognizer_id: &str, layout_id: &str) -> Result<ResolvedModels> {
        let recognizer_dir = self.ensure_model_ready(recognizer_id)?;
        let layout_dir = self.ensure_model_ready(layout_id)?;
        Ok(ResolvedModels {
            recognizer_dir,
            layout_dir,
        })
    }

    /// Resolve one model id to a validated local snapshot directory,
    /// recording integrity state.
    ///
    /// A local-path id is used as-is (still validated and recorded); hub
    /// ids are fetched through the manifest globs into the snapshot cache.
    pub fn ensure_model_ready(&self, model_id: &str) -> Result<PathBuf> {
        let local_path = Path::new(model_id);
        let (snapshot_dir, revision, remote) = if local_path.is_dir() {
            (local_path.to_path_buf(), "local".to_string(), false)
        } else {
            let fetched = fetch_snapshot(model_id, &self.hub_cache_dir(), &self.manifest)
                .map_err(GlmOcrError::from)?;
            (fetched.snapshot_dir, fetched.revision, true)
        };

        self.validate_snapshot(&snapshot_dir)?;

        // Integrity paths: every weight file in the snapshot.
        let mut files = Vec::new();
        for relative in integrity_paths(&snapshot_dir)? {
            let full = snapshot_dir.join(&relative);
            let on_disk = sha256_file(&full).map_err(GlmOcrError::from)?;
            let (etag_value, commit_hash) = if remote {
                let meta = probe_remote_meta(model_id, &revision, &relative)
                    .map_err(GlmOcrError::from)?;
                match meta.etag.as_deref().map(normalize_etag) {
                    Some(normalized) if is_sha256(&normalized) => {
                        if normalized != on_disk {
                            return Err(DeliveryError::ChecksumMismatch {
                                path: full,
                                expected: normalized,
                                actual: on_disk,
                            }
                            .into());
                        }
                        (normalized, meta.commit_hash)
                    }
                    // Non-digest ETag: persist the on-disk hash instead.
                    _ => (on_disk, meta.commit_hash),
                }
            } else {
                (on_disk, None)
            };
            files.push(DeliveredFile {
                relative_path: relative,
                etag: etag_value,
                commit_hash,
            });
        }

        let state_path = self.state_path();
        let mut state = DeliveryState::load_or_default(&state_path);
        state.upsert(
            model_id,
            ModelState {
                revision,
                snapshot_path: snapshot_dir.clone(),
                updated_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                files,
            },
        );
        state.save_atomic(&state_path).map_err(GlmOcrError::from)?;
        log::debug!("model {model_id} ready at {}", snapshot_dir.display());
        Ok(snapshot_dir)
    }

    /// Verify every recorded integrity path without touching the network.
    ///
    /// Fails on a missing state file, a missing model record, a missing
    /// file, or a checksum mismatch.
    pub fn verify_offline_readiness(&self, model_ids: &[&str]) -> Result<()> {
        let state = DeliveryState::load(&self.state_path()).map_err(GlmOcrError::from)?;
        for model_id in model_ids {
            let record = state.models.get(*model_id).ok_or_else(|| {
                GlmOcrError::from(DeliveryError::MissingMetadata((*model_id).to_string()))
            })?;
            for file in &record.files {
                let full = record.snapshot_path.join(&file.relative_path);
                if !full.exists() {
                    return Err(DeliveryError::MissingRequiredFile(full).into());
                }
                let actual = sha256_file(&full).map_err(GlmOcrError::from)?;
                if actual != file.etag {
                    return Err(DeliveryError::ChecksumMismatch {
                        path: full,
                        expected: file.etag.clone(),
                        actual,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn validate_snapshot(&self, dir: &Path) -> Result<()> {
        for required in &self.manifest.required_files {
            let path = dir.join(required);
            if !path.exists() {
                return Err(DeliveryError::MissingRequiredFile(path).into());
            }
        }
        if integrity_paths(dir)?.is_empty() {
            return Err(DeliveryError::NoWeightFiles(dir.to_path_buf()).into());
        }
        Ok(())
    }
}

/// Relative paths of the snapshot's weight files, sorted.
fn integrity_paths(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(DeliveryError::Io).map_err(GlmOcrError::from)? {
        let entry = entry.map_err(DeliveryError::Io).map_err(GlmOcrError::from)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".safetensors") {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents).unwrap();
    }

    fn local_snapshot(dir: &Path) {
        write_file(dir, "config.json", b"{}");
        write_file(dir, "model.safetensors", b"fake-weights");
    }

    #[test]
    fn test_local_path_passthrough_and_state() {
        let root = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        local_snapshot(snap.path());

        let delivery = ModelDelivery::with_root(root.path().to_path_buf());
        let model_id = snap.path().to_string_lossy().into_owned();
        let resolved = delivery.ensure_model_ready(&model_id).unwrap();
        assert_eq!(resolved, snap.path());

        let state = DeliveryState::load(&delivery.state_path()).unwrap();
        let record = &state.models[&model_id];
        assert_eq!(record.revision, "local");
        assert_eq!(record.files.len(), 1);
        assert!(is_sha256(&record.files[0].etag));
    }

    #[test]
    fn test_missing_required_file() {
        let root = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        write_file(snap.path(), "model.safetensors", b"w");

        let delivery = ModelDelivery::with_root(root.path().to_path_buf());
        let err = delivery
            .ensure_model_ready(&snap.path().to_string_lossy())
            .unwrap_err();
        assert!(matches!(
            err,
            GlmOcrError::ModelDeliveryFailed {
                source: DeliveryError::MissingRequiredFile(_)
            }
        ));
    }

    #[test]
    fn test_missing_weights_rejected() {
        let root = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        write_file(snap.path(), "config.json", b"{}");

        let delivery = ModelDelivery::with_root(root.path().to_path_buf());
        let err = delivery
            .ensure_model_ready(&snap.path().to_string_lossy())
            .unwrap_err();
        assert!(matches!(
            err,
            GlmOcrError::ModelDeliveryFailed {
                source: DeliveryError::NoWeightFiles(_)
            }
        ));
    }

    #[test]
    fn test_offline_verification_passes_then_detects_flip() {
        let root = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        local_snapshot(snap.path());

        let delivery = ModelDelivery::with_root(root.path().to_path_buf());
        let model_id = snap.path().to_string_lossy().into_owned();
        delivery.ensure_model_ready(&model_id).unwrap();
        delivery.verify_offline_readiness(&[&model_id]).unwrap();

        // Flip a byte in the weights.
        write_file(snap.path(), "model.safetensors", b"fake-weightz");
        let err = delivery.verify_offline_readiness(&[&model_id]).unwrap_err();
        match err {
            GlmOcrError::ModelDeliveryFailed {
                source: DeliveryError::ChecksumMismatch { expected, actual, .. },
            } => {
                assert_ne!(expected, actual);
                assert!(is_sha256(&expected));
                assert!(is_sha256(&actual));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_offline_verification_missing_state() {
        let root = tempfile::tempdir().unwrap();
        let delivery = ModelDelivery::with_root(root.path().to_path_buf());
        let err = delivery.verify_offline_readiness(&["org/model"]).unwrap_err();
        assert!(matches!(
            err,
            GlmOcrError::ModelDeliveryFailed {
                source: DeliveryError::MissingState(_)
            }
        ));
    }

    #[test]
    fn test_offline_verification_missing_model_record() {
        let root = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        local_snapshot(snap.path());
        let delivery = ModelDelivery::with_root(root.path().to_path_buf());
        delivery
            .ensure_model_ready(&snap.path().to_string_lossy())
            .unwrap();
        let err = delivery.verify_offline_readiness(&["other/model"]).unwrap_err();
        assert!(matches!(
            err,
            GlmOcrError::ModelDeliveryFailed {
                source: DeliveryError::MissingMetadata(_)
            }
        ));
    }
}
