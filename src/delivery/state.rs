//! Durable delivery state with atomic persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// One delivered file with its recorded integrity value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredFile {
    pub relative_path: String,
    /// Normalized remote ETag, or the on-disk SHA-256 when the remote ETag
    /// was not itself a digest.
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

/// Per-model delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelState {
    pub revision: String,
    pub snapshot_path: PathBuf,
    pub updated_at_utc: String,
    pub files: Vec<DeliveredFile>,
}

/// The persisted state file: model id to record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    pub models: BTreeMap<String, ModelState>,
}

impl DeliveryState {
    /// Load the persisted state; missing file is a delivery error so
    /// offline verification can report it precisely.
    pub fn load(path: &Path) -> Result<Self, DeliveryError> {
        if !path.exists() {
            return Err(DeliveryError::MissingState(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| DeliveryError::HubRequestFailed(format!("corrupt state file: {e}")))
    }

    /// Load the state, or start empty when none exists yet.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Insert or replace a model record, keeping its file list sorted by
    /// relative path for reproducible serialization.
    pub fn upsert(&mut self, model_id: &str, mut state: ModelState) {
        state.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        self.models.insert(model_id.to_string(), state);
    }

    /// Write atomically: temp file in the target directory, then rename.
    /// The parent directory is created on demand.
    pub fn save_atomic(&self, path: &Path) -> Result<(), DeliveryError> {
        let parent = path
            .parent()
            .ok_or_else(|| DeliveryError::MissingState(path.to_path_buf()))?;
        std::fs::create_dir_all(parent)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DeliveryError::HubRequestFailed(format!("state serialize: {e}")))?;
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        std::fs::write(temp.path(), json.as_bytes())?;
        temp.persist(path)
            .map_err(|e| DeliveryError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ModelState {
        ModelState {
            revision: "abc123".to_string(),
            snapshot_path: PathBuf::from("/tmp/snapshot"),
            updated_at_utc: "2026-01-01T00:00:00Z".to_string(),
            files: vec![
                DeliveredFile {
                    relative_path: "model.safetensors".to_string(),
                    etag: "b".repeat(64),
                    commit_hash: Some("abc123".to_string()),
                },
                DeliveredFile {
                    relative_path: "config.json".to_string(),
                    etag: "a".repeat(64),
                    commit_hash: None,
                },
            ],
        }
    }

    #[test]
    fn test_upsert_sorts_files() {
        let mut state = DeliveryState::default();
        state.upsert("org/model", sample_state());
        let files = &state.models["org/model"].files;
        assert_eq!(files[0].relative_path, "config.json");
        assert_eq!(files[1].relative_path, "model.safetensors");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut state = DeliveryState::default();
        state.upsert("org/model", sample_state());
        state.save_atomic(&path).unwrap();
        let loaded = DeliveryState::load(&path).unwrap();
        assert_eq!(state, loaded);
    }

    #[test]
    fn test_missing_state_is_specific_error() {
        let err = DeliveryState::load(Path::new("/nonexistent/state.json")).unwrap_err();
        assert!(matches!(err, DeliveryError::MissingState(_)));
    }

    #[test]
    fn test_save_leaves_no_temp_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        DeliveryState::default().save_atomic(&path).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
