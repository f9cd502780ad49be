//! File-backed checkpoint store: one opaque blob per model at
//! `<root>/<model_id>`.
//!
//! Writes go to a temporary sibling, are fsynced, then renamed over the
//! target, so `load` never observes a partially written checkpoint.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::debug;
use uuid::Uuid;

use super::config::CheckpointConfig;
use super::error::{Result, SwapperError};
use super::types::ModelId;

/// Starts with a character `ModelId` rejects, so no checkpoint can match it.
const TMP_PREFIX: &str = "~tmp-";

#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open the store, creating the root directory and verifying it is
    /// writable. Failure here is fatal for the scheduler process.
    pub fn open(config: &CheckpointConfig) -> Result<Self> {
        let root = config.root.clone();
        let not_writable = |source| SwapperError::CheckpointRootNotWritable {
            path: root.clone(),
            source,
        };

        fs::create_dir_all(&root).map_err(not_writable)?;

        let marker = root.join(format!("{TMP_PREFIX}write-check-{}", Uuid::new_v4()));
        File::create(&marker)
            .and_then(|mut f| f.write_all(b"ok"))
            .map_err(not_writable)?;
        let _ = fs::remove_file(&marker);

        let store = Self { root };
        store.remove_stale_temp_files();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, model_id: &ModelId) -> PathBuf {
        self.root.join(model_id.as_str())
    }

    /// Persist `blob` as the checkpoint of `model_id`, replacing any previous one.
    pub fn save(&self, model_id: &ModelId, blob: &[u8]) -> Result<()> {
        let io_err = |source| SwapperError::CheckpointIo {
            model: model_id.clone(),
            source,
        };

        let target = self.path_for(model_id);
        let tmp = self
            .root
            .join(format!("{TMP_PREFIX}{model_id}-{}", Uuid::new_v4()));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)?;
            // Make the rename itself durable
            File::open(&self.root)?.sync_all()
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        debug!("[CHECKPOINT] Saved {} bytes for model {model_id}", blob.len());
        Ok(())
    }

    /// Load the checkpoint of `model_id`.
    pub fn load(&self, model_id: &ModelId) -> Result<Vec<u8>> {
        match fs::read(self.path_for(model_id)) {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SwapperError::CheckpointNotFound(model_id.clone()))
            }
            Err(source) => Err(SwapperError::CheckpointIo {
                model: model_id.clone(),
                source,
            }),
        }
    }

    /// Like [`load`](Self::load) but maps "not found" to `None`.
    pub fn load_optional(&self, model_id: &ModelId) -> Result<Option<Vec<u8>>> {
        match self.load(model_id) {
            Ok(blob) => Ok(Some(blob)),
            Err(SwapperError::CheckpointNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, model_id: &ModelId) -> bool {
        self.path_for(model_id).is_file()
    }

    /// Delete the checkpoint of `model_id`. Deleting a missing checkpoint is
    /// not an error.
    pub fn delete(&self, model_id: &ModelId) -> Result<()> {
        match fs::remove_file(self.path_for(model_id)) {
            Ok(()) => {
                debug!("[CHECKPOINT] Deleted checkpoint for model {model_id}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SwapperError::CheckpointIo {
                model: model_id.clone(),
                source,
            }),
        }
    }

    /// Temp files left behind by a crash mid-save are never valid checkpoints.
    fn remove_stale_temp_files(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(&CheckpointConfig {
            root: dir.path().join("checkpoints"),
        })
        .unwrap();
        (dir, store)
    }

    fn model(id: &str) -> ModelId {
        ModelId::new(id).unwrap()
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (_dir, store) = create_test_store();
        store.save(&model("m1"), b"state-1").unwrap();
        assert_eq!(store.load(&model("m1")).unwrap(), b"state-1");
    }

    #[test]
    fn test_save_overwrites() {
        let (_dir, store) = create_test_store();
        store.save(&model("m1"), b"old").unwrap();
        store.save(&model("m1"), b"new").unwrap();
        assert_eq!(store.load(&model("m1")).unwrap(), b"new");

        // No temp files left behind
        let names: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["m1".to_string()]);
    }

    #[test]
    fn test_delete_then_load_is_not_found() {
        let (_dir, store) = create_test_store();
        store.save(&model("m1"), b"x").unwrap();
        store.delete(&model("m1")).unwrap();
        assert!(matches!(
            store.load(&model("m1")),
            Err(SwapperError::CheckpointNotFound(_))
        ));
        assert_eq!(store.load_optional(&model("m1")).unwrap(), None);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = create_test_store();
        store.delete(&model("never-saved")).unwrap();
        store.delete(&model("never-saved")).unwrap();
    }

    #[test]
    fn test_open_removes_stale_temp_files() {
        let (dir, store) = create_test_store();
        let stale = store.root().join(format!("{TMP_PREFIX}m1-crashed"));
        fs::write(&stale, b"partial").unwrap();

        let reopened = CheckpointStore::open(&CheckpointConfig {
            root: dir.path().join("checkpoints"),
        })
        .unwrap();
        assert!(!stale.exists());
        assert!(!reopened.exists(&model("m1")));
    }

    #[test]
    fn test_dot_prefixed_model_survives_reopen() {
        let (dir, store) = create_test_store();
        store.save(&model(".tmp-sensor"), b"state").unwrap();

        let reopened = CheckpointStore::open(&CheckpointConfig {
            root: dir.path().join("checkpoints"),
        })
        .unwrap();
        assert_eq!(reopened.load(&model(".tmp-sensor")).unwrap(), b"state");
    }

    #[test]
    fn test_unwritable_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"").unwrap();

        let result = CheckpointStore::open(&CheckpointConfig {
            root: file.join("checkpoints"),
        });
        assert!(matches!(
            result,
            Err(SwapperError::CheckpointRootNotWritable { .. })
        ));
    }
}
