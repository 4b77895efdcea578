//! Manifest file marking a directory as a log store.
//!
//! Stored as JSON for readability. Its presence is what makes a store
//! "exist" for the open modes.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KVStoreError, Result};

/// Manifest file name
pub const MANIFEST_FILE: &str = "MANIFEST";

/// On-disk format version written by this build
pub const FORMAT_VERSION: u16 = 1;

const ENGINE: &str = "smt-kvstore/log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub engine: String,
    pub format_version: u16,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            engine: ENGINE.to_string(),
            format_version: FORMAT_VERSION,
        }
    }
}

impl Manifest {
    /// Loads the manifest in `dir`, or `None` if there is none.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.try_exists()? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let manifest = serde_json::from_str(&content).map_err(|e| {
            KVStoreError::corrupt(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(manifest))
    }

    /// Checks that this build can open the store.
    pub fn check(&self) -> Result<()> {
        if self.engine != ENGINE {
            return Err(KVStoreError::corrupt(format!(
                "manifest engine is {:?}, expected {:?}",
                self.engine, ENGINE
            )));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(KVStoreError::VersionMismatch {
                found: self.format_version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(())
    }

    /// Saves the manifest using write-to-temp, fsync, rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let temp_path = dir.join(format!("{}.tmp", MANIFEST_FILE));

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KVStoreError::corrupt(format!("failed to serialize manifest: {}", e)))?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        sync_dir(dir)
    }
}

/// Fsyncs a directory so renames inside it are durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), None);

        Manifest::default().save(dir.path()).unwrap();
        let manifest = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(manifest, Manifest::default());
        manifest.check().unwrap();
        assert!(!dir.path().join("MANIFEST.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_sync_dir_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).unwrap();
        assert!(matches!(
            sync_dir(&dir.path().join("missing")),
            Err(KVStoreError::Io(_))
        ));
        assert!(Manifest::default().save(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_future_version() {
        let manifest = Manifest {
            format_version: FORMAT_VERSION + 1,
            ..Manifest::default()
        };
        assert!(matches!(
            manifest.check(),
            Err(KVStoreError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"not json").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(KVStoreError::CorruptData(_))
        ));
    }
}
