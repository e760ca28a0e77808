//! Atomic JSON persistence for the optimization profile.
//!
//! Writes go to a temporary file in the target directory followed by an
//! atomic rename, so a concurrent reader never observes a truncated or
//! syntactically invalid document.

use crate::profile::{OptimizationProfile, SCHEMA_VERSION};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("profile schema version {found} is newer than supported {supported}")]
    SchemaVersion { found: u32, supported: u32 },
}

/// On-disk store for a single [`OptimizationProfile`] document.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the profile. `Ok(None)` when no document exists yet.
    pub fn load(&self) -> Result<Option<OptimizationProfile>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let profile: OptimizationProfile = serde_json::from_str(&raw)?;
        if profile.schema_version > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: profile.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        debug!(path = %self.path.display(), "loaded optimization profile");
        Ok(Some(profile))
    }

    /// Persist the profile via write-to-temp-then-rename.
    pub fn save(&self, profile: &OptimizationProfile) -> Result<(), StoreError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, profile)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        info!(path = %self.path.display(), "optimization profile saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{HardwareProfile, RuntimeParameters};

    fn store_in(dir: &tempfile::TempDir) -> ProfileStore {
        ProfileStore::new(dir.path().join("hardware_profile.json"))
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut hw = HardwareProfile::default();
        hw.cpu_model = "AMD Ryzen 9 5950X".into();
        hw.total_ram_mb = 32_768;
        let profile = OptimizationProfile::new(hw, RuntimeParameters::default());

        store.save(&profile).unwrap();
        let loaded = store.load().unwrap().expect("profile exists");
        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("nested/config/profile.json"));
        let profile =
            OptimizationProfile::new(HardwareProfile::default(), RuntimeParameters::default());
        store.save(&profile).unwrap();
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn test_save_replaces_atomically() {
        // The final document is always one of the two full versions, and no
        // temp files are left behind.
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let profile_a =
            OptimizationProfile::new(HardwareProfile::default(), RuntimeParameters::default());
        let mut profile_b = profile_a.clone();
        profile_b.hardware.cpu_model = "second".into();
        profile_b.touch();

        store.save(&profile_a).unwrap();
        store.save(&profile_b).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.hardware.cpu_model, "second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "hardware_profile.json")
            .collect();
        assert!(leftovers.is_empty(), "no temp files may remain: {leftovers:?}");
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut profile =
            OptimizationProfile::new(HardwareProfile::default(), RuntimeParameters::default());
        profile.schema_version = SCHEMA_VERSION + 1;
        store.save(&profile).unwrap();

        match store.load() {
            Err(StoreError::SchemaVersion { found, supported }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_document_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Parse(_))));
    }
}
