//! Profile definitions persisted as one file per profile.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{ProfileStore, StoredConfig};
use crate::error::StoreError;

const CONFIG_EXTENSION: &str = "json";

/// Stores each profile definition in `<dir>/<name>.json`
#[derive(Debug, Clone)]
pub struct DirectoryProfileStore {
    dir: PathBuf,
}

impl DirectoryProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, CONFIG_EXTENSION))
    }

    /// Persist (or replace) a definition
    pub fn save(&self, name: &str, raw: &str) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Write {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(name);
        fs::write(&path, raw).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Remove one definition; returns whether it existed
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }

    fn config_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(CONFIG_EXTENSION)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl ProfileStore for DirectoryProfileStore {
    fn fetch_stored_configs(&self) -> Result<Vec<StoredConfig>, StoreError> {
        let mut configs = Vec::new();

        for path in self.config_files()? {
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            match fs::read_to_string(&path) {
                Ok(raw) => configs.push(StoredConfig { name, raw }),
                // One unreadable file does not hide the others
                Err(e) => warn!(
                    target: "telemetry::registry",
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable stored profile"
                ),
            }
        }

        debug!(
            target: "telemetry::registry",
            dir = %self.dir.display(),
            count = configs.len(),
            "Fetched stored profiles"
        );
        Ok(configs)
    }

    fn clear_persisted_state(&self) -> Result<(), StoreError> {
        for path in self.config_files()? {
            fs::remove_file(&path).map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryProfileStore::new(dir.path().join("absent"));
        assert!(store.fetch_stored_configs().unwrap().is_empty());
    }

    #[test]
    fn test_save_fetch_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryProfileStore::new(dir.path());

        store.save("B_Profile", "{\"Name\":\"B_Profile\"}").unwrap();
        store.save("A_Profile", "{\"Name\":\"A_Profile\"}").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let configs = store.fetch_stored_configs().unwrap();
        let names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A_Profile", "B_Profile"]);

        assert!(store.remove("A_Profile").unwrap());
        assert!(!store.remove("A_Profile").unwrap());
        assert_eq!(store.fetch_stored_configs().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryProfileStore::new(dir.path());
        store.save("A", "{}").unwrap();
        store.save("B", "{}").unwrap();

        store.clear_persisted_state().unwrap();

        assert!(store.fetch_stored_configs().unwrap().is_empty());
        assert!(!dir.path().join("A.json").exists());
    }
}
