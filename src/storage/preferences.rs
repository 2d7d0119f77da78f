// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key-value preference store.
//!
//! The identity manager persists its key, certificate and business
//! identifiers here as opaque strings. The store is a collaborator: any
//! backend offering string get/set works.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("preference I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("preference file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("preference store lock poisoned")]
    Poisoned,
}

pub type PreferenceResult<T> = Result<T, PreferenceError>;

/// String-keyed get/set store.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> PreferenceResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> PreferenceResult<()>;

    fn remove(&self, key: &str) -> PreferenceResult<()>;
}

/// Process-local preferences (tests and embedding).
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> PreferenceResult<Option<String>> {
        let values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PreferenceResult<()> {
        let mut values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> PreferenceResult<()> {
        let mut values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// Preferences persisted as a single JSON object on disk.
///
/// Every write rewrites the whole file through a temp file and a rename.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFilePreferences {
    /// Open the file at `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> PreferenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match File::open(&path) {
            Ok(file) => serde_json::from_reader(BufReader::new(file))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> PreferenceResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, values)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> PreferenceResult<Option<String>> {
        let values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PreferenceResult<()> {
        let mut values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        let previous = values.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&values) {
            // Keep memory consistent with disk
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> PreferenceResult<()> {
        let mut values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_get_set_remove() {
        let prefs = MemoryPreferences::new();
        assert_eq!(prefs.get("k").unwrap(), None);

        prefs.set("k", "v").unwrap();
        assert_eq!(prefs.get("k").unwrap().as_deref(), Some("v"));

        prefs.remove("k").unwrap();
        assert_eq!(prefs.get("k").unwrap(), None);
    }

    #[test]
    fn json_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs").join("settings.json");

        {
            let prefs = JsonFilePreferences::open(&path).unwrap();
            prefs.set("fiscal.business_id", "810123456").unwrap();
            prefs.set("fiscal.pos_id", "7").unwrap();
        }

        let reopened = JsonFilePreferences::open(&path).unwrap();
        assert_eq!(
            reopened.get("fiscal.business_id").unwrap().as_deref(),
            Some("810123456")
        );
        assert_eq!(reopened.get("fiscal.pos_id").unwrap().as_deref(), Some("7"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn json_file_remove_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let prefs = JsonFilePreferences::open(&path).unwrap();
        prefs.set("a", "1").unwrap();
        prefs.remove("a").unwrap();

        let reopened = JsonFilePreferences::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{ not json").unwrap();

        let err = JsonFilePreferences::open(&path).unwrap_err();
        assert!(matches!(err, PreferenceError::Json(_)));
    }
}
