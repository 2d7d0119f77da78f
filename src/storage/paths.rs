// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path layout for the encrypted store.
//!
//! ```text
//! {data_dir}/
//!   {name}.db.enc           # At-rest encrypted database (durable)
//!   {name}.db.enc.backup    # Exists only during a save (or after a crash)
//!   {name}.db.enc.tmp       # New ciphertext before rename
//! {transient_dir}/
//!   {name}.working.redb     # Decrypted working copy (only while loaded)
//! ```
//!
//! The transient directory must not be covered by any durable backup: the
//! working copy is plaintext.

use std::path::{Path, PathBuf};

/// Default database name.
pub const DEFAULT_DATABASE_NAME: &str = "pos";

/// Default transient directory name under the OS temp dir.
const TRANSIENT_SUBDIR: &str = "fiscal-pos";

#[derive(Debug, Clone)]
pub struct StorePaths {
    data_dir: PathBuf,
    transient_dir: PathBuf,
    name: String,
}

impl StorePaths {
    pub fn new(
        data_dir: impl AsRef<Path>,
        transient_dir: impl AsRef<Path>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            transient_dir: transient_dir.as_ref().to_path_buf(),
            name: name.into(),
        }
    }

    /// Data dir with the working copy under the OS temp directory.
    pub fn with_default_transient(data_dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        Self::new(
            data_dir,
            std::env::temp_dir().join(TRANSIENT_SUBDIR),
            name,
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn transient_dir(&self) -> &Path {
        &self.transient_dir
    }

    /// Encrypted at-rest database file.
    pub fn at_rest_file(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db.enc", self.name))
    }

    /// Previous at-rest file kept while a save is being committed.
    pub fn backup_file(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db.enc.backup", self.name))
    }

    /// Staging file for new ciphertext before the rename.
    pub fn staging_file(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db.enc.tmp", self.name))
    }

    /// Decrypted working copy.
    pub fn working_file(&self) -> PathBuf {
        self.transient_dir.join(format!("{}.working.redb", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_rest_files_live_in_data_dir() {
        let paths = StorePaths::new("/var/lib/pos", "/run/pos", "shop");
        assert_eq!(paths.at_rest_file(), PathBuf::from("/var/lib/pos/shop.db.enc"));
        assert_eq!(
            paths.backup_file(),
            PathBuf::from("/var/lib/pos/shop.db.enc.backup")
        );
        assert_eq!(
            paths.staging_file(),
            PathBuf::from("/var/lib/pos/shop.db.enc.tmp")
        );
    }

    #[test]
    fn working_copy_lives_in_transient_dir() {
        let paths = StorePaths::new("/var/lib/pos", "/run/pos", "shop");
        assert_eq!(
            paths.working_file(),
            PathBuf::from("/run/pos/shop.working.redb")
        );
        assert!(!paths.working_file().starts_with(paths.data_dir()));
    }

    #[test]
    fn default_transient_is_under_temp_dir() {
        let paths = StorePaths::with_default_transient("/var/lib/pos", DEFAULT_DATABASE_NAME);
        assert!(paths.working_file().starts_with(std::env::temp_dir()));
    }
}
