// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encrypted-at-rest database lifecycle.
//!
//! ## State Machine
//!
//! ```text
//! Uninitialized ─▶ Loading ─▶ Loaded ⇄ Saving
//!                                │
//!                                ▼
//!                             Closing ─▶ Closed ─▶ (Loading again)
//! ```
//!
//! ## Save Sequence
//!
//! 1. Close the redb connection so the working image is complete on disk
//! 2. Read and encrypt the working copy
//! 3. Copy the current at-rest file to `<path>.backup`
//! 4. Write the new ciphertext to a staging file, fsync, rename over the
//!    at-rest file
//! 5. Delete the backup (or restore from it if step 4 failed)
//! 6. Reopen the connection, whatever happened above
//!
//! A crash at any point leaves either a valid at-rest file or a valid
//! backup; [`EncryptedStore::initialize_for_user`] recovers from the backup
//! when the at-rest file does not decrypt.
//!
//! ## Concurrency
//!
//! One async mutex guards the connection, the key and the state. Saves are
//! therefore serialized, and `close()` waits for any in-flight save.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::audit::{AuditEvent, AuditEventType};
use super::autosave::AutoSaver;
use super::database::{DbError, DbResult, WorkingDatabase};
use super::paths::StorePaths;
use crate::crypto::{self, derive_key, CryptoError, SymmetricKey};

/// Lifecycle state of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Loading,
    Loaded,
    Saving,
    Closing,
    Closed,
}

/// Error type for encrypted store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The at-rest file (and any backup) failed authentication.
    #[error("invalid password or corrupted database")]
    InvalidCredentialsOrCorruption,

    #[error("store is not loaded")]
    NotLoaded,

    /// `change_credential` was given the wrong current passphrase.
    #[error("current credential does not match")]
    CredentialMismatch,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

struct StoreInner {
    state: StoreState,
    identity_secret: Option<String>,
    key: Option<SymmetricKey>,
    db: Option<WorkingDatabase>,
    /// Cancelled when the store closes; parent of the auto-save token.
    lifecycle: CancellationToken,
}

/// Owner of the at-rest encrypted file and its decrypted working copy.
pub struct EncryptedStore {
    paths: StorePaths,
    inner: Mutex<StoreInner>,
    loaded: AtomicBool,
}

impl EncryptedStore {
    /// Create an unloaded store. Nothing touches the disk until
    /// [`initialize_for_user`](Self::initialize_for_user).
    pub fn new(paths: StorePaths) -> Self {
        Self {
            paths,
            inner: Mutex::new(StoreInner {
                state: StoreState::Uninitialized,
                identity_secret: None,
                key: None,
                db: None,
                lifecycle: CancellationToken::new(),
            }),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Loaded flag; does not wait for an in-flight save.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> StoreState {
        self.inner.lock().await.state
    }

    // ========== Lifecycle ==========

    /// Derive the key and open the database for this user.
    ///
    /// First run creates an empty working database. Otherwise the at-rest
    /// file is decrypted into the working copy. No-op when already loaded.
    pub async fn initialize_for_user(&self, identity_secret: &str, passphrase: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == StoreState::Loaded {
            debug!("Store already loaded, skipping initialization");
            return Ok(());
        }

        let previous = inner.state;
        inner.state = StoreState::Loading;

        let loaded = async {
            let key = derive_key_blocking(identity_secret, passphrase).await?;
            let db = self.load_working_copy(&key)?;
            Ok::<_, StoreError>((key, db))
        }
        .await;

        let (key, db) = match loaded {
            Ok(pair) => pair,
            Err(e) => {
                inner.state = previous;
                warn!(error = %e, "Failed to load encrypted store");
                return Err(e);
            }
        };

        if let Err(e) = db.append_audit(&AuditEvent::new(AuditEventType::StoreLoaded)) {
            warn!(error = %e, "Failed to record store load in audit log");
        }

        inner.identity_secret = Some(identity_secret.to_string());
        inner.key = Some(key);
        inner.db = Some(db);
        inner.lifecycle = CancellationToken::new();
        inner.state = StoreState::Loaded;
        self.loaded.store(true, Ordering::SeqCst);

        info!(
            at_rest = %self.paths.at_rest_file().display(),
            "Encrypted store loaded"
        );
        Ok(())
    }

    /// Encrypt the working copy and atomically replace the at-rest file.
    pub async fn save(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != StoreState::Loaded {
            return Err(StoreError::NotLoaded);
        }

        inner.state = StoreState::Saving;
        let result = self.save_locked(&mut inner).await;
        inner.state = StoreState::Loaded;

        match &result {
            Ok(()) => debug!("Encrypted store saved"),
            Err(e) => warn!(error = %e, "Encrypted store save failed"),
        }
        result
    }

    /// Final save, then tear down the working copy and forget the key.
    ///
    /// Idempotent. If the final save fails the store stays loaded and the
    /// error is returned, so no unsaved data is discarded.
    pub async fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            StoreState::Closed | StoreState::Uninitialized => return Ok(()),
            _ => {}
        }

        self.loaded.store(false, Ordering::SeqCst);
        inner.state = StoreState::Closing;

        if let Err(e) = self.save_locked(&mut inner).await {
            error!(error = %e, "Final save failed, store remains open");
            inner.state = StoreState::Loaded;
            self.loaded.store(true, Ordering::SeqCst);
            return Err(e);
        }

        inner.lifecycle.cancel();
        self.teardown(&mut inner)?;
        info!("Encrypted store closed");
        Ok(())
    }

    /// Switch the key used by subsequent saves.
    pub async fn change_credential(&self, old_passphrase: &str, new_passphrase: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != StoreState::Loaded {
            return Err(StoreError::NotLoaded);
        }
        let secret = inner.identity_secret.clone().ok_or(StoreError::NotLoaded)?;

        let old_key = derive_key_blocking(&secret, old_passphrase).await?;
        if inner.key.as_ref() != Some(&old_key) {
            return Err(StoreError::CredentialMismatch);
        }

        let new_key = derive_key_blocking(&secret, new_passphrase).await?;
        inner.key = Some(new_key);

        if let Some(db) = inner.db.as_ref() {
            if let Err(e) = db.append_audit(&AuditEvent::new(AuditEventType::CredentialChanged)) {
                warn!(error = %e, "Failed to record credential change in audit log");
            }
        }
        info!("Store credential changed, next save re-encrypts with the new key");
        Ok(())
    }

    /// Spawn the periodic auto-save task, bound to this load of the store.
    pub async fn start_auto_save(self: &Arc<Self>, interval: Duration) -> StoreResult<JoinHandle<()>> {
        let token = {
            let inner = self.inner.lock().await;
            if inner.state != StoreState::Loaded {
                return Err(StoreError::NotLoaded);
            }
            inner.lifecycle.child_token()
        };
        let saver = AutoSaver::new(Arc::clone(self), interval);
        Ok(tokio::spawn(saver.run(token)))
    }

    // ========== Database Access ==========

    /// Run `f` against the live working database.
    ///
    /// This is the only way to reach the database; callers queue behind any
    /// in-flight save.
    pub async fn with_database<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&WorkingDatabase) -> DbResult<T>,
    {
        let inner = self.inner.lock().await;
        let db = inner.db.as_ref().ok_or(StoreError::NotLoaded)?;
        Ok(f(db)?)
    }

    /// Check that the working database answers reads.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.with_database(|db| db.health_check()).await
    }

    // ========== Internals ==========

    fn load_working_copy(&self, key: &SymmetricKey) -> StoreResult<WorkingDatabase> {
        let working = self.paths.working_file();
        fs::create_dir_all(self.paths.transient_dir())
            .map_err(io_context("creating transient directory"))?;

        // Leftover from a crashed session; the at-rest file is authoritative
        if working.exists() {
            warn!(path = %working.display(), "Removing stale working copy");
            secure_delete(&working).map_err(io_context("removing stale working copy"))?;
        }

        match self.recover_at_rest(key)? {
            Some(plaintext) => {
                write_private(&working, &plaintext).map_err(io_context("writing working copy"))?;
            }
            None => info!("No at-rest database found, creating a new one"),
        }

        match WorkingDatabase::open(&working) {
            Ok(db) => Ok(db),
            Err(e) => {
                // Never leave plaintext behind when we cannot use it
                let _ = secure_delete(&working);
                Err(e.into())
            }
        }
    }

    /// Decrypt the at-rest file, falling back to the backup left by an
    /// interrupted save. `Ok(None)` on first run.
    fn recover_at_rest(&self, key: &SymmetricKey) -> StoreResult<Option<Zeroizing<Vec<u8>>>> {
        let at_rest = self.paths.at_rest_file();
        let backup = self.paths.backup_file();

        let primary = read_if_exists(&at_rest).map_err(io_context("reading at-rest database"))?;
        let fallback = read_if_exists(&backup).map_err(io_context("reading backup database"))?;

        match (primary, fallback) {
            (None, None) => Ok(None),
            (Some(blob), None) => crypto::decrypt(&blob, key)
                .map(|plaintext| Some(Zeroizing::new(plaintext)))
                .map_err(|_| StoreError::InvalidCredentialsOrCorruption),
            (primary, Some(backup_blob)) => {
                if let Some(blob) = primary {
                    if let Ok(plaintext) = crypto::decrypt(&blob, key) {
                        warn!("Removing stale backup left by an interrupted save");
                        if let Err(e) = fs::remove_file(&backup) {
                            warn!(error = %e, "Failed to remove stale backup");
                        }
                        return Ok(Some(Zeroizing::new(plaintext)));
                    }
                }

                let plaintext = crypto::decrypt(&backup_blob, key)
                    .map_err(|_| StoreError::InvalidCredentialsOrCorruption)?;
                warn!("At-rest database unreadable, restoring from backup");
                write_durable(&self.paths.staging_file(), &backup_blob)
                    .and_then(|()| fs::rename(self.paths.staging_file(), &at_rest))
                    .map_err(io_context("restoring at-rest database from backup"))?;
                fs::remove_file(&backup).map_err(io_context("removing restored backup"))?;
                Ok(Some(Zeroizing::new(plaintext)))
            }
        }
    }

    async fn save_locked(&self, inner: &mut StoreInner) -> StoreResult<()> {
        let key = inner.key.clone().ok_or(StoreError::NotLoaded)?;

        // Close the live connection so the working image is complete on disk
        drop(inner.db.take());

        let result = encrypt_and_publish_blocking(self.paths.clone(), key).await;

        // Reopen regardless of outcome
        match WorkingDatabase::open(&self.paths.working_file()) {
            Ok(db) => inner.db = Some(db),
            Err(e) => {
                error!(error = %e, "Failed to reopen working database after save");
                if result.is_ok() {
                    return Err(e.into());
                }
            }
        }
        result
    }

    fn teardown(&self, inner: &mut StoreInner) -> StoreResult<()> {
        drop(inner.db.take());
        inner.key = None;
        inner.identity_secret = None;
        inner.state = StoreState::Closed;

        secure_delete(&self.paths.working_file()).map_err(io_context("deleting working copy"))
    }
}

impl Drop for EncryptedStore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.db.is_none() {
            return;
        }
        warn!("Encrypted store dropped while loaded, closing synchronously");
        inner.lifecycle.cancel();
        // Same ordering as close(): only discard the working copy once saved
        match Self::save_and_teardown(&self.paths, inner) {
            Ok(()) => {}
            Err(e) => error!(error = %e, "Failed to close encrypted store on drop"),
        }
    }
}

impl EncryptedStore {
    fn save_and_teardown(paths: &StorePaths, inner: &mut StoreInner) -> StoreResult<()> {
        let key = inner.key.as_ref().ok_or(StoreError::NotLoaded)?;
        drop(inner.db.take());
        encrypt_working_copy(paths, key).and_then(|blob| publish_atomically(paths, &blob))?;
        inner.key = None;
        inner.state = StoreState::Closed;
        secure_delete(&paths.working_file()).map_err(io_context("deleting working copy"))
    }
}

async fn derive_key_blocking(identity_secret: &str, passphrase: &str) -> StoreResult<SymmetricKey> {
    let secret = identity_secret.to_string();
    let passphrase = Zeroizing::new(passphrase.to_string());
    tokio::task::spawn_blocking(move || derive_key(&secret, &passphrase))
        .await
        .map_err(|e| StoreError::Task(format!("key derivation: {e}")))
}

/// Whole-image encryption and the fsync'd publish run off the async workers.
async fn encrypt_and_publish_blocking(paths: StorePaths, key: SymmetricKey) -> StoreResult<()> {
    tokio::task::spawn_blocking(move || {
        encrypt_working_copy(&paths, &key).and_then(|blob| publish_atomically(&paths, &blob))
    })
    .await
    .map_err(|e| StoreError::Task(format!("encrypting working copy: {e}")))?
}

fn encrypt_working_copy(paths: &StorePaths, key: &SymmetricKey) -> StoreResult<Vec<u8>> {
    let plaintext = Zeroizing::new(
        fs::read(paths.working_file()).map_err(io_context("reading working copy"))?,
    );
    Ok(crypto::encrypt(&plaintext, key)?)
}

/// Backup, commit, delete-backup publish of new ciphertext.
///
/// On a failed write the previous file is restored from the backup and the
/// error is returned.
pub(crate) fn publish_atomically(paths: &StorePaths, blob: &[u8]) -> StoreResult<()> {
    let at_rest = paths.at_rest_file();
    let backup = paths.backup_file();
    let staging = paths.staging_file();

    fs::create_dir_all(paths.data_dir()).map_err(io_context("creating data directory"))?;

    let had_previous = at_rest.exists();
    if had_previous {
        fs::copy(&at_rest, &backup).map_err(io_context("backing up at-rest database"))?;
    }

    let written = write_durable(&staging, blob)
        .and_then(|()| fs::rename(&staging, &at_rest))
        .and_then(|()| sync_dir(paths.data_dir()));

    match written {
        Ok(()) => {
            if had_previous {
                if let Err(e) = fs::remove_file(&backup) {
                    // Harmless: the next load discards a stale backup
                    warn!(error = %e, "Failed to delete backup after save");
                }
            }
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&staging);
            if had_previous {
                match fs::copy(&backup, &at_rest) {
                    Ok(_) => {
                        let _ = fs::remove_file(&backup);
                    }
                    Err(restore) => {
                        // Backup stays in place for recovery on next load
                        error!(error = %restore, "Failed to restore at-rest database from backup");
                    }
                }
            }
            Err(StoreError::Io {
                context: "writing at-rest database".to_string(),
                source: e,
            })
        }
    }
}

fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_durable(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Write plaintext readable by the owner only.
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Overwrite with zeros, flush, then unlink. Missing files are fine.
fn secure_delete(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let zeros = [0u8; 8192];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Transaction, TransactionItem};
    use rust_decimal::Decimal;

    const USER: &str = "cashier";
    const PASS: &str = "till-password";

    fn test_store() -> (Arc<EncryptedStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("data"), dir.path().join("run"), "pos");
        (Arc::new(EncryptedStore::new(paths)), dir)
    }

    fn sample_tx() -> Transaction {
        Transaction::new_sale(
            "Ana",
            vec![TransactionItem::new(
                "Tea",
                Decimal::ONE,
                Decimal::new(300, 2),
                Decimal::new(8, 0),
            )],
            "Cash",
        )
    }

    /// Decrypt the at-rest file out of band and look for a transaction.
    fn at_rest_contains(paths: &StorePaths, passphrase: &str, tx_id: &str) -> bool {
        let blob = fs::read(paths.at_rest_file()).unwrap();
        let plaintext = crypto::decrypt(&blob, &derive_key(USER, passphrase)).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let copy = scratch.path().join("copy.redb");
        fs::write(&copy, plaintext).unwrap();
        let db = WorkingDatabase::open(&copy).unwrap();
        db.get_transaction(tx_id).unwrap().is_some()
    }

    #[tokio::test]
    async fn first_run_creates_empty_database() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();

        assert!(store.is_loaded());
        assert_eq!(store.state().await, StoreState::Loaded);
        assert!(store.paths().working_file().exists());
        assert!(!store.paths().at_rest_file().exists());
        store.health_check().await.unwrap();

        let count = store.with_database(|db| Ok(db.list_transactions()?.len())).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn save_writes_encrypted_file_and_no_backup() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let tx = sample_tx();
        store.with_database(|db| db.upsert_transaction(&tx)).await.unwrap();

        store.save().await.unwrap();

        let paths = store.paths();
        assert!(paths.at_rest_file().exists());
        assert!(!paths.backup_file().exists());
        assert!(!paths.staging_file().exists());
        assert!(at_rest_contains(paths, PASS, &tx.id));

        // Connection is usable again after the save
        let found = store.with_database(|db| db.get_transaction(&tx.id)).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn close_then_reload_roundtrips_data() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let tx = sample_tx();
        store.with_database(|db| db.upsert_transaction(&tx)).await.unwrap();

        store.close().await.unwrap();
        assert!(!store.is_loaded());
        assert_eq!(store.state().await, StoreState::Closed);
        assert!(!store.paths().working_file().exists());

        store.initialize_for_user(USER, PASS).await.unwrap();
        let found = store.with_database(|db| db.get_transaction(&tx.id)).await.unwrap();
        assert_eq!(found.unwrap().id, tx.id);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_without_touching_files() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        store.close().await.unwrap();
        let before = fs::read(store.paths().at_rest_file()).unwrap();

        let err = store.initialize_for_user(USER, "wrong").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCredentialsOrCorruption));
        assert!(!store.is_loaded());
        assert!(!store.paths().working_file().exists());
        assert_eq!(fs::read(store.paths().at_rest_file()).unwrap(), before);
    }

    #[tokio::test]
    async fn repeated_initialize_is_noop() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let tx = sample_tx();
        store.with_database(|db| db.upsert_transaction(&tx)).await.unwrap();

        // Even a wrong passphrase is ignored while loaded
        store.initialize_for_user(USER, "other").await.unwrap();
        let found = store.with_database(|db| db.get_transaction(&tx.id)).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (store, _dir) = test_store();
        store.close().await.unwrap();

        store.initialize_for_user(USER, PASS).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.save().await, Err(StoreError::NotLoaded)));
        assert!(matches!(
            store.with_database(|db| db.list_transactions()).await,
            Err(StoreError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn truncated_at_rest_is_recovered_from_backup() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let tx = sample_tx();
        store.with_database(|db| db.upsert_transaction(&tx)).await.unwrap();
        store.close().await.unwrap();

        // Simulate a crash after the backup copy and a torn write
        let paths = store.paths().clone();
        fs::copy(paths.at_rest_file(), paths.backup_file()).unwrap();
        let full = fs::read(paths.at_rest_file()).unwrap();
        fs::write(paths.at_rest_file(), &full[..full.len() / 2]).unwrap();

        store.initialize_for_user(USER, PASS).await.unwrap();
        let found = store.with_database(|db| db.get_transaction(&tx.id)).await.unwrap();
        assert!(found.is_some());
        assert!(!paths.backup_file().exists());
        assert_eq!(fs::read(paths.at_rest_file()).unwrap(), full);
    }

    #[tokio::test]
    async fn stale_backup_next_to_valid_file_is_discarded() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        store.close().await.unwrap();

        // Crash between "write new file" and "delete backup"
        let paths = store.paths().clone();
        fs::copy(paths.at_rest_file(), paths.backup_file()).unwrap();

        store.initialize_for_user(USER, PASS).await.unwrap();
        assert!(!paths.backup_file().exists());
    }

    #[tokio::test]
    async fn failed_write_restores_previous_file() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        store.save().await.unwrap();
        let paths = store.paths().clone();
        let before = fs::read(paths.at_rest_file()).unwrap();

        // A directory in the staging slot makes the write fail
        fs::create_dir_all(paths.staging_file()).unwrap();
        let err = store.save().await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        assert_eq!(fs::read(paths.at_rest_file()).unwrap(), before);
        assert!(!paths.backup_file().exists());
        // Connection was reopened despite the failure
        store.health_check().await.unwrap();

        fs::remove_dir_all(paths.staging_file()).unwrap();
        store.save().await.unwrap();
    }

    #[tokio::test]
    async fn change_credential_reencrypts_on_next_save() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let tx = sample_tx();
        store.with_database(|db| db.upsert_transaction(&tx)).await.unwrap();

        let err = store.change_credential("not-current", "new-pass").await.unwrap_err();
        assert!(matches!(err, StoreError::CredentialMismatch));

        store.change_credential(PASS, "new-pass").await.unwrap();
        store.close().await.unwrap();

        assert!(at_rest_contains(store.paths(), "new-pass", &tx.id));
        assert!(matches!(
            store.initialize_for_user(USER, PASS).await,
            Err(StoreError::InvalidCredentialsOrCorruption)
        ));
        store.initialize_for_user(USER, "new-pass").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_saves_and_close_serialize() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let tx = sample_tx();
        store.with_database(|db| db.upsert_transaction(&tx)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&store);
            handles.push(tokio::spawn(async move { s.save().await }));
        }
        store.close().await.unwrap();
        for handle in handles {
            // Each save either ran before close or found the store closed
            match handle.await.unwrap() {
                Ok(()) | Err(StoreError::NotLoaded) => {}
                Err(e) => panic!("unexpected save error: {e}"),
            }
        }

        assert!(!store.paths().backup_file().exists());
        assert!(at_rest_contains(store.paths(), PASS, &tx.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_queued_behind_offloaded_save_land_in_next_image() {
        let (store, _dir) = test_store();
        store.initialize_for_user(USER, PASS).await.unwrap();
        let first = sample_tx();
        store.with_database(|db| db.upsert_transaction(&first)).await.unwrap();

        let second = sample_tx();
        let writer = {
            let s = Arc::clone(&store);
            let tx = second.clone();
            tokio::spawn(async move { s.with_database(|db| db.upsert_transaction(&tx)).await })
        };
        store.save().await.unwrap();
        writer.await.unwrap().unwrap();

        assert_eq!(store.state().await, StoreState::Loaded);
        assert!(at_rest_contains(store.paths(), PASS, &first.id));

        store.save().await.unwrap();
        assert!(at_rest_contains(store.paths(), PASS, &second.id));
    }

    #[tokio::test]
    async fn stale_working_copy_is_replaced_on_load() {
        let (store, _dir) = test_store();
        let paths = store.paths().clone();
        fs::create_dir_all(paths.transient_dir()).unwrap();
        fs::write(paths.working_file(), b"leftover plaintext").unwrap();

        store.initialize_for_user(USER, PASS).await.unwrap();
        store.health_check().await.unwrap();
    }

    #[test]
    fn drop_while_loaded_saves_and_removes_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("data"), dir.path().join("run"), "pos");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let store = EncryptedStore::new(paths.clone());
        runtime.block_on(store.initialize_for_user(USER, PASS)).unwrap();
        drop(store);

        assert!(!paths.working_file().exists());
        assert!(paths.at_rest_file().exists());
    }

    #[test]
    fn secure_delete_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        secure_delete(&dir.path().join("missing")).unwrap();
    }
}
