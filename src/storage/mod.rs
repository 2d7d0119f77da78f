// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Encrypted Storage Module
//!
//! Transactions and audit events live in an embedded redb database. At rest
//! the database exists only as one AES-256-GCM encrypted file; while the
//! store is loaded a decrypted working copy lives in a transient directory.
//!
//! ## Security Model
//!
//! - The key is derived from the user's identity secret and passphrase
//!   (PBKDF2-HMAC-SHA256) and is never written anywhere
//! - Wrong passphrase and tampered files are indistinguishable
//! - The working copy is zero-overwritten and deleted on close
//! - Saves go through a backup so a crash never loses both copies
//!
//! ## Storage Layout
//!
//! See [`paths`].

pub mod audit;
pub mod autosave;
pub mod database;
pub mod encrypted_store;
pub mod paths;
pub mod preferences;

pub use audit::{AuditEvent, AuditEventType};
pub use autosave::{AutoSaver, DEFAULT_AUTOSAVE_INTERVAL};
pub use database::{DbError, DbResult, WorkingDatabase, SCHEMA_VERSION};
pub use encrypted_store::{EncryptedStore, StoreError, StoreResult, StoreState};
pub use paths::{StorePaths, DEFAULT_DATABASE_NAME};
pub use preferences::{
    JsonFilePreferences, MemoryPreferences, PreferenceError, PreferenceResult, PreferenceStore,
};
