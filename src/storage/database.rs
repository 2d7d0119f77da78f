// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Working database backed by redb (pure Rust, ACID).
//!
//! This is the plaintext image that the encrypted store decrypts into the
//! transient directory. It is only ever opened through
//! [`EncryptedStore::with_database`](super::EncryptedStore::with_database).
//!
//! ## Table Layout
//!
//! - `transactions`: transaction id → serialized [`Transaction`]
//! - `audit_events`: `timestamp_be|event_id` → serialized [`AuditEvent`]
//! - `metadata`: key → value (schema version)

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::audit::AuditEvent;
use crate::models::{Transaction, TransactionStatus};

// =============================================================================
// Table Definitions
// =============================================================================

const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");

/// Key format: `timestamp_millis_be | event_id` so a forward scan is
/// chronological.
const AUDIT_EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("audit_events");

const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u32),
}

pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// WorkingDatabase
// =============================================================================

/// Live connection to the decrypted working copy.
pub struct WorkingDatabase {
    db: Database,
}

impl WorkingDatabase {
    /// Open (or create) the database at `path` and make sure every table
    /// exists.
    pub fn open(path: &Path) -> DbResult<Self> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TRANSACTIONS)?;
            let _ = write_txn.open_table(AUDIT_EVENTS)?;
            let mut meta = write_txn.open_table(METADATA)?;
            let existing = meta
                .get(SCHEMA_VERSION_KEY)?
                .map(|v| read_u32(v.value()));
            match existing {
                None => {
                    meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_be_bytes().as_slice())?;
                }
                Some(version) if version > SCHEMA_VERSION => {
                    return Err(DbError::UnsupportedSchema(version));
                }
                Some(_) => {}
            }
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub fn schema_version(&self) -> DbResult<u32> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(METADATA)?;
        Ok(table
            .get(SCHEMA_VERSION_KEY)?
            .map(|v| read_u32(v.value()))
            .unwrap_or(0))
    }

    /// Cheap liveness probe: a read transaction over every table.
    pub fn health_check(&self) -> DbResult<()> {
        let read_txn = self.db.begin_read()?;
        let _ = read_txn.open_table(TRANSACTIONS)?;
        let _ = read_txn.open_table(AUDIT_EVENTS)?;
        let _ = read_txn.open_table(METADATA)?;
        Ok(())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Insert or replace a transaction record.
    pub fn upsert_transaction(&self, tx: &Transaction) -> DbResult<()> {
        let json = serde_json::to_vec(tx)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRANSACTIONS)?;
            table.insert(tx.id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Persist several records in one commit (reversal + original).
    pub fn upsert_transactions(&self, txs: &[&Transaction]) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRANSACTIONS)?;
            for tx in txs {
                let json = serde_json::to_vec(tx)?;
                table.insert(tx.id.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a transaction; `Ok(None)` when it does not exist.
    pub fn get_transaction(&self, id: &str) -> DbResult<Option<Transaction>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All transactions with the given status, oldest first.
    pub fn list_by_status(&self, status: TransactionStatus) -> DbResult<Vec<Transaction>> {
        let mut matching: Vec<Transaction> = self
            .list_transactions()?
            .into_iter()
            .filter(|tx| tx.status == status)
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    /// Reversal records pointing at `original_id`.
    pub fn list_reversals_of(&self, original_id: &str) -> DbResult<Vec<Transaction>> {
        Ok(self
            .list_transactions()?
            .into_iter()
            .filter(|tx| tx.original_transaction_id.as_deref() == Some(original_id))
            .collect())
    }

    pub fn list_transactions(&self) -> DbResult<Vec<Transaction>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_slice::<Transaction>(value.value()) {
                Ok(tx) => out.push(tx),
                Err(e) => {
                    tracing::warn!(id = %key.value(), error = %e, "Skipping malformed transaction record");
                }
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    pub fn append_audit(&self, event: &AuditEvent) -> DbResult<()> {
        let key = audit_key(event);
        let json = serde_json::to_vec(event)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIT_EVENTS)?;
            table.insert(key.as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Most recent audit events, newest first.
    pub fn recent_audit_events(&self, limit: usize) -> DbResult<Vec<AuditEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_EVENTS)?;

        let mut out = Vec::with_capacity(limit);
        for entry in table.iter()?.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }
}

fn audit_key(event: &AuditEvent) -> Vec<u8> {
    let millis = event.timestamp.timestamp_millis();
    let mut key = Vec::with_capacity(8 + 1 + event.event_id.len());
    // Offset so negative timestamps still sort before positive ones.
    key.extend_from_slice(&((millis as u64) ^ (1 << 63)).to_be_bytes());
    key.push(b'|');
    key.extend_from_slice(event.event_id.as_bytes());
    key
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = bytes.len().min(4);
    buf[..n].copy_from_slice(&bytes[..n]);
    u32::from_be_bytes(buf)
}

// =============================================================================
// Tests
// =============================================================================
