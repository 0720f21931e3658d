// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed last-resort storage for events that could not be delivered.
//!
//! Layout:
//!
//! - tree `events`: `u64` sequence id (8 bytes, big-endian) -> JSON [`LogEvent`]
//! - tree `__sequence`: the last sequence id handed out
//!
//! Each event is written in its own transaction that bumps the persisted
//! counter and inserts the record together, so ids stay strictly increasing
//! and are never reused across restarts, even after records are removed.

use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Config as SledConfig, Db, Tree};
use thiserror::Error;
use tracing::debug;

use crate::constants::{EVENTS_BUCKET, SEQUENCE_BUCKET};
use crate::event::LogEvent;

const SEQUENCE_KEY: &[u8] = b"last";

#[derive(Debug, Error)]
pub enum OverflowError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt sequence value in overflow store")]
    CorruptSequence,
}

/// A batch that was only partly persisted.
#[derive(Debug, Error)]
#[error("persisted {persisted} of {total} events: {source}")]
pub struct PersistError {
    /// Events written before the failure; they stay in the store.
    pub persisted: usize,
    pub total: usize,
    pub source: OverflowError,
}

/// One page of records read by [`OverflowStore::chunk_after`].
#[derive(Debug, Default)]
pub struct OverflowChunk {
    /// Decoded records in key order.
    pub records: Vec<(u64, LogEvent)>,
    /// Ids whose payload could not be decoded. They are left in the store.
    pub undecodable: Vec<u64>,
    /// Highest id in this page; `None` once the store is exhausted.
    pub last: Option<u64>,
}

/// Handle to the overflow database. Cloning shares the same database.
#[derive(Debug, Clone)]
pub struct OverflowStore {
    db: Db,
    events: Tree,
    sequence: Tree,
    path: PathBuf,
}

impl OverflowStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OverflowError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = SledConfig::new()
            .path(&path)
            .cache_capacity(16 * 1024 * 1024)
            .open()?;
        Self::from_db(db, path)
    }

    /// In-memory store discarded on drop.
    pub fn open_ephemeral() -> Result<Self, OverflowError> {
        let db = SledConfig::new().temporary(true).open()?;
        Self::from_db(db, PathBuf::new())
    }

    fn from_db(db: Db, path: PathBuf) -> Result<Self, OverflowError> {
        let events = db.open_tree(EVENTS_BUCKET)?;
        let sequence = db.open_tree(SEQUENCE_BUCKET)?;
        Ok(OverflowStore {
            db,
            events,
            sequence,
            path,
        })
    }

    /// Filesystem location; empty for ephemeral stores.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists every event of `batch` and returns the assigned ids in order.
    ///
    /// Stops at the first failing event; events written before it stay
    /// persisted and are counted in the returned [`PersistError`].
    pub fn persist(&self, batch: &[LogEvent]) -> Result<Vec<u64>, PersistError> {
        let mut ids = Vec::with_capacity(batch.len());
        let failed = |ids: &Vec<u64>, source| PersistError {
            persisted: ids.len(),
            total: batch.len(),
            source,
        };
        for event in batch {
            match self.persist_one(event) {
                Ok(id) => ids.push(id),
                Err(e) => return Err(failed(&ids, e)),
            }
        }
        if let Err(e) = self.db.flush() {
            return Err(failed(&ids, e.into()));
        }
        debug!(
            "OVERFLOW | Persisted {} events, last sequence {:?}",
            ids.len(),
            ids.last()
        );
        Ok(ids)
    }

    fn persist_one(&self, event: &LogEvent) -> Result<u64, OverflowError> {
        let payload = serde_json::to_vec(event)?;

        let result: Result<u64, TransactionError<()>> =
            (&self.events, &self.sequence).transaction(|(events, sequence)| {
                let last = match sequence.get(SEQUENCE_KEY)? {
                    Some(raw) => {
                        decode_key(&raw).ok_or(ConflictableTransactionError::Abort(()))?
                    }
                    None => 0,
                };
                let next = last + 1;
                let key = next.to_be_bytes();
                events.insert(&key[..], payload.as_slice())?;
                sequence.insert(SEQUENCE_KEY, &key[..])?;
                Ok(next)
            });

        match result {
            Ok(id) => Ok(id),
            Err(TransactionError::Abort(())) => Err(OverflowError::CorruptSequence),
            Err(TransactionError::Storage(e)) => Err(OverflowError::Db(e)),
        }
    }

    /// All records in key order.
    pub fn records(&self) -> Result<Vec<(u64, LogEvent)>, OverflowError> {
        self.events
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                let seq = decode_key(&key).ok_or(OverflowError::CorruptSequence)?;
                Ok((seq, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    /// Reads up to `limit` records with ids greater than `after`.
    ///
    /// Only one page is held in memory, so callers can walk a large store by
    /// passing the previous page's `last` back in.
    pub fn chunk_after(&self, after: u64, limit: usize) -> Result<OverflowChunk, OverflowError> {
        let mut chunk = OverflowChunk::default();
        let range = (Bound::Excluded(after.to_be_bytes()), Bound::Unbounded);
        for entry in self.events.range(range).take(limit) {
            let (key, value) = entry?;
            let seq = decode_key(&key).ok_or(OverflowError::CorruptSequence)?;
            match serde_json::from_slice(&value) {
                Ok(event) => chunk.records.push((seq, event)),
                Err(_) => chunk.undecodable.push(seq),
            }
            chunk.last = Some(seq);
        }
        Ok(chunk)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest id ever assigned, including ids of removed records.
    pub fn last_sequence(&self) -> Result<u64, OverflowError> {
        match self.sequence.get(SEQUENCE_KEY)? {
            Some(raw) => decode_key(&raw).ok_or(OverflowError::CorruptSequence),
            None => Ok(0),
        }
    }

    /// Deletes one record; returns whether it existed.
    pub fn remove(&self, seq: u64) -> Result<bool, OverflowError> {
        Ok(self.events.remove(seq.to_be_bytes())?.is_some())
    }

    pub fn flush(&self) -> Result<(), OverflowError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
impl OverflowStore {
    /// Writes raw bytes under `seq` without touching the counter.
    pub(crate) fn insert_raw(&self, seq: u64, payload: &[u8]) {
        self.events.insert(seq.to_be_bytes(), payload).unwrap();
    }

    /// Makes every later `persist` fail.
    pub(crate) fn corrupt_sequence(&self) {
        self.sequence.insert(SEQUENCE_KEY, &b"bad"[..]).unwrap();
    }
}

fn decode_key(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
