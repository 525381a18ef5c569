//! Per emission point document numbering.
//!
//! Counters live in the `sequences` tree as big-endian `u64`. Allocation can
//! run inside a wider sled transaction so that the counter moves together
//! with the document it numbers.

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sri_einv_core::models::DocumentType;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::StoreError;

pub const MAX_SEQUENCE: u64 = 999_999_999;

/// Counter identity: issuer, establishment, emission point and document type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub issuer_ruc: String,
    pub establishment: String,
    pub emission_point: String,
    pub document_type: DocumentType,
}

impl SequenceKey {
    /// Lock scope: every document type of one emission point.
    pub fn emission_point_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.issuer_ruc, self.establishment, self.emission_point
        )
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.emission_point_id(),
            self.document_type.code()
        )
    }
}

pub fn format_sequence(value: u64) -> String {
    format!("{value:09}")
}

fn decode_counter(key: &SequenceKey, raw: Option<&[u8]>) -> Result<u64, StoreError> {
    match raw {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| StoreError::CorruptCounter(key.to_string()))?;
            Ok(u64::from_be_bytes(arr))
        }
    }
}

fn increment(key: &SequenceKey, current: u64) -> Result<u64, StoreError> {
    let next = current + 1;
    if next > MAX_SEQUENCE {
        return Err(StoreError::SequenceExhausted {
            key: key.to_string(),
        });
    }
    Ok(next)
}

/// Bumps the counter inside an open transaction and returns the new value.
pub(crate) fn allocate_in(
    tree: &TransactionalTree,
    key: &SequenceKey,
) -> Result<u64, ConflictableTransactionError<StoreError>> {
    let id = key.to_string();
    let current = tree.get(id.as_bytes())?;
    let current = decode_counter(key, current.as_deref()).map_err(ConflictableTransactionError::Abort)?;
    let next = increment(key, current).map_err(ConflictableTransactionError::Abort)?;
    tree.insert(id.as_bytes(), next.to_be_bytes().to_vec())?;
    Ok(next)
}

#[derive(Clone)]
pub struct SequenceAllocator {
    tree: sled::Tree,
}

impl SequenceAllocator {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn current(&self, key: &SequenceKey) -> Result<u64, StoreError> {
        let raw = self.tree.get(key.to_string().as_bytes())?;
        decode_counter(key, raw.as_deref())
    }

    /// Allocates on its own, without a document riding along.
    pub fn next_sequence(&self, key: &SequenceKey) -> Result<String, StoreError> {
        let next = self.tree.transaction(|tx| allocate_in(tx, key))?;
        Ok(format_sequence(next))
    }

    /// Sets the counter, e.g. when migrating numbering from another system.
    pub fn reset(&self, key: &SequenceKey, value: u64) -> Result<(), StoreError> {
        if value > MAX_SEQUENCE {
            return Err(StoreError::SequenceExhausted {
                key: key.to_string(),
            });
        }
        self.tree
            .insert(key.to_string().as_bytes(), value.to_be_bytes().to_vec())?;
        Ok(())
    }
}

/// One async mutex per key, created on first use and dropped once no guard
/// or waiter refers to it.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn lock(&self, key: &str) -> KeyedLockGuard<'_> {
        let mutex = Arc::clone(self.map().entry(key.to_string()).or_default());
        let guard = mutex.lock_owned().await;
        KeyedLockGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds one key of a [`KeyedLocks`]; the entry is pruned on drop when
/// nobody else holds or awaits it.
pub struct KeyedLockGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedLockGuard<'_> {
    fn drop(&mut self) {
        // The guard owns a clone of the Arc; release it before counting.
        drop(self.guard.take());
        let mut map = self.locks.map();
        if map.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&self.key);
        }
    }
}
