//! Copy-on-write overlay over a base store.
//!
//! Batches written to a [`StagedStore`] land in an in-memory overlay; reads
//! see the overlay first and fall back to the base. Nothing reaches the base
//! until the caller takes [`StagedStore::into_batch`] and commits it, so a
//! chain of dependent steps can be staged and then applied as one batch or
//! dropped.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type Overlay = BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>;

pub struct StagedStore<'a, S: KeyValueStore + ?Sized> {
    base: &'a S,
    overlay: RwLock<Overlay>,
}

impl<'a, S: KeyValueStore + ?Sized> StagedStore<'a, S> {
    pub fn new(base: &'a S) -> Self {
        Self {
            base,
            overlay: RwLock::new(Overlay::new()),
        }
    }

    /// Number of distinct keys touched so far.
    pub fn staged_len(&self) -> Result<usize, StoreError> {
        Ok(self.read_overlay()?.len())
    }

    /// Collapses the overlay into one batch holding the final value per key.
    pub fn into_batch(self) -> Result<WriteBatch, StoreError> {
        let overlay = self
            .overlay
            .into_inner()
            .map_err(|_| StoreError::Poisoned("staged overlay"))?;
        let mut batch = WriteBatch::new();
        for ((column, key), value) in overlay {
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        Ok(batch)
    }

    fn read_overlay(&self) -> Result<std::sync::RwLockReadGuard<'_, Overlay>, StoreError> {
        self.overlay
            .read()
            .map_err(|_| StoreError::Poisoned("staged overlay"))
    }

    fn merged_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.scan_prefix(column, prefix)?.into_iter().collect();
        let overlay = self.read_overlay()?;
        let start = (column, prefix.to_vec());
        for ((entry_column, key), value) in
            overlay.range((Bound::Included(start), Bound::Unbounded))
        {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for StagedStore<'_, S> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(staged) = self.read_overlay()?.get(&(column, key.to_vec())) {
            return Ok(staged.clone());
        }
        self.base.get(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.merged_prefix(column, prefix)
    }

    fn for_each_prefix<'v>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'v>,
    ) -> Result<(), StoreError> {
        for (key, value) in self.merged_prefix(column, prefix)? {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut overlay = self
            .overlay
            .write()
            .map_err(|_| StoreError::Poisoned("staged overlay"))?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    overlay.insert(
                        (*column, key.as_slice().to_vec()),
                        Some(value.as_slice().to_vec()),
                    );
                }
                WriteOp::Delete { column, key } => {
                    overlay.insert((*column, key.as_slice().to_vec()), None);
                }
            }
        }
        Ok(())
    }
}
