//! Per-device logical block map: LBA → content reference.
//!
//! The map only guarantees that each operation is atomic on its own. Keeping
//! reference counts in step with the map is the pipeline's job, under the
//! device range lock.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::block::Lba;
use crate::content_store::ContentRef;

/// One mapped logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    /// Content this block resolves to.
    pub content: ContentRef,
    /// Written since the last completed flush.
    pub dirty: bool,
    /// Map generation at which the entry was installed.
    pub generation: u64,
}

#[derive(Debug, Default)]
struct MapInner {
    entries: BTreeMap<Lba, MapEntry>,
    generation: u64,
}

/// Logical block map of one device.
#[derive(Debug, Default)]
pub struct BlockMap {
    inner: RwLock<MapInner>,
}

impl BlockMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map holding persisted entries. They start clean at generation 0.
    pub fn from_entries(entries: impl IntoIterator<Item = (Lba, ContentRef)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(lba, content)| {
                (
                    lba,
                    MapEntry {
                        content,
                        dirty: false,
                        generation: 0,
                    },
                )
            })
            .collect();
        Self {
            inner: RwLock::new(MapInner {
                entries,
                generation: 0,
            }),
        }
    }

    /// Content mapped at `lba`; `None` means never written (reads as zeros).
    pub fn resolve(&self, lba: Lba) -> Option<ContentRef> {
        self.inner.read().entries.get(&lba).map(|e| e.content)
    }

    /// Full entry at `lba`.
    pub fn entry(&self, lba: Lba) -> Option<MapEntry> {
        self.inner.read().entries.get(&lba).copied()
    }

    /// Install a new mapping, returning the reference it replaced.
    /// The caller releases the old reference after this returns.
    pub fn update(&self, lba: Lba, content: ContentRef) -> Option<ContentRef> {
        let mut inner = self.inner.write();
        inner.generation += 1;
        let entry = MapEntry {
            content,
            dirty: true,
            generation: inner.generation,
        };
        inner.entries.insert(lba, entry).map(|old| old.content)
    }

    /// Remove a mapping, returning the reference it held.
    /// The caller releases it after this returns.
    pub fn remove(&self, lba: Lba) -> Option<ContentRef> {
        self.inner.write().entries.remove(&lba).map(|old| old.content)
    }

    /// Current generation; every `update` advances it.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Clear the dirty flag on entries installed at or before `generation`.
    /// Returns how many entries were cleaned.
    pub fn mark_clean_through(&self, generation: u64) -> usize {
        let mut inner = self.inner.write();
        let mut cleaned = 0;
        for entry in inner.entries.values_mut() {
            if entry.dirty && entry.generation <= generation {
                entry.dirty = false;
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Number of dirty entries.
    pub fn dirty_count(&self) -> usize {
        self.inner.read().entries.values().filter(|e| e.dirty).count()
    }

    /// Number of mapped blocks.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Snapshot of every mapping in LBA order.
    pub fn refs(&self) -> Vec<(Lba, ContentRef)> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|(lba, e)| (*lba, e.content))
            .collect()
    }

    /// Remove every mapping, returning them for release.
    pub fn drain(&self) -> Vec<(Lba, ContentRef)> {
        let entries = std::mem::take(&mut self.inner.write().entries);
        entries.into_iter().map(|(lba, e)| (lba, e.content)).collect()
    }
}
