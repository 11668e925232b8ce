//! Block provider abstraction.
//!
//! A [`Provider`] is a named block source with a sector size and a media
//! size. The dedupe layer consumes one (the underlying provider), stores
//! content on one (the store's backing provider) and is itself exposed as one.
//! [`MemProvider`] and [`FileProvider`] are the concrete sources; the
//! [`ProviderRegistry`] is the provider namespace devices are created against.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DedupeError, DedupeResult};

/// Open counts held on a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCounts {
    /// Read opens
    pub read: u32,
    /// Write opens
    pub write: u32,
    /// Exclusive opens
    pub exclusive: u32,
}

impl AccessCounts {
    /// True if any open is held.
    pub fn is_open(&self) -> bool {
        self.read > 0 || self.write > 0 || self.exclusive > 0
    }

    /// Applies signed deltas, returning the new counts.
    ///
    /// Totals may not go negative and at most one exclusive open is allowed.
    pub fn apply(&self, name: &str, dr: i32, dw: i32, de: i32) -> DedupeResult<AccessCounts> {
        let add = |cur: u32, delta: i32, what: &str| -> DedupeResult<u32> {
            let next = cur as i64 + delta as i64;
            if next < 0 {
                return Err(DedupeError::invalid(format!(
                    "{} {} count would drop below zero ({} {:+})",
                    name, what, cur, delta
                )));
            }
            Ok(next as u32)
        };
        let next = AccessCounts {
            read: add(self.read, dr, "read")?,
            write: add(self.write, dw, "write")?,
            exclusive: add(self.exclusive, de, "exclusive")?,
        };
        if de > 0 && next.exclusive > 1 {
            return Err(DedupeError::Busy {
                name: name.to_string(),
                reason: "already opened exclusively".to_string(),
            });
        }
        Ok(next)
    }
}

/// Mutex-guarded access counts shared by provider implementations.
#[derive(Debug, Default)]
pub struct AccessTracker {
    counts: Mutex<AccessCounts>,
}

impl AccessTracker {
    /// Applies deltas atomically.
    pub fn apply(&self, name: &str, dr: i32, dw: i32, de: i32) -> DedupeResult<()> {
        let mut counts = self.counts.lock();
        *counts = counts.apply(name, dr, dw, de)?;
        Ok(())
    }

    /// Current counts.
    pub fn get(&self) -> AccessCounts {
        *self.counts.lock()
    }
}

/// A named block source.
///
/// Offsets and lengths passed to I/O methods are sector-aligned; failures are
/// reported as [`DedupeError::IoError`] carrying the failing offset.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g. "md0", "dedupe/dd0").
    fn name(&self) -> &str;

    /// Sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Usable size in bytes.
    fn media_size(&self) -> u64;

    /// Read `len` bytes at `offset`.
    async fn read_at(&self, offset: u64, len: usize) -> DedupeResult<Bytes>;

    /// Write `data` at `offset`.
    async fn write_at(&self, offset: u64, data: Bytes) -> DedupeResult<()>;

    /// Discard the range; later reads return zeros.
    async fn delete(&self, offset: u64, len: u64) -> DedupeResult<()>;

    /// Barrier: every write completed before the call is durable when it returns.
    async fn flush(&self) -> DedupeResult<()>;

    /// Adjust open counts by the given deltas.
    fn access(&self, dr: i32, dw: i32, de: i32) -> DedupeResult<()>;

    /// Current open counts.
    fn access_counts(&self) -> AccessCounts;
}

fn check_range(provider: &dyn Provider, offset: u64, len: u64) -> DedupeResult<()> {
    let sector = provider.sector_size() as u64;
    if offset % sector != 0 || len % sector != 0 {
        return Err(DedupeError::io(
            offset,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{}: unaligned access {}+{}", provider.name(), offset, len),
            ),
        ));
    }
    match offset.checked_add(len) {
        Some(end) if end <= provider.media_size() => Ok(()),
        _ => Err(DedupeError::io(
            offset,
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{}: access {}+{} beyond media size {}",
                    provider.name(),
                    offset,
                    len,
                    provider.media_size()
                ),
            ),
        )),
    }
}

/// I/O statistics of a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Read operations completed
    pub reads: u64,
    /// Write operations completed
    pub writes: u64,
    /// Delete operations completed
    pub deletes: u64,
    /// Flush operations completed
    pub flushes: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Errors returned
    pub errors: u64,
}

/// Faults a [`MemProvider`] should simulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoFaults {
    /// Fail every read
    pub fail_reads: bool,
    /// Fail every write
    pub fail_writes: bool,
    /// Fail every flush
    pub fail_flushes: bool,
}

/// Sparse in-memory provider. Unwritten sectors read as zeros.
pub struct MemProvider {
    name: String,
    sector_size: u32,
    media_size: u64,
    sectors: Mutex<HashMap<u64, Vec<u8>>>,
    stats: Mutex<ProviderStats>,
    faults: Mutex<IoFaults>,
    access: AccessTracker,
}

impl MemProvider {
    /// Create a new zero-filled provider.
    pub fn new(name: impl Into<String>, sector_size: u32, media_size: u64) -> Self {
        Self {
            name: name.into(),
            sector_size,
            media_size,
            sectors: Mutex::new(HashMap::new()),
            stats: Mutex::new(ProviderStats::default()),
            faults: Mutex::new(IoFaults::default()),
            access: AccessTracker::default(),
        }
    }

    /// Replace the set of simulated faults.
    pub fn inject_faults(&self, faults: IoFaults) {
        *self.faults.lock() = faults;
    }

    /// Number of sectors currently holding data.
    pub fn resident_sectors(&self) -> usize {
        self.sectors.lock().len()
    }

    /// Get current I/O statistics.
    pub fn stats(&self) -> ProviderStats {
        self.stats.lock().clone()
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut ProviderStats),
    {
        f(&mut self.stats.lock());
    }

    fn fail(&self, offset: u64, what: &str) -> DedupeError {
        self.update_stats(|s| s.errors += 1);
        DedupeError::io(
            offset,
            std::io::Error::other(format!("{}: injected {} failure", self.name, what)),
        )
    }
}

#[async_trait]
impl Provider for MemProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn media_size(&self) -> u64 {
        self.media_size
    }

    async fn read_at(&self, offset: u64, len: usize) -> DedupeResult<Bytes> {
        check_range(self, offset, len as u64)?;
        if self.faults.lock().fail_reads {
            return Err(self.fail(offset, "read"));
        }
        let sector = self.sector_size as u64;
        let mut out = vec![0u8; len];
        {
            let sectors = self.sectors.lock();
            for (i, chunk) in out.chunks_mut(sector as usize).enumerate() {
                if let Some(data) = sectors.get(&(offset / sector + i as u64)) {
                    chunk.copy_from_slice(data);
                }
            }
        }
        self.update_stats(|s| {
            s.reads += 1;
            s.bytes_read += len as u64;
        });
        Ok(Bytes::from(out))
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> DedupeResult<()> {
        check_range(self, offset, data.len() as u64)?;
        if self.faults.lock().fail_writes {
            return Err(self.fail(offset, "write"));
        }
        let sector = self.sector_size as u64;
        {
            let mut sectors = self.sectors.lock();
            for (i, chunk) in data.chunks(sector as usize).enumerate() {
                let idx = offset / sector + i as u64;
                if chunk.iter().all(|b| *b == 0) {
                    sectors.remove(&idx);
                } else {
                    sectors.insert(idx, chunk.to_vec());
                }
            }
        }
        self.update_stats(|s| {
            s.writes += 1;
            s.bytes_written += data.len() as u64;
        });
        Ok(())
    }

    async fn delete(&self, offset: u64, len: u64) -> DedupeResult<()> {
        check_range(self, offset, len)?;
        let sector = self.sector_size as u64;
        {
            let mut sectors = self.sectors.lock();
            for idx in offset / sector..(offset + len) / sector {
                sectors.remove(&idx);
            }
        }
        self.update_stats(|s| s.deletes += 1);
        Ok(())
    }

    async fn flush(&self) -> DedupeResult<()> {
        if self.faults.lock().fail_flushes {
            return Err(self.fail(0, "flush"));
        }
        debug!(provider = %self.name, "flush");
        self.update_stats(|s| s.flushes += 1);
        Ok(())
    }

    fn access(&self, dr: i32, dw: i32, de: i32) -> DedupeResult<()> {
        self.access.apply(&self.name, dr, dw, de)
    }

    fn access_counts(&self) -> AccessCounts {
        self.access.get()
    }
}

/// File-backed provider using positional I/O on the blocking thread pool.
pub struct FileProvider {
    name: String,
    sector_size: u32,
    media_size: u64,
    file: Arc<File>,
    access: AccessTracker,
}

fn check_sector_size(path: &Path, sector_size: u32) -> DedupeResult<()> {
    if sector_size == 0 || !sector_size.is_power_of_two() {
        return Err(DedupeError::invalid(format!(
            "{}: sector size {} is not a power of two",
            path.display(),
            sector_size
        )));
    }
    Ok(())
}

impl FileProvider {
    /// Create (or truncate) a backing file of `media_size` bytes.
    pub fn create(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        sector_size: u32,
        media_size: u64,
    ) -> DedupeResult<Self> {
        check_sector_size(path.as_ref(), sector_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| DedupeError::io(0, e))?;
        file.set_len(media_size).map_err(|e| DedupeError::io(0, e))?;
        Ok(Self {
            name: name.into(),
            sector_size,
            media_size,
            file: Arc::new(file),
            access: AccessTracker::default(),
        })
    }

    /// Open an existing backing file; the media size is the file length
    /// rounded down to a whole sector.
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        sector_size: u32,
    ) -> DedupeResult<Self> {
        check_sector_size(path.as_ref(), sector_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| DedupeError::io(0, e))?;
        let len = file.metadata().map_err(|e| DedupeError::io(0, e))?.len();
        Ok(Self {
            name: name.into(),
            sector_size,
            media_size: len - len % sector_size as u64,
            file: Arc::new(file),
            access: AccessTracker::default(),
        })
    }

    /// Open the backing file if it exists and is non-empty, otherwise
    /// create it with `media_size` bytes. Existing contents are kept.
    pub fn open_or_create(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        sector_size: u32,
        media_size: u64,
    ) -> DedupeResult<Self> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => Self::open(name, path, sector_size),
            _ => Self::create(name, path, sector_size, media_size),
        }
    }

    async fn blocking<T, F>(&self, offset: u64, f: F) -> DedupeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || f(file.as_ref()))
            .await
            .map_err(|e| DedupeError::io(offset, std::io::Error::other(e.to_string())))?
            .map_err(|e| DedupeError::io(offset, e))
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn media_size(&self) -> u64 {
        self.media_size
    }

    async fn read_at(&self, offset: u64, len: usize) -> DedupeResult<Bytes> {
        check_range(self, offset, len as u64)?;
        let buf = self
            .blocking(offset, move |file| {
                let mut buf = vec![0u8; len];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            })
            .await?;
        Ok(Bytes::from(buf))
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> DedupeResult<()> {
        check_range(self, offset, data.len() as u64)?;
        self.blocking(offset, move |file| file.write_all_at(&data, offset))
            .await
    }

    async fn delete(&self, offset: u64, len: u64) -> DedupeResult<()> {
        check_range(self, offset, len)?;
        let zeros = Bytes::from(vec![0u8; len as usize]);
        self.blocking(offset, move |file| file.write_all_at(&zeros, offset))
            .await
    }

    async fn flush(&self) -> DedupeResult<()> {
        self.blocking(0, |file| file.sync_data()).await
    }

    fn access(&self, dr: i32, dw: i32, de: i32) -> DedupeResult<()> {
        self.access.apply(&self.name, dr, dw, de)
    }

    fn access_counts(&self) -> AccessCounts {
        self.access.get()
    }
}

/// Name → provider namespace.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    pub fn insert(&self, provider: Arc<dyn Provider>) -> DedupeResult<()> {
        let name = provider.name().to_string();
        match self.providers.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(DedupeError::AlreadyExists {
                name: e.key().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                debug!(provider = %e.key(), "provider registered");
                e.insert(provider);
                Ok(())
            }
        }
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> DedupeResult<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| DedupeError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    /// Unregister a provider, returning it if present.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.remove(name).map(|(_, p)| p)
    }

    /// True if a provider with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Sorted provider names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
