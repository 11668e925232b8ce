//! Per-device I/O pipeline.
//!
//! Requests move through `Received → Validated → DedupeLookup → Mapped →
//! Completed` (or `Failed`). Writers and deleters hold the range lock
//! exclusively for every block they touch across resolve, put, update and
//! release; readers hold it shared across resolve and get. The old reference
//! of an overwritten block is released only after the new mapping is in the
//! map, so an interrupted write can leak a reference but never free one that
//! is still mapped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{error, warn};

use crate::bio::{Bio, BioCmd, BioCompletion, RequestState};
use crate::block::{BlockGeometry, BlockSpan};
use crate::block_map::BlockMap;
use crate::config::DeviceOptions;
use crate::content_store::{ContentRef, ContentStore};
use crate::debug::DebugLevel;
use crate::dedupe_debug;
use crate::error::{DedupeError, DedupeResult};
use crate::fingerprint::blake3_hash;
use crate::provider::Provider;
use crate::range_lock::RangeLock;
use crate::stats::DeviceStats;

/// Runs the requests of one device against its map and the shared store.
pub struct DeviceIo {
    name: String,
    geometry: BlockGeometry,
    media_size: u64,
    map: Arc<BlockMap>,
    store: Arc<ContentStore>,
    locks: RangeLock,
    provider: Arc<dyn Provider>,
    dbg: Arc<DebugLevel>,
    options: RwLock<DeviceOptions>,
    stats: Mutex<DeviceStats>,
    orphaned: AtomicBool,
}

impl DeviceIo {
    /// Pipeline for a device exposing `media_size` bytes over `provider`,
    /// mapping through `map`, which the store persists under the device name.
    pub fn new(
        name: impl Into<String>,
        media_size: u64,
        lock_stripes: usize,
        map: Arc<BlockMap>,
        store: Arc<ContentStore>,
        provider: Arc<dyn Provider>,
        dbg: Arc<DebugLevel>,
    ) -> DedupeResult<Self> {
        let geometry = BlockGeometry::new(provider.sector_size(), store.block_size())?;
        Ok(Self {
            name: name.into(),
            geometry,
            media_size,
            map,
            store,
            locks: RangeLock::new(lock_stripes),
            provider,
            dbg,
            options: RwLock::new(DeviceOptions::default()),
            stats: Mutex::new(DeviceStats::default()),
            orphaned: AtomicBool::new(false),
        })
    }

    /// Exposed provider name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sector and block sizes.
    pub fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    /// Exposed media size in bytes.
    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    /// The device's block map.
    pub fn map(&self) -> &BlockMap {
        &self.map
    }

    /// The shared content store.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Underlying provider.
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Current options.
    pub fn options(&self) -> DeviceOptions {
        *self.options.read()
    }

    /// Replace the options.
    pub fn set_options(&self, options: DeviceOptions) {
        *self.options.write() = options;
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    /// Mark the underlying provider gone; every later request fails.
    pub fn orphan(&self) {
        self.orphaned.store(true, Ordering::SeqCst);
    }

    /// True once the underlying provider has gone away.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
    }

    /// Wait until every request already holding a range lock has finished.
    pub async fn quiesce(&self) {
        let _hold = self.locks.write_all().await;
    }

    /// Run one request to completion.
    pub async fn submit(&self, bio: &mut Bio) -> DedupeResult<BioCompletion> {
        let result = match bio.cmd {
            BioCmd::Read => self.read(bio).await.map(Some),
            BioCmd::Write => self.write(bio).await.map(|_| None),
            BioCmd::Delete => self.delete(bio).await.map(|_| None),
            BioCmd::Flush => self.flush(bio).await.map(|_| None),
        };
        match result {
            Ok(data) => {
                bio.advance(RequestState::Completed);
                self.stats.lock().record(bio.cmd, bio.completed);
                Ok(BioCompletion::of(bio, data))
            }
            Err(e) => {
                if !bio.state.is_terminal() {
                    bio.advance(RequestState::Failed);
                }
                self.stats.lock().errors += 1;
                if e.is_invariant_violation() {
                    error!(device = %self.name, cmd = %bio.cmd, offset = bio.offset, error = %e, "mapping invariant violated");
                } else {
                    dedupe_debug!(self.dbg, 1, device = %self.name, cmd = %bio.cmd, offset = bio.offset, error = %e, "request failed");
                }
                Err(e)
            }
        }
    }

    fn validate(&self, bio: &mut Bio) -> DedupeResult<Vec<BlockSpan>> {
        if self.is_orphaned() {
            return Err(DedupeError::io(
                bio.offset,
                std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("{}: underlying provider is gone", self.name),
                ),
            ));
        }
        if bio.cmd == BioCmd::Flush {
            bio.advance(RequestState::Validated);
            return Ok(Vec::new());
        }
        if !self.geometry.is_sector_aligned(bio.offset) || !self.geometry.is_sector_aligned(bio.length) {
            return Err(DedupeError::invalid(format!(
                "{} {}+{} not aligned to sector size {}",
                bio.cmd, bio.offset, bio.length, self.geometry.sector_size
            )));
        }
        match bio.offset.checked_add(bio.length) {
            Some(end) if end <= self.media_size => {}
            _ => {
                return Err(DedupeError::invalid(format!(
                    "{} {}+{} beyond media size {}",
                    bio.cmd, bio.offset, bio.length, self.media_size
                )))
            }
        }
        if bio.cmd == BioCmd::Write {
            let len = bio.data.as_ref().map(|d| d.len() as u64);
            if len != Some(bio.length) {
                return Err(DedupeError::invalid(format!(
                    "write payload of {:?} bytes for length {}",
                    len, bio.length
                )));
            }
        }
        bio.advance(RequestState::Validated);
        Ok(self.geometry.split(bio.offset, bio.length))
    }

    /// Roll the fault-injection dice for `cmd`.
    fn inject_failure(&self, bio: &Bio) -> DedupeResult<()> {
        let opts = self.options();
        let prob = match bio.cmd {
            BioCmd::Read => opts.read_fail_prob,
            BioCmd::Write => opts.write_fail_prob,
            _ => 0,
        };
        if prob == 0 || rand::thread_rng().gen_range(0..100) >= prob {
            return Ok(());
        }
        self.stats.lock().injected_failures += 1;
        warn!(device = %self.name, cmd = %bio.cmd, offset = bio.offset, "injected failure");
        Err(DedupeError::io(
            bio.offset,
            std::io::Error::other(format!("{}: injected {} failure", self.name, bio.cmd)),
        ))
    }

    fn span_offset(&self, bio: &Bio, span: &BlockSpan) -> u64 {
        bio.offset + span.buf_offset as u64
    }

    /// True if reads must be hashed here; a verifying store already hashes
    /// everything it returns.
    fn rehash_on_read(&self) -> bool {
        self.options().verify_on_read && !self.store.config().verify_on_read
    }

    /// Fetch mapped content, checking its hash if the device asks for it.
    async fn fetch(&self, content: ContentRef, offset: u64) -> DedupeResult<Bytes> {
        let data = self
            .store
            .get(content)
            .await
            .map_err(|e| e.at_offset(offset))?;
        if self.rehash_on_read() && blake3_hash(&data) != content.hash {
            return Err(DedupeError::CorruptStore {
                hash: content.hash,
                reason: format!("{}: content read at offset {} fails hash check", self.name, offset),
            });
        }
        Ok(data)
    }

    async fn read(&self, bio: &mut Bio) -> DedupeResult<Bytes> {
        let spans = self.validate(bio)?;
        self.inject_failure(bio)?;
        if spans.is_empty() {
            return Ok(Bytes::new());
        }

        let _hold = self.locks.read(spans.iter().map(|s| s.lba)).await;
        let mut buf = BytesMut::zeroed(bio.length as usize);
        for span in &spans {
            let Some(content) = self.map.resolve(span.lba) else {
                continue;
            };
            let data = self.fetch(content, self.span_offset(bio, span)).await?;
            let within = span.within as usize;
            let len = span.len as usize;
            buf[span.buf_offset..span.buf_offset + len].copy_from_slice(&data[within..within + len]);
            dedupe_debug!(self.dbg, 3, device = %self.name, lba = %span.lba, hash = %content.hash.short(), "read block");
        }
        bio.advance(RequestState::Mapped);
        bio.completed = bio.length;
        Ok(buf.freeze())
    }

    async fn write(&self, bio: &mut Bio) -> DedupeResult<()> {
        let spans = self.validate(bio)?;
        self.inject_failure(bio)?;
        if spans.is_empty() {
            return Ok(());
        }
        let data = bio.data.clone().unwrap_or_default();
        bio.advance(RequestState::DedupeLookup);

        let block_size = self.geometry.block_size;
        let _hold = self.locks.write(spans.iter().map(|s| s.lba)).await;
        let mut hits = 0u64;
        for span in &spans {
            let offset = self.span_offset(bio, span);
            let payload = data.slice(span.buf_offset..span.buf_offset + span.len as usize);
            let block = if span.is_full(block_size) {
                payload
            } else {
                let mut block = match self.map.resolve(span.lba) {
                    Some(old) => BytesMut::from(&self.fetch(old, offset).await?[..]),
                    None => BytesMut::zeroed(block_size as usize),
                };
                let within = span.within as usize;
                block[within..within + payload.len()].copy_from_slice(&payload);
                block.freeze()
            };

            let (content, hit) = self
                .store
                .put_tracked(block)
                .await
                .map_err(|e| e.at_offset(offset))?;
            if hit {
                hits += 1;
            }
            let old = self.map.update(span.lba, content);
            if let Some(old) = old {
                self.store
                    .release(old)
                    .await
                    .map_err(|e| e.at_offset(offset))?;
            }
            dedupe_debug!(self.dbg, 3, device = %self.name, lba = %span.lba, hash = %content.hash.short(), hit, "wrote block");
        }
        bio.advance(RequestState::Mapped);
        bio.completed = bio.length;
        self.stats.lock().dedupe_hits += hits;
        dedupe_debug!(self.dbg, 2, device = %self.name, offset = bio.offset, length = bio.length, hits, "write mapped");
        Ok(())
    }

    async fn delete(&self, bio: &mut Bio) -> DedupeResult<()> {
        let spans = self.validate(bio)?;
        if spans.is_empty() {
            return Ok(());
        }

        let block_size = self.geometry.block_size;
        let _hold = self.locks.write(spans.iter().map(|s| s.lba)).await;
        for span in &spans {
            let offset = self.span_offset(bio, span);
            let old = if span.is_full(block_size) {
                self.map.remove(span.lba)
            } else {
                let Some(old) = self.map.resolve(span.lba) else {
                    continue;
                };
                let mut block = BytesMut::from(&self.fetch(old, offset).await?[..]);
                let within = span.within as usize;
                block[within..within + span.len as usize].fill(0);
                if block.iter().all(|b| *b == 0) {
                    self.map.remove(span.lba)
                } else {
                    let content = self
                        .store
                        .put(block.freeze())
                        .await
                        .map_err(|e| e.at_offset(offset))?;
                    self.map.update(span.lba, content)
                }
            };
            if let Some(old) = old {
                self.store
                    .release(old)
                    .await
                    .map_err(|e| e.at_offset(offset))?;
                dedupe_debug!(self.dbg, 3, device = %self.name, lba = %span.lba, hash = %old.hash.short(), "deleted block");
            }
        }
        bio.advance(RequestState::Mapped);
        bio.completed = bio.length;
        Ok(())
    }

    async fn flush(&self, bio: &mut Bio) -> DedupeResult<()> {
        self.validate(bio)?;
        let generation = self.map.generation();
        let committed = self.store.checkpoint().await?;
        if self.store.backing().name() != self.provider.name() {
            self.provider.flush().await?;
        }
        let cleaned = self.map.mark_clean_through(generation);
        dedupe_debug!(self.dbg, 2, device = %self.name, generation, committed, cleaned, "flush complete");
        Ok(())
    }
}
