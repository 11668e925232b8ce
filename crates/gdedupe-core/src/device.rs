//! A live dedupe device: the exposed provider `dedupe/<name>`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bio::Bio;
use crate::config::DeviceOptions;
use crate::error::DedupeResult;
use crate::metadata::Label;
use crate::pipeline::DeviceIo;
use crate::provider::{AccessCounts, Provider};
use crate::stats::DeviceStats;

/// Prefix of every exposed provider name.
pub const PROVIDER_PREFIX: &str = "dedupe/";

/// Exposed provider name for device `name`.
pub fn provider_name(name: &str) -> String {
    format!("{}{}", PROVIDER_PREFIX, name)
}

/// Configuration dump of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Exposed provider name
    pub provider: String,
    /// Underlying provider name
    pub consumer: String,
    /// Content store backing provider name
    pub store: String,
    /// Exposed sector size
    pub sector_size: u32,
    /// Exposed media size
    pub media_size: u64,
    /// Dedupe block size
    pub block_size: u32,
    /// Open counts on the exposed provider
    pub access: AccessCounts,
    /// Mapped logical blocks
    pub mapped_blocks: usize,
    /// Mapped blocks not yet flushed
    pub dirty_blocks: usize,
    /// Underlying provider has gone away
    pub orphaned: bool,
    /// Current options
    pub options: DeviceOptions,
    /// Request counters
    pub stats: DeviceStats,
}

/// One dedupe device instance.
pub struct DedupeDevice {
    label: Label,
    io: DeviceIo,
    access: Mutex<AccessCounts>,
}

impl DedupeDevice {
    /// Wrap a pipeline built over the labelled provider.
    pub fn new(label: Label, io: DeviceIo) -> Self {
        Self {
            label,
            io,
            access: Mutex::new(AccessCounts::default()),
        }
    }

    /// Device name without prefix.
    pub fn device_name(&self) -> &str {
        &self.label.name
    }

    /// Label this device was created or attached with.
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// The request pipeline.
    pub fn io(&self) -> &DeviceIo {
        &self.io
    }

    /// The underlying provider.
    pub fn consumer(&self) -> &Arc<dyn Provider> {
        self.io.provider()
    }

    /// Current options.
    pub fn options(&self) -> DeviceOptions {
        self.io.options()
    }

    /// Replace the options.
    pub fn set_options(&self, options: DeviceOptions) {
        self.io.set_options(options);
    }

    /// Request counters.
    pub fn stats(&self) -> DeviceStats {
        self.io.stats()
    }

    /// Mark the underlying provider gone.
    pub fn orphan(&self) {
        warn!(device = %self.io.name(), consumer = %self.consumer().name(), "underlying provider orphaned");
        self.io.orphan();
    }

    /// Configuration dump.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.label.name.clone(),
            provider: self.io.name().to_string(),
            consumer: self.consumer().name().to_string(),
            store: self.io.store().backing().name().to_string(),
            sector_size: self.io.geometry().sector_size,
            media_size: self.io.media_size(),
            block_size: self.io.geometry().block_size,
            access: *self.access.lock(),
            mapped_blocks: self.io.map().len(),
            dirty_blocks: self.io.map().dirty_count(),
            orphaned: self.io.is_orphaned(),
            options: self.io.options(),
            stats: self.io.stats(),
        }
    }

    /// Stop accepting I/O, wait for requests in flight and hand back the
    /// opens forwarded to the underlying provider. The block map stays in
    /// the store, so the device can be attached again. Returns how many
    /// blocks remain mapped.
    pub async fn detach(&self) -> usize {
        self.io.orphan();
        self.io.quiesce().await;
        let held = std::mem::take(&mut *self.access.lock());
        if held.is_open() {
            if let Err(e) = self.consumer().access(
                -(held.read as i32),
                -(held.write as i32),
                -(held.exclusive as i32),
            ) {
                warn!(device = %self.io.name(), error = %e, "closing consumer failed");
            }
        }
        let mapped = self.io.map().len();
        info!(device = %self.io.name(), mapped, "device detached");
        mapped
    }
}

#[async_trait]
impl Provider for DedupeDevice {
    fn name(&self) -> &str {
        self.io.name()
    }

    fn sector_size(&self) -> u32 {
        self.io.geometry().sector_size
    }

    fn media_size(&self) -> u64 {
        self.io.media_size()
    }

    async fn read_at(&self, offset: u64, len: usize) -> DedupeResult<Bytes> {
        let done = self.io.submit(&mut Bio::read(offset, len as u64)).await?;
        Ok(done.data.unwrap_or_default())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> DedupeResult<()> {
        self.io.submit(&mut Bio::write(offset, data)).await?;
        Ok(())
    }

    async fn delete(&self, offset: u64, len: u64) -> DedupeResult<()> {
        self.io.submit(&mut Bio::delete(offset, len)).await?;
        Ok(())
    }

    async fn flush(&self) -> DedupeResult<()> {
        self.io.submit(&mut Bio::flush()).await?;
        Ok(())
    }

    /// Forwards the deltas to the underlying provider; local counts change
    /// only if the underlying provider accepts them.
    fn access(&self, dr: i32, dw: i32, de: i32) -> DedupeResult<()> {
        let mut counts = self.access.lock();
        let next = counts.apply(self.io.name(), dr, dw, de)?;
        self.consumer().access(dr, dw, de)?;
        *counts = next;
        Ok(())
    }

    fn access_counts(&self) -> AccessCounts {
        *self.access.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::{ContentStore, ContentStoreConfig};
    use crate::debug::DebugLevel;
    use crate::error::DedupeError;
    use crate::provider::MemProvider;

    fn device() -> (Arc<MemProvider>, DedupeDevice) {
        let pool = Arc::new(MemProvider::new("pool0", 512, 32 * 4096 + 3 * 512));
        let disk = Arc::new(MemProvider::new("md0", 512, 16 * 4096 + 512));
        let store = Arc::new(ContentStore::new(ContentStoreConfig::default(), pool).unwrap());
        let io = DeviceIo::new(
            provider_name("dd0"),
            16 * 4096,
            4,
            store.volume("dd0"),
            store,
            disk.clone(),
            Arc::new(DebugLevel::default()),
        )
        .unwrap();
        let label = Label::new("dd0", disk.media_size()).unwrap();
        (disk, DedupeDevice::new(label, io))
    }

    #[test]
    fn test_provider_name() {
        assert_eq!(provider_name("dd0"), "dedupe/dd0");
    }

    #[tokio::test]
    async fn test_provider_io() {
        let (_, dev) = device();
        assert_eq!(dev.name(), "dedupe/dd0");
        assert_eq!(dev.media_size(), 16 * 4096);
        let data = Bytes::from(vec![3u8; 8192]);
        dev.write_at(4096, data.clone()).await.unwrap();
        assert_eq!(dev.read_at(4096, 8192).await.unwrap(), data);
        dev.delete(4096, 4096).await.unwrap();
        dev.flush().await.unwrap();

        let stats = dev.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(dev.info().mapped_blocks, 1);
    }

    #[test]
    fn test_access_propagates() {
        let (disk, dev) = device();
        dev.access(1, 1, 0).unwrap();
        assert_eq!(disk.access_counts().read, 1);
        assert_eq!(disk.access_counts().write, 1);

        disk.access(0, 0, 1).unwrap();
        assert!(matches!(dev.access(0, 0, 1), Err(DedupeError::Busy { .. })));
        assert_eq!(dev.access_counts().exclusive, 0);

        assert!(matches!(dev.access(-2, 0, 0), Err(DedupeError::InvalidRequest { .. })));
        dev.access(-1, -1, 0).unwrap();
        assert!(!dev.access_counts().is_open());
    }

    #[tokio::test]
    async fn test_detach_closes_and_keeps_mappings() {
        let (disk, dev) = device();
        dev.access(1, 0, 0).unwrap();
        dev.write_at(0, Bytes::from(vec![1u8; 4096])).await.unwrap();
        assert_eq!(dev.detach().await, 1);
        assert!(!disk.access_counts().is_open());
        assert!(!dev.access_counts().is_open());
        assert!(dev.read_at(0, 512).await.is_err());

        let store = dev.io().store();
        assert_eq!(store.len(), 1);
        assert_eq!(store.volume("dd0").len(), 1);
    }

    #[test]
    fn test_info_serializes() {
        let (_, dev) = device();
        let info = dev.info();
        assert_eq!(info.consumer, "md0");
        assert_eq!(info.store, "pool0");
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"provider\":\"dedupe/dd0\""));
    }
}
