//! Content-addressable block store with reference counting.
//!
//! One store is one dedupe domain: every device that shares it shares its
//! physical blocks. The hash index is split into buckets, each behind its own
//! async mutex, so reference-count changes are atomic per hash without any
//! store-wide lock and without any dependency on device locks. The store
//! never calls back into a device; devices always take their own locks first.
//!
//! Physical block `n` lives at byte offset `n * block_size` of the backing
//! provider. The last three sectors of the backing provider are never handed
//! out: two hold checkpoint headers and the last is left for a device label.
//!
//! The store also owns the block map of every volume, attached or not, and
//! persists them all in one [`checkpoint`](crate::checkpoint). The content
//! index is not written out: on open it is rebuilt from the persisted maps,
//! with each reference count set to the number of mappings naming the block.
//! A slot reclaimed at refcount zero stays allocated until the next
//! checkpoint commits, so the committed checkpoint never points at reused
//! storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::allocator::{AllocatorConfig, AllocatorStats, BlockAllocator};
use crate::block::{PhysicalBlock, DEFAULT_BLOCK_SIZE};
use crate::block_map::BlockMap;
use crate::checkpoint::{
    self, Checkpoint, CheckpointHeader, LoadedCheckpoint, VolumeRecord, HEADER_SLOTS,
};
use crate::error::{DedupeError, DedupeResult};
use crate::fingerprint::{blake3_hash, ContentHash};
use crate::provider::Provider;

/// Handle to a live content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    /// Content hash (the CAS key).
    pub hash: ContentHash,
    /// Physical slot holding the bytes.
    pub block: PhysicalBlock,
}

/// Configuration for a content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    /// Content block size in bytes
    pub block_size: u32,
    /// Number of hash index buckets (power of two)
    pub hash_buckets: usize,
    /// Byte-compare stored data on every hash hit
    pub verify_on_dedupe: bool,
    /// Re-hash stored data on every read
    pub verify_on_read: bool,
    /// Discard reclaimed blocks on the backing provider
    pub discard_on_release: bool,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            hash_buckets: 64,
            verify_on_dedupe: false,
            verify_on_read: false,
            discard_on_release: false,
        }
    }
}

#[derive(Debug)]
struct ContentEntry {
    block: PhysicalBlock,
    refcount: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    unique_blocks: u64,
    total_refs: u64,
    puts: u64,
    dedupe_hits: u64,
    reclaimed: u64,
    generation: u64,
    checkpoint_blocks: u64,
}

#[derive(Debug, Default)]
struct CommitState {
    /// Generation of the committed checkpoint (0 before the first)
    generation: u64,
    /// Header sector the next commit writes
    next_slot: usize,
    /// Slots holding the committed payload
    chain: Vec<PhysicalBlock>,
}

/// Statistics for a content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Live content blocks
    pub unique_blocks: u64,
    /// Sum of all reference counts
    pub total_refs: u64,
    /// Total `put` calls
    pub puts: u64,
    /// `put` calls satisfied by an existing block
    pub dedupe_hits: u64,
    /// Blocks dropped from the index at refcount zero
    pub reclaimed: u64,
    /// Reclaimed slots waiting for the next checkpoint
    pub pending_blocks: u64,
    /// Slots holding the committed checkpoint
    pub checkpoint_blocks: u64,
    /// Generation of the committed checkpoint
    pub generation: u64,
    /// Bytes of physical storage in use
    pub physical_bytes: u64,
    /// Bytes referenced through block maps
    pub logical_bytes: u64,
    /// Slot allocator state
    pub allocator: AllocatorStats,
}

impl StoreStats {
    /// Logical / physical ratio (1.0 when empty).
    pub fn dedupe_ratio(&self) -> f64 {
        if self.physical_bytes > 0 {
            self.logical_bytes as f64 / self.physical_bytes as f64
        } else {
            1.0
        }
    }
}

/// Shared content-addressable block store.
pub struct ContentStore {
    config: ContentStoreConfig,
    backing: Arc<dyn Provider>,
    total_blocks: u64,
    allocator: BlockAllocator,
    buckets: Vec<AsyncMutex<HashMap<ContentHash, ContentEntry>>>,
    counters: Mutex<StoreCounters>,
    volumes: DashMap<String, Arc<BlockMap>>,
    pending: Mutex<Vec<PhysicalBlock>>,
    commit: AsyncMutex<CommitState>,
}

impl ContentStore {
    /// Create an empty store on a blank backing provider. Use
    /// [`open`](Self::open) to resume a store from its last checkpoint.
    pub fn new(config: ContentStoreConfig, backing: Arc<dyn Provider>) -> DedupeResult<Self> {
        let sector = backing.sector_size();
        if sector == 0
            || config.block_size == 0
            || !config.block_size.is_power_of_two()
            || config.block_size % sector != 0
        {
            return Err(DedupeError::invalid(format!(
                "block size {} incompatible with {} sector size {}",
                config.block_size,
                backing.name(),
                sector
            )));
        }
        if config.hash_buckets == 0 || !config.hash_buckets.is_power_of_two() {
            return Err(DedupeError::invalid(format!(
                "hash bucket count {} is not a power of two",
                config.hash_buckets
            )));
        }

        let data_end = checkpoint::header_offset(backing.as_ref(), 0)?;
        let total_blocks = data_end / config.block_size as u64;
        debug!(
            backing = %backing.name(),
            total_blocks,
            block_size = config.block_size,
            buckets = config.hash_buckets,
            "content store created"
        );

        let buckets = (0..config.hash_buckets)
            .map(|_| AsyncMutex::new(HashMap::new()))
            .collect();
        Ok(Self {
            allocator: BlockAllocator::new(AllocatorConfig { total_blocks }),
            total_blocks,
            config,
            backing,
            buckets,
            counters: Mutex::new(StoreCounters::default()),
            volumes: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            commit: AsyncMutex::new(CommitState::default()),
        })
    }

    /// Open the store on `backing`, restoring every volume map and the
    /// content index from the newest intact checkpoint. A backing with no
    /// checkpoint yields an empty store.
    pub async fn open(config: ContentStoreConfig, backing: Arc<dyn Provider>) -> DedupeResult<Self> {
        let mut store = Self::new(config, backing)?;
        let loaded = checkpoint::load(
            store.backing.as_ref(),
            store.config.block_size,
            store.total_blocks,
        )
        .await?;
        match loaded {
            Some(loaded) => store.restore(loaded)?,
            None => debug!(backing = %store.backing.name(), "no checkpoint, starting empty"),
        }
        Ok(store)
    }

    fn restore(&mut self, loaded: LoadedCheckpoint) -> DedupeResult<()> {
        let provider = self.backing.name().to_string();
        let corrupt = |reason: String| DedupeError::InvalidMetadata {
            provider: provider.clone(),
            reason,
        };

        let mut used: BTreeSet<u64> = loaded.chain.iter().map(|b| b.0).collect();
        let mut index: HashMap<ContentHash, ContentEntry> = HashMap::new();
        let mut total_refs = 0u64;
        for volume in &loaded.checkpoint.volumes {
            for (lba, content) in &volume.blocks {
                if content.block.0 >= self.total_blocks {
                    return Err(corrupt(format!(
                        "{} lba {} maps slot {} beyond {} slots",
                        volume.name, lba, content.block, self.total_blocks
                    )));
                }
                match index.get_mut(&content.hash) {
                    Some(entry) if entry.block == content.block => entry.refcount += 1,
                    Some(entry) => {
                        return Err(corrupt(format!(
                            "{} stored in both {} and {}",
                            content.hash, entry.block, content.block
                        )))
                    }
                    None => {
                        if !used.insert(content.block.0) {
                            return Err(corrupt(format!("slot {} holds two blocks", content.block)));
                        }
                        index.insert(
                            content.hash,
                            ContentEntry {
                                block: content.block,
                                refcount: 1,
                            },
                        );
                    }
                }
                total_refs += 1;
            }
        }

        self.allocator = BlockAllocator::with_used(
            AllocatorConfig {
                total_blocks: self.total_blocks,
            },
            &used,
        )?;
        let unique = index.len() as u64;
        let nbuckets = self.buckets.len();
        for (hash, entry) in index {
            self.buckets[hash.bucket(nbuckets)]
                .get_mut()
                .insert(hash, entry);
        }
        let volumes = loaded.checkpoint.volumes.len();
        for volume in loaded.checkpoint.volumes {
            self.volumes
                .insert(volume.name, Arc::new(BlockMap::from_entries(volume.blocks)));
        }
        {
            let counters = self.counters.get_mut();
            counters.unique_blocks = unique;
            counters.total_refs = total_refs;
            counters.generation = loaded.header.generation;
            counters.checkpoint_blocks = loaded.chain.len() as u64;
        }
        *self.commit.get_mut() = CommitState {
            generation: loaded.header.generation,
            next_slot: (loaded.slot + 1) % HEADER_SLOTS,
            chain: loaded.chain,
        };
        info!(
            backing = %self.backing.name(),
            generation = loaded.header.generation,
            volumes,
            unique_blocks = unique,
            total_refs,
            "content store restored"
        );
        Ok(())
    }

    /// Store configuration.
    pub fn config(&self) -> &ContentStoreConfig {
        &self.config
    }

    /// Content block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// The provider holding the physical blocks.
    pub fn backing(&self) -> &Arc<dyn Provider> {
        &self.backing
    }

    fn bucket(&self, hash: &ContentHash) -> &AsyncMutex<HashMap<ContentHash, ContentEntry>> {
        &self.buckets[hash.bucket(self.buckets.len())]
    }

    fn offset_of(&self, block: PhysicalBlock) -> u64 {
        block.byte_offset(self.config.block_size)
    }

    /// Store one block of content and take a reference to it.
    ///
    /// If the content is already present its reference count is incremented
    /// and `data` is dropped. Concurrent puts of the same content serialize on
    /// the hash bucket, so exactly one physical block results.
    pub async fn put(&self, data: Bytes) -> DedupeResult<ContentRef> {
        self.put_tracked(data).await.map(|(content, _)| content)
    }

    /// Like [`put`](Self::put); the flag is true when existing content was reused.
    pub async fn put_tracked(&self, data: Bytes) -> DedupeResult<(ContentRef, bool)> {
        if data.len() != self.config.block_size as usize {
            return Err(DedupeError::invalid(format!(
                "content block must be {} bytes, got {}",
                self.config.block_size,
                data.len()
            )));
        }
        let hash = blake3_hash(&data);
        let mut bucket = self.bucket(&hash).lock().await;

        if let Some(entry) = bucket.get_mut(&hash) {
            if self.config.verify_on_dedupe {
                let offset = self.offset_of(entry.block);
                let stored = self.backing.read_at(offset, data.len()).await?;
                if stored != data {
                    error!(hash = %hash, block = %entry.block, "hash hit with different content");
                    return Err(DedupeError::CorruptStore {
                        hash,
                        reason: format!("stored bytes at {} differ on hash match", entry.block),
                    });
                }
            }
            entry.refcount += 1;
            let mut counters = self.counters.lock();
            counters.puts += 1;
            counters.dedupe_hits += 1;
            counters.total_refs += 1;
            debug!(hash = %hash.short(), refcount = entry.refcount, "dedupe hit");
            return Ok((
                ContentRef {
                    hash,
                    block: entry.block,
                },
                true,
            ));
        }

        let block = self.allocator.allocate()?;
        if let Err(e) = self.backing.write_at(self.offset_of(block), data).await {
            self.allocator.free(block)?;
            return Err(e);
        }
        bucket.insert(hash, ContentEntry { block, refcount: 1 });
        {
            let mut counters = self.counters.lock();
            counters.puts += 1;
            counters.unique_blocks += 1;
            counters.total_refs += 1;
        }
        debug!(hash = %hash.short(), block = %block, "new content block");
        Ok((ContentRef { hash, block }, false))
    }

    /// Fetch the bytes of a live content block.
    ///
    /// The caller must hold a mapping that references `content` for the
    /// duration of the call; that reference keeps the block from being
    /// reclaimed while it is read.
    pub async fn get(&self, content: ContentRef) -> DedupeResult<Bytes> {
        {
            let bucket = self.bucket(&content.hash).lock().await;
            match bucket.get(&content.hash) {
                Some(entry) if entry.block == content.block && entry.refcount > 0 => {}
                _ => {
                    error!(hash = %content.hash, block = %content.block, "get of dead content reference");
                    return Err(DedupeError::NotFound { hash: content.hash });
                }
            }
        }

        let data = self
            .backing
            .read_at(self.offset_of(content.block), self.config.block_size as usize)
            .await?;
        if self.config.verify_on_read && blake3_hash(&data) != content.hash {
            error!(hash = %content.hash, block = %content.block, "stored content fails hash check");
            return Err(DedupeError::CorruptStore {
                hash: content.hash,
                reason: format!("content at {} does not match its hash", content.block),
            });
        }
        Ok(data)
    }

    /// Drop one reference. Returns true if the block left the index; its
    /// slot becomes reusable once the next checkpoint commits.
    pub async fn release(&self, content: ContentRef) -> DedupeResult<bool> {
        let mut bucket = self.bucket(&content.hash).lock().await;
        let entry = match bucket.get_mut(&content.hash) {
            Some(entry) if entry.block == content.block => entry,
            _ => {
                error!(hash = %content.hash, "release of dead content reference");
                return Err(DedupeError::NotFound { hash: content.hash });
            }
        };

        entry.refcount -= 1;
        self.counters.lock().total_refs -= 1;
        if entry.refcount > 0 {
            debug!(hash = %content.hash.short(), refcount = entry.refcount, "reference released");
            return Ok(false);
        }

        bucket.remove(&content.hash);
        self.pending.lock().push(content.block);
        {
            let mut counters = self.counters.lock();
            counters.unique_blocks -= 1;
            counters.reclaimed += 1;
        }
        debug!(hash = %content.hash.short(), block = %content.block, "content block reclaimed");
        Ok(true)
    }

    /// Current reference count of a hash (0 if not present).
    pub async fn refcount(&self, hash: &ContentHash) -> u64 {
        self.bucket(hash)
            .lock()
            .await
            .get(hash)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    /// True if a live block with this hash exists.
    pub async fn contains(&self, hash: &ContentHash) -> bool {
        self.bucket(hash).lock().await.contains_key(hash)
    }

    /// Number of live content blocks.
    pub fn len(&self) -> u64 {
        self.counters.lock().unique_blocks
    }

    /// True if no content is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live block's hash and reference count, sorted by hash.
    pub async fn snapshot(&self) -> Vec<(ContentHash, u64)> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().await;
            out.extend(bucket.iter().map(|(h, e)| (*h, e.refcount)));
        }
        out.sort();
        out
    }

    /// Block map of volume `name`, created empty if the store has none.
    pub fn volume(&self, name: &str) -> Arc<BlockMap> {
        Arc::clone(
            self.volumes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(BlockMap::new()))
                .value(),
        )
    }

    /// True if the store holds a block map for volume `name`.
    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
    }

    /// Names of every volume, sorted.
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.iter().map(|v| v.key().clone()).collect();
        names.sort();
        names
    }

    /// Forget volume `name` and release every reference its map holds.
    /// Returns how many references were released; the first release error
    /// is returned after the rest have been attempted.
    pub async fn drop_volume(&self, name: &str) -> DedupeResult<usize> {
        let Some((_, map)) = self.volumes.remove(name) else {
            return Ok(0);
        };
        let mut released = 0;
        let mut first_err = None;
        for (lba, content) in map.drain() {
            match self.release(content).await {
                Ok(_) => released += 1,
                Err(e) => {
                    error!(volume = name, lba = %lba, error = %e, "release while dropping volume failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        debug!(volume = name, released, "volume dropped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    fn volume_records(&self) -> Vec<VolumeRecord> {
        let maps: Vec<(String, Arc<BlockMap>)> = self
            .volumes
            .iter()
            .map(|v| (v.key().clone(), Arc::clone(v.value())))
            .collect();
        let mut records: Vec<VolumeRecord> = maps
            .into_iter()
            .map(|(name, map)| VolumeRecord {
                name,
                blocks: map.refs(),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Persist every volume map. Once this returns, every mapping installed
    /// before the call survives a reopen of the backing provider. Slots
    /// reclaimed before the call and the previous checkpoint's slots are
    /// freed. Returns the committed generation.
    pub async fn checkpoint(&self) -> DedupeResult<u64> {
        let mut state = self.commit.lock().await;
        let reclaimed = std::mem::take(&mut *self.pending.lock());
        let checkpoint = Checkpoint {
            generation: state.generation + 1,
            volumes: self.volume_records(),
        };

        let chain = match self.write_checkpoint(state.next_slot, &checkpoint).await {
            Ok(chain) => chain,
            Err(e) => {
                self.pending.lock().extend(reclaimed);
                warn!(generation = checkpoint.generation, error = %e, "checkpoint failed");
                return Err(e);
            }
        };

        let chain_len = chain.len() as u64;
        let stale = std::mem::replace(&mut state.chain, chain);
        state.generation = checkpoint.generation;
        state.next_slot = (state.next_slot + 1) % HEADER_SLOTS;
        {
            let mut counters = self.counters.lock();
            counters.generation = checkpoint.generation;
            counters.checkpoint_blocks = chain_len;
        }
        let freed = stale.len() + reclaimed.len();
        for block in stale.into_iter().chain(reclaimed) {
            self.free_slot(block).await;
        }
        debug!(
            generation = checkpoint.generation,
            volumes = checkpoint.volumes.len(),
            references = checkpoint.references(),
            chain = chain_len,
            freed,
            "checkpoint committed"
        );
        Ok(checkpoint.generation)
    }

    async fn write_checkpoint(
        &self,
        slot: usize,
        checkpoint: &Checkpoint,
    ) -> DedupeResult<Vec<PhysicalBlock>> {
        let block_size = self.config.block_size;
        let payload = checkpoint.to_bytes().map_err(|e| DedupeError::InvalidMetadata {
            provider: self.backing.name().to_string(),
            reason: format!("encoding checkpoint: {}", e),
        })?;

        let mut chain = Vec::new();
        for _ in 0..checkpoint::chain_len(payload.len(), block_size) {
            match self.allocator.allocate() {
                Ok(block) => chain.push(block),
                Err(e) => {
                    self.free_unused(&chain);
                    return Err(e);
                }
            }
        }
        let staged: DedupeResult<()> = async {
            checkpoint::write_chain(self.backing.as_ref(), &chain, &payload, block_size).await?;
            self.backing.flush().await
        }
        .await;
        if let Err(e) = staged {
            self.free_unused(&chain);
            return Err(e);
        }

        let header = CheckpointHeader {
            generation: checkpoint.generation,
            block_size,
            head: chain[0],
            chain_len: chain.len() as u64,
            payload_len: payload.len() as u64,
            payload_hash: blake3_hash(&payload),
        };
        let committed: DedupeResult<()> = async {
            checkpoint::write_header(self.backing.as_ref(), slot, &header).await?;
            self.backing.flush().await
        }
        .await;
        if let Err(e) = committed {
            // The header may have reached the media, so its chain stays allocated.
            warn!(generation = header.generation, slots = chain.len(), "checkpoint chain left allocated");
            return Err(e);
        }
        Ok(chain)
    }

    fn free_unused(&self, chain: &[PhysicalBlock]) {
        for block in chain {
            if let Err(e) = self.allocator.free(*block) {
                error!(block = %block, error = %e, "freeing unused checkpoint slot");
            }
        }
    }

    async fn free_slot(&self, block: PhysicalBlock) {
        if self.config.discard_on_release {
            let offset = self.offset_of(block);
            if let Err(e) = self
                .backing
                .delete(offset, self.config.block_size as u64)
                .await
            {
                warn!(block = %block, error = %e, "discard of reclaimed block failed");
            }
        }
        if let Err(e) = self.allocator.free(block) {
            error!(block = %block, error = %e, "freeing reclaimed slot");
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> StoreStats {
        let counters = self.counters.lock();
        let bs = self.config.block_size as u64;
        StoreStats {
            unique_blocks: counters.unique_blocks,
            total_refs: counters.total_refs,
            puts: counters.puts,
            dedupe_hits: counters.dedupe_hits,
            reclaimed: counters.reclaimed,
            pending_blocks: self.pending.lock().len() as u64,
            checkpoint_blocks: counters.checkpoint_blocks,
            generation: counters.generation,
            physical_bytes: counters.unique_blocks * bs,
            logical_bytes: counters.total_refs * bs,
            allocator: self.allocator.stats(),
        }
    }
}
