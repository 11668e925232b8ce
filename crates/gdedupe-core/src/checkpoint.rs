//! Store checkpoints: the persisted block maps of every volume in a store.
//!
//! The two sectors in front of the store backing's label sector hold
//! checkpoint headers. A commit writes the encoded payload into content slots
//! chained through an eight-byte next pointer at the start of each slot,
//! flushes, then writes its header over the older of the two headers and
//! flushes again. On load the valid header with the highest generation wins.
//!
//! Header layout, little-endian:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 16 | magic `"GDEDUPE::CKPT"`, NUL-padded |
//! | 16 | 4 | version |
//! | 20 | 4 | block size |
//! | 24 | 8 | generation |
//! | 32 | 8 | first chain slot |
//! | 40 | 8 | chain length in slots |
//! | 48 | 8 | payload length |
//! | 56 | 32 | BLAKE3 of the payload |
//! | 88 | 8 | first 8 bytes of BLAKE3 over bytes 0..88 |

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::{Lba, PhysicalBlock};
use crate::content_store::ContentRef;
use crate::error::{DedupeError, DedupeResult};
use crate::fingerprint::{blake3_hash, ContentHash};
use crate::metadata::{label_offset, le_array, nul_terminated};
use crate::provider::Provider;

/// Header magic, NUL-padded to 16 bytes on disk.
pub const CHECKPOINT_MAGIC: &str = "GDEDUPE::CKPT";
/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;
/// Encoded header length in bytes.
pub const HEADER_SIZE: usize = 96;
/// Number of alternating header sectors.
pub const HEADER_SLOTS: usize = 2;

const NO_NEXT: u64 = u64::MAX;
const NEXT_LEN: usize = 8;
const SUM_OFF: usize = 88;

/// Persisted block map of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Device name the map belongs to
    pub name: String,
    /// Every mapping, in LBA order
    pub blocks: Vec<(Lba, ContentRef)>,
}

/// Checkpoint payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Commit generation, matching the header
    pub generation: u64,
    /// Block maps of attached and detached volumes, sorted by name
    pub volumes: Vec<VolumeRecord>,
}

impl Checkpoint {
    /// Serialize to bincode bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Total number of mappings across all volumes.
    pub fn references(&self) -> usize {
        self.volumes.iter().map(|v| v.blocks.len()).sum()
    }
}

/// Decoded checkpoint header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Commit generation
    pub generation: u64,
    /// Content block size the store was written with
    pub block_size: u32,
    /// First slot of the payload chain
    pub head: PhysicalBlock,
    /// Number of slots in the chain
    pub chain_len: u64,
    /// Payload length in bytes
    pub payload_len: u64,
    /// Hash of the payload
    pub payload_hash: ContentHash,
}

impl CheckpointHeader {
    /// Encode into a zero-padded sector.
    pub fn encode(&self, sector_size: u32) -> Bytes {
        let mut buf = vec![0u8; (sector_size as usize).max(HEADER_SIZE)];
        buf[..CHECKPOINT_MAGIC.len()].copy_from_slice(CHECKPOINT_MAGIC.as_bytes());
        buf[16..20].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf[20..24].copy_from_slice(&self.block_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.generation.to_le_bytes());
        buf[32..40].copy_from_slice(&self.head.0.to_le_bytes());
        buf[40..48].copy_from_slice(&self.chain_len.to_le_bytes());
        buf[48..56].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[56..88].copy_from_slice(self.payload_hash.as_bytes());
        let sum = blake3_hash(&buf[..SUM_OFF]);
        buf[SUM_OFF..HEADER_SIZE].copy_from_slice(&sum.as_bytes()[..8]);
        Bytes::from(buf)
    }

    /// Decode a header sector. `None` means no checkpoint was ever written
    /// there; a damaged header is `InvalidMetadata`.
    pub fn decode(provider: &str, data: &[u8]) -> DedupeResult<Option<Self>> {
        let invalid = |reason: String| DedupeError::InvalidMetadata {
            provider: provider.to_string(),
            reason,
        };
        if data.len() < HEADER_SIZE {
            return Err(invalid(format!(
                "checkpoint header too short: {} bytes",
                data.len()
            )));
        }
        if nul_terminated(&data[..16]) != Some(CHECKPOINT_MAGIC.as_bytes()) {
            return Ok(None);
        }
        let sum = blake3_hash(&data[..SUM_OFF]);
        if sum.as_bytes()[..8] != data[SUM_OFF..HEADER_SIZE] {
            return Err(invalid("checkpoint header checksum mismatch".to_string()));
        }
        let version = u32::from_le_bytes(le_array(&data[16..20]));
        if version != CHECKPOINT_VERSION {
            return Err(DedupeError::VersionMismatch {
                provider: provider.to_string(),
                expected: CHECKPOINT_VERSION,
                found: version,
            });
        }
        Ok(Some(Self {
            block_size: u32::from_le_bytes(le_array(&data[20..24])),
            generation: u64::from_le_bytes(le_array(&data[24..32])),
            head: PhysicalBlock(u64::from_le_bytes(le_array(&data[32..40]))),
            chain_len: u64::from_le_bytes(le_array(&data[40..48])),
            payload_len: u64::from_le_bytes(le_array(&data[48..56])),
            payload_hash: ContentHash(le_array(&data[56..88])),
        }))
    }
}

/// Byte offset of header sector `slot` on the store backing.
pub fn header_offset(backing: &dyn Provider, slot: usize) -> DedupeResult<u64> {
    let sector = backing.sector_size() as u64;
    let label = label_offset(backing)?;
    label
        .checked_sub((HEADER_SLOTS - slot) as u64 * sector)
        .ok_or_else(|| {
            DedupeError::invalid(format!(
                "{}: media size {} too small for checkpoint headers",
                backing.name(),
                backing.media_size()
            ))
        })
}

/// Slots needed to hold `payload_len` bytes.
pub fn chain_len(payload_len: usize, block_size: u32) -> usize {
    let room = block_size as usize - NEXT_LEN;
    payload_len.div_ceil(room).max(1)
}

/// Write `payload` across `chain`, one slot per chunk.
pub async fn write_chain(
    backing: &dyn Provider,
    chain: &[PhysicalBlock],
    payload: &[u8],
    block_size: u32,
) -> DedupeResult<()> {
    let room = block_size as usize - NEXT_LEN;
    let mut chunks = payload.chunks(room);
    for (i, slot) in chain.iter().enumerate() {
        let next = chain.get(i + 1).map_or(NO_NEXT, |b| b.0);
        let mut block = BytesMut::zeroed(block_size as usize);
        block[..NEXT_LEN].copy_from_slice(&next.to_le_bytes());
        if let Some(chunk) = chunks.next() {
            block[NEXT_LEN..NEXT_LEN + chunk.len()].copy_from_slice(chunk);
        }
        backing
            .write_at(slot.byte_offset(block_size), block.freeze())
            .await?;
    }
    Ok(())
}

/// Write `header` into header sector `slot`.
pub async fn write_header(
    backing: &dyn Provider,
    slot: usize,
    header: &CheckpointHeader,
) -> DedupeResult<()> {
    let offset = header_offset(backing, slot)?;
    backing
        .write_at(offset, header.encode(backing.sector_size()))
        .await?;
    debug!(provider = %backing.name(), slot, generation = header.generation, "checkpoint header written");
    Ok(())
}

/// A checkpoint read back from the store backing.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    /// Header sector it was found in
    pub slot: usize,
    /// Its header
    pub header: CheckpointHeader,
    /// Slots holding the payload
    pub chain: Vec<PhysicalBlock>,
    /// The decoded payload
    pub checkpoint: Checkpoint,
}

async fn read_chain(
    backing: &dyn Provider,
    header: &CheckpointHeader,
    total_blocks: u64,
) -> DedupeResult<(Vec<PhysicalBlock>, Checkpoint)> {
    let invalid = |reason: String| DedupeError::InvalidMetadata {
        provider: backing.name().to_string(),
        reason,
    };
    let block_size = header.block_size;
    let room = block_size as usize - NEXT_LEN;
    if header.chain_len as usize != chain_len(header.payload_len as usize, block_size) {
        return Err(invalid(format!(
            "chain of {} slots cannot hold {} bytes",
            header.chain_len, header.payload_len
        )));
    }

    let mut payload = BytesMut::with_capacity(header.payload_len as usize);
    let mut chain = Vec::with_capacity(header.chain_len as usize);
    let mut slot = header.head.0;
    for _ in 0..header.chain_len {
        if slot >= total_blocks {
            return Err(invalid(format!("chain slot {} beyond {} slots", slot, total_blocks)));
        }
        let block = PhysicalBlock(slot);
        let data = backing
            .read_at(block.byte_offset(block_size), block_size as usize)
            .await?;
        let take = room.min(header.payload_len as usize - payload.len());
        payload.extend_from_slice(&data[NEXT_LEN..NEXT_LEN + take]);
        chain.push(block);
        slot = u64::from_le_bytes(le_array(&data[..NEXT_LEN]));
    }
    if slot != NO_NEXT {
        return Err(invalid("checkpoint chain does not end".to_string()));
    }
    if blake3_hash(&payload) != header.payload_hash {
        return Err(invalid("checkpoint payload checksum mismatch".to_string()));
    }
    let checkpoint = Checkpoint::from_bytes(&payload)
        .map_err(|e| invalid(format!("decoding checkpoint: {}", e)))?;
    if checkpoint.generation != header.generation {
        return Err(invalid(format!(
            "payload generation {} under header generation {}",
            checkpoint.generation, header.generation
        )));
    }
    Ok((chain, checkpoint))
}

/// Find and read the newest intact checkpoint. A damaged newer checkpoint
/// falls back to the older one.
pub async fn load(
    backing: &dyn Provider,
    block_size: u32,
    total_blocks: u64,
) -> DedupeResult<Option<LoadedCheckpoint>> {
    let mut found = Vec::new();
    for slot in 0..HEADER_SLOTS {
        let offset = header_offset(backing, slot)?;
        let data = backing
            .read_at(offset, backing.sector_size() as usize)
            .await?;
        match CheckpointHeader::decode(backing.name(), &data) {
            Ok(Some(header)) => found.push((slot, header)),
            Ok(None) => {}
            Err(DedupeError::InvalidMetadata { reason, .. }) => {
                warn!(provider = %backing.name(), slot, %reason, "skipping damaged checkpoint header");
            }
            Err(e) => return Err(e),
        }
    }
    found.sort_by_key(|(_, h)| std::cmp::Reverse(h.generation));

    for (slot, header) in found {
        if header.block_size != block_size {
            return Err(DedupeError::InvalidMetadata {
                provider: backing.name().to_string(),
                reason: format!(
                    "store written with block size {}, configured {}",
                    header.block_size, block_size
                ),
            });
        }
        match read_chain(backing, &header, total_blocks).await {
            Ok((chain, checkpoint)) => {
                debug!(
                    provider = %backing.name(),
                    slot,
                    generation = header.generation,
                    volumes = checkpoint.volumes.len(),
                    "checkpoint loaded"
                );
                return Ok(Some(LoadedCheckpoint {
                    slot,
                    header,
                    chain,
                    checkpoint,
                }));
            }
            Err(DedupeError::InvalidMetadata { reason, .. }) => {
                warn!(provider = %backing.name(), slot, generation = header.generation, %reason, "checkpoint unreadable, trying older");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemProvider;

    const BS: u32 = 4096;

    fn header(generation: u64) -> CheckpointHeader {
        CheckpointHeader {
            generation,
            block_size: BS,
            head: PhysicalBlock(3),
            chain_len: 1,
            payload_len: 12,
            payload_hash: blake3_hash(b"payload"),
        }
    }

    fn sample(generation: u64, volumes: usize, blocks: u64) -> Checkpoint {
        Checkpoint {
            generation,
            volumes: (0..volumes)
                .map(|v| VolumeRecord {
                    name: format!("dd{}", v),
                    blocks: (0..blocks)
                        .map(|l| {
                            (
                                Lba(l),
                                ContentRef {
                                    hash: blake3_hash(&l.to_le_bytes()),
                                    block: PhysicalBlock(100 + l),
                                },
                            )
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    async fn commit(backing: &MemProvider, slot: usize, chain: &[PhysicalBlock], cp: &Checkpoint) {
        let payload = cp.to_bytes().unwrap();
        write_chain(backing, chain, &payload, BS).await.unwrap();
        let header = CheckpointHeader {
            generation: cp.generation,
            block_size: BS,
            head: chain[0],
            chain_len: chain.len() as u64,
            payload_len: payload.len() as u64,
            payload_hash: blake3_hash(&payload),
        };
        write_header(backing, slot, &header).await.unwrap();
    }

    #[test]
    fn test_header_layout() {
        let data = header(7).encode(512);
        assert_eq!(data.len(), 512);
        assert_eq!(&data[..13], b"GDEDUPE::CKPT");
        assert_eq!(&data[16..20], &1u32.to_le_bytes());
        assert_eq!(&data[24..32], &7u64.to_le_bytes());
        assert!(data[HEADER_SIZE..].iter().all(|b| *b == 0));
        assert_eq!(CheckpointHeader::decode("pool0", &data).unwrap(), Some(header(7)));
    }

    #[test]
    fn test_blank_sector_has_no_header() {
        assert_eq!(CheckpointHeader::decode("pool0", &[0u8; 512]).unwrap(), None);
    }

    #[test]
    fn test_torn_header_is_invalid() {
        let mut data = header(7).encode(512).to_vec();
        data[30] ^= 0xFF;
        assert!(matches!(
            CheckpointHeader::decode("pool0", &data),
            Err(DedupeError::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn test_chain_len() {
        assert_eq!(chain_len(0, BS), 1);
        assert_eq!(chain_len(4088, BS), 1);
        assert_eq!(chain_len(4089, BS), 2);
    }

    #[test]
    fn test_header_offsets_precede_label() {
        let backing = MemProvider::new("pool0", 512, 1 << 20);
        assert_eq!(header_offset(&backing, 0).unwrap(), (1 << 20) - 3 * 512);
        assert_eq!(header_offset(&backing, 1).unwrap(), (1 << 20) - 2 * 512);
        let tiny = MemProvider::new("tiny", 512, 1024);
        assert!(header_offset(&tiny, 0).is_err());
    }

    #[tokio::test]
    async fn test_load_empty_backing() {
        let backing = MemProvider::new("pool0", 512, 1 << 20);
        assert!(load(&backing, BS, 200).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multi_slot_chain_loads() {
        let backing = MemProvider::new("pool0", 512, 1 << 20);
        let cp = sample(4, 3, 200);
        let payload_len = cp.to_bytes().unwrap().len();
        let chain: Vec<_> = (0..chain_len(payload_len, BS) as u64)
            .map(|i| PhysicalBlock(10 + 2 * i))
            .collect();
        assert!(chain.len() > 1);
        commit(&backing, 1, &chain, &cp).await;

        let loaded = load(&backing, BS, 200).await.unwrap().unwrap();
        assert_eq!(loaded.slot, 1);
        assert_eq!(loaded.chain, chain);
        assert_eq!(loaded.checkpoint, cp);
        assert_eq!(loaded.checkpoint.references(), 600);
    }

    #[tokio::test]
    async fn test_newest_generation_wins_and_damage_falls_back() {
        let backing = MemProvider::new("pool0", 512, 1 << 20);
        let older = sample(1, 1, 2);
        let newer = sample(2, 2, 2);
        commit(&backing, 0, &[PhysicalBlock(0)], &older).await;
        commit(&backing, 1, &[PhysicalBlock(1)], &newer).await;
        assert_eq!(load(&backing, BS, 200).await.unwrap().unwrap().checkpoint, newer);

        // Scribble over the newer payload: the older checkpoint still loads.
        backing
            .write_at(PhysicalBlock(1).byte_offset(BS) + 16, Bytes::from(vec![0xEE; 64]))
            .await
            .unwrap();
        let loaded = load(&backing, BS, 200).await.unwrap().unwrap();
        assert_eq!(loaded.slot, 0);
        assert_eq!(loaded.checkpoint, older);
    }

    #[tokio::test]
    async fn test_block_size_mismatch_is_rejected() {
        let backing = MemProvider::new("pool0", 512, 1 << 20);
        commit(&backing, 0, &[PhysicalBlock(0)], &sample(1, 1, 1)).await;
        assert!(matches!(
            load(&backing, 8192, 100).await,
            Err(DedupeError::InvalidMetadata { .. })
        ));
    }
}
