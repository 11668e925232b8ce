//! Core block types: logical addresses, physical slots and device geometry.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{DedupeError, DedupeResult};

/// Default dedupe block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Logical block address on an exposed dedupe device, in units of the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    /// Returns the byte offset of this block for the given block size.
    pub fn byte_offset(&self, block_size: u32) -> u64 {
        self.0 * block_size as u64
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lba:{}", self.0)
    }
}

/// A physical content block slot inside the content store's backing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalBlock(pub u64);

impl PhysicalBlock {
    /// Returns the byte offset of this slot for the given block size.
    pub fn byte_offset(&self, block_size: u32) -> u64 {
        self.0 * block_size as u64
    }
}

impl fmt::Display for PhysicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pblk:{}", self.0)
    }
}

/// Sector and dedupe block sizes of a device.
///
/// Invariant: both are powers of two and `block_size` is a multiple of `sector_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGeometry {
    /// Sector size in bytes (request alignment unit).
    pub sector_size: u32,
    /// Dedupe block size in bytes (hashing unit).
    pub block_size: u32,
}

impl BlockGeometry {
    /// Validates and builds a geometry.
    pub fn new(sector_size: u32, block_size: u32) -> DedupeResult<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(DedupeError::invalid(format!(
                "sector size {} is not a power of two",
                sector_size
            )));
        }
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(DedupeError::invalid(format!(
                "block size {} is not a power of two",
                block_size
            )));
        }
        if block_size % sector_size != 0 {
            return Err(DedupeError::invalid(format!(
                "block size {} is not a multiple of sector size {}",
                block_size, sector_size
            )));
        }
        Ok(Self {
            sector_size,
            block_size,
        })
    }

    /// True if `value` is a multiple of the sector size.
    pub fn is_sector_aligned(&self, value: u64) -> bool {
        value % self.sector_size as u64 == 0
    }

    /// Splits the byte range `[offset, offset + length)` into per-block pieces.
    pub fn split(&self, offset: u64, length: u64) -> Vec<BlockSpan> {
        let bs = self.block_size as u64;
        let mut spans = Vec::new();
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let lba = pos / bs;
            let within = pos % bs;
            let len = (bs - within).min(end - pos);
            spans.push(BlockSpan {
                lba: Lba(lba),
                within: within as u32,
                len: len as u32,
                buf_offset: (pos - offset) as usize,
            });
            pos += len;
        }
        spans
    }
}

/// The part of one logical block touched by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Block being touched.
    pub lba: Lba,
    /// Byte offset inside the block.
    pub within: u32,
    /// Number of bytes touched.
    pub len: u32,
    /// Byte offset of this span inside the request buffer.
    pub buf_offset: usize,
}

impl BlockSpan {
    /// True if the span covers the whole block.
    pub fn is_full(&self, block_size: u32) -> bool {
        self.within == 0 && self.len == block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offsets() {
        assert_eq!(Lba(100).byte_offset(4096), 100 * 4096);
        assert_eq!(PhysicalBlock(3).byte_offset(8192), 3 * 8192);
    }

    #[test]
    fn test_display_impls() {
        assert_eq!(format!("{}", Lba(7)), "lba:7");
        assert_eq!(format!("{}", PhysicalBlock(9)), "pblk:9");
    }

    #[test]
    fn test_geometry_validation() {
        assert!(BlockGeometry::new(512, 4096).is_ok());
        assert!(BlockGeometry::new(4096, 4096).is_ok());
        assert!(BlockGeometry::new(4096, 512).is_err());
        assert!(BlockGeometry::new(500, 4000).is_err());
        assert!(BlockGeometry::new(0, 4096).is_err());
    }

    #[test]
    fn test_split_aligned() {
        let g = BlockGeometry::new(512, 4096).unwrap();
        let spans = g.split(8192, 8192);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].lba, Lba(2));
        assert!(spans[0].is_full(4096));
        assert_eq!(spans[1].lba, Lba(3));
        assert_eq!(spans[1].buf_offset, 4096);
    }

    #[test]
    fn test_split_partial_edges() {
        let g = BlockGeometry::new(512, 4096).unwrap();
        let spans = g.split(3584, 1024);
        assert_eq!(spans.len(), 2);
        assert_eq!(
            spans[0],
            BlockSpan {
                lba: Lba(0),
                within: 3584,
                len: 512,
                buf_offset: 0
            }
        );
        assert_eq!(
            spans[1],
            BlockSpan {
                lba: Lba(1),
                within: 0,
                len: 512,
                buf_offset: 512
            }
        );
        assert!(!spans[0].is_full(4096));
    }

    #[test]
    fn test_split_empty() {
        let g = BlockGeometry::new(512, 4096).unwrap();
        assert!(g.split(4096, 0).is_empty());
    }
}
