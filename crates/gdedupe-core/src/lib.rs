#![warn(missing_docs)]

//! gdedupe core: in-line block deduplication between a consumer and a block provider
//!
//! Write path: Bio → Validate → Split into blocks → Fingerprint (BLAKE3) → Content store put → Block map update → Release old
//! Read path:  Bio → Validate → Block map resolve → Content store get (unmapped blocks read as zeros)
//! Flush path: Bio → Checkpoint every block map to the store backing → Flush consumer → Mark clean

pub mod allocator;
pub mod bio;
pub mod block;
pub mod block_map;
pub mod checkpoint;
pub mod config;
pub mod content_store;
pub mod debug;
pub mod device;
pub mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod metadata;
pub mod pipeline;
pub mod provider;
pub mod range_lock;
pub mod stats;

pub use allocator::{AllocatorConfig, AllocatorStats, BlockAllocator};
pub use bio::{Bio, BioCmd, BioCompletion, RequestState};
pub use block::{BlockGeometry, BlockSpan, Lba, PhysicalBlock, DEFAULT_BLOCK_SIZE};
pub use block_map::{BlockMap, MapEntry};
pub use checkpoint::{Checkpoint, CheckpointHeader, VolumeRecord};
pub use config::{DedupeConfig, DeviceOptions};
pub use content_store::{ContentRef, ContentStore, ContentStoreConfig, StoreStats};
pub use debug::DebugLevel;
pub use device::{provider_name, DedupeDevice, DeviceInfo, PROVIDER_PREFIX};
pub use error::{DedupeError, DedupeResult, ErrorKind};
pub use fingerprint::{blake3_hash, ContentHash};
pub use lifecycle::{ClassOps, CtlError, CtlRequest, DedupeClass, CLASS_NAME};
pub use metadata::{Label, LABEL_MAGIC, LABEL_SIZE, LABEL_VERSION};
pub use pipeline::DeviceIo;
pub use provider::{AccessCounts, FileProvider, IoFaults, MemProvider, Provider, ProviderRegistry, ProviderStats};
pub use range_lock::RangeLock;
pub use stats::DeviceStats;
