//! Device label: identification and version compatibility.
//!
//! The label lives in the last sector of the underlying provider and is laid
//! out little-endian:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 16 | magic `"GEOM::DEDUPE"`, NUL-padded |
//! | 16 | 4 | version |
//! | 20 | 16 | device name, NUL-padded |
//! | 36 | 8 | provider size at creation |
//!
//! The rest of the sector is zero.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DedupeError, DedupeResult};
use crate::provider::Provider;

/// Label magic, NUL-padded to 16 bytes on disk.
pub const LABEL_MAGIC: &str = "GEOM::DEDUPE";
/// Current label version.
pub const LABEL_VERSION: u32 = 1;
/// Encoded label length in bytes.
pub const LABEL_SIZE: usize = 44;
/// Longest device name that fits the name field with its terminator.
pub const MAX_NAME_LEN: usize = 15;

const MAGIC_OFF: usize = 0;
const VERSION_OFF: usize = 16;
const NAME_OFF: usize = 20;
const PROVSIZE_OFF: usize = 36;
const FIELD_LEN: usize = 16;

/// Decoded device label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label format version
    pub version: u32,
    /// Device name (without the `dedupe/` prefix)
    pub name: String,
    /// Underlying provider size when the device was created
    pub provider_size: u64,
}

impl Label {
    /// Label for a new device.
    pub fn new(name: &str, provider_size: u64) -> DedupeResult<Self> {
        validate_name(name)?;
        Ok(Self {
            version: LABEL_VERSION,
            name: name.to_string(),
            provider_size,
        })
    }

    /// Encode into a zero-padded sector.
    pub fn encode(&self, sector_size: u32) -> DedupeResult<Bytes> {
        validate_name(&self.name)?;
        if (sector_size as usize) < LABEL_SIZE {
            return Err(DedupeError::invalid(format!(
                "sector size {} cannot hold a {} byte label",
                sector_size, LABEL_SIZE
            )));
        }
        let mut buf = vec![0u8; sector_size as usize];
        buf[MAGIC_OFF..MAGIC_OFF + LABEL_MAGIC.len()].copy_from_slice(LABEL_MAGIC.as_bytes());
        buf[VERSION_OFF..VERSION_OFF + 4].copy_from_slice(&self.version.to_le_bytes());
        buf[NAME_OFF..NAME_OFF + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[PROVSIZE_OFF..PROVSIZE_OFF + 8].copy_from_slice(&self.provider_size.to_le_bytes());
        Ok(Bytes::from(buf))
    }

    /// Decode and validate a label read from `provider`.
    pub fn decode(provider: &str, data: &[u8]) -> DedupeResult<Self> {
        let invalid = |reason: String| DedupeError::InvalidMetadata {
            provider: provider.to_string(),
            reason,
        };
        if data.len() < LABEL_SIZE {
            return Err(invalid(format!("label too short: {} bytes", data.len())));
        }

        let magic = nul_terminated(&data[MAGIC_OFF..MAGIC_OFF + FIELD_LEN]);
        if magic != Some(LABEL_MAGIC.as_bytes()) {
            debug!(provider, "no dedupe magic");
            return Err(invalid("bad magic".to_string()));
        }

        let version = u32::from_le_bytes(le_array(&data[VERSION_OFF..VERSION_OFF + 4]));
        if version != LABEL_VERSION {
            debug!(provider, expected = LABEL_VERSION, actual = version, "unsupported label version");
            return Err(DedupeError::VersionMismatch {
                provider: provider.to_string(),
                expected: LABEL_VERSION,
                found: version,
            });
        }

        let name = nul_terminated(&data[NAME_OFF..NAME_OFF + FIELD_LEN])
            .ok_or_else(|| invalid("device name is not terminated".to_string()))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| invalid("device name is not ASCII".to_string()))?;
        validate_name(name).map_err(|e| invalid(e.to_string()))?;

        let provider_size = u64::from_le_bytes(le_array(&data[PROVSIZE_OFF..PROVSIZE_OFF + 8]));
        Ok(Self {
            version,
            name: name.to_string(),
            provider_size,
        })
    }
}

/// Check a device name fits the label and the provider namespace.
pub fn validate_name(name: &str) -> DedupeResult<()> {
    if name.is_empty() {
        return Err(DedupeError::invalid("empty device name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DedupeError::invalid(format!(
            "device name {:?} longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic() && b != b'/') {
        return Err(DedupeError::invalid(format!(
            "device name {:?} must be printable ASCII without '/'",
            name
        )));
    }
    Ok(())
}

pub(crate) fn nul_terminated(field: &[u8]) -> Option<&[u8]> {
    field.iter().position(|b| *b == 0).map(|end| &field[..end])
}

pub(crate) fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Byte offset of the label sector on `provider`.
pub fn label_offset(provider: &dyn Provider) -> DedupeResult<u64> {
    let sector = provider.sector_size() as u64;
    if provider.media_size() < sector {
        return Err(DedupeError::InvalidMetadata {
            provider: provider.name().to_string(),
            reason: format!("media size {} smaller than one sector", provider.media_size()),
        });
    }
    Ok(provider.media_size() / sector * sector - sector)
}

/// Read and validate the label in the last sector of `provider`.
pub async fn read_label(provider: &dyn Provider) -> DedupeResult<Label> {
    let offset = label_offset(provider)?;
    let data = provider
        .read_at(offset, provider.sector_size() as usize)
        .await?;
    Label::decode(provider.name(), &data)
}

/// Write `label` to the last sector of `provider`.
pub async fn write_label(provider: &dyn Provider, label: &Label) -> DedupeResult<()> {
    let offset = label_offset(provider)?;
    let data = label.encode(provider.sector_size())?;
    provider.write_at(offset, data).await?;
    debug!(provider = %provider.name(), name = %label.name, offset, "label written");
    Ok(())
}

/// Zero the label sector of `provider`.
pub async fn clear_label(provider: &dyn Provider) -> DedupeResult<()> {
    let offset = label_offset(provider)?;
    provider
        .write_at(offset, Bytes::from(vec![0u8; provider.sector_size() as usize]))
        .await
}
