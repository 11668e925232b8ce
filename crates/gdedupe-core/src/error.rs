//! Error types for the dedupe layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::ContentHash;

/// Result type alias for dedupe operations.
pub type DedupeResult<T> = Result<T, DedupeError>;

/// Error variants for dedupe operations.
#[derive(Debug, Error)]
pub enum DedupeError {
    /// The named provider is not registered.
    #[error("Provider not found: {name}")]
    ProviderNotFound {
        /// Provider name that was looked up.
        name: String,
    },

    /// A device or provider with this name already exists.
    #[error("Already exists: {name}")]
    AlreadyExists {
        /// The colliding name.
        name: String,
    },

    /// The consumer could not be bound to the provider.
    #[error("Attach to {provider} failed: {reason}")]
    AttachFailed {
        /// The provider we tried to attach to.
        provider: String,
        /// Description of the failure.
        reason: String,
    },

    /// The device is open and destruction was not forced.
    #[error("Busy: {name} ({reason})")]
    Busy {
        /// The busy device or provider.
        name: String,
        /// Description of the open state.
        reason: String,
    },

    /// The on-disk label is unreadable or malformed.
    #[error("Invalid metadata on {provider}: {reason}")]
    InvalidMetadata {
        /// Provider the label was read from.
        provider: String,
        /// Description of the problem.
        reason: String,
    },

    /// The on-disk label has an unsupported format version.
    #[error("Version mismatch on {provider}: expected {expected}, found {found}")]
    VersionMismatch {
        /// Provider the label was read from.
        provider: String,
        /// Version this build understands.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },

    /// Misaligned, out-of-range or otherwise malformed request.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Description of the problem.
        reason: String,
    },

    /// Underlying provider I/O failure.
    #[error("I/O error at offset {offset}: {source}")]
    IoError {
        /// Byte offset of the first failing block.
        offset: u64,
        /// The provider error.
        #[source]
        source: std::io::Error,
    },

    /// Stale content reference: the content block is no longer live.
    #[error("Content not found: {hash}")]
    NotFound {
        /// Hash of the missing content block.
        hash: ContentHash,
    },

    /// Stored bytes do not match their content hash.
    #[error("Corrupt store: {hash} ({reason})")]
    CorruptStore {
        /// Hash of the corrupt content block.
        hash: ContentHash,
        /// Description of the mismatch.
        reason: String,
    },

    /// No free physical blocks left in the content store.
    #[error("Out of space: no free content blocks available")]
    OutOfSpace,

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),
}

/// Stable, serializable error kind for the structured error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`DedupeError::ProviderNotFound`].
    ProviderNotFound,
    /// See [`DedupeError::AlreadyExists`].
    AlreadyExists,
    /// See [`DedupeError::AttachFailed`].
    AttachFailed,
    /// See [`DedupeError::Busy`].
    Busy,
    /// See [`DedupeError::InvalidMetadata`].
    InvalidMetadata,
    /// See [`DedupeError::VersionMismatch`].
    VersionMismatch,
    /// See [`DedupeError::InvalidRequest`].
    InvalidRequest,
    /// See [`DedupeError::IoError`].
    IoError,
    /// See [`DedupeError::NotFound`].
    NotFound,
    /// See [`DedupeError::CorruptStore`].
    CorruptStore,
    /// See [`DedupeError::OutOfSpace`].
    OutOfSpace,
    /// See [`DedupeError::Config`].
    Config,
}

impl DedupeError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DedupeError::ProviderNotFound { .. } => ErrorKind::ProviderNotFound,
            DedupeError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            DedupeError::AttachFailed { .. } => ErrorKind::AttachFailed,
            DedupeError::Busy { .. } => ErrorKind::Busy,
            DedupeError::InvalidMetadata { .. } => ErrorKind::InvalidMetadata,
            DedupeError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            DedupeError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            DedupeError::IoError { .. } => ErrorKind::IoError,
            DedupeError::NotFound { .. } => ErrorKind::NotFound,
            DedupeError::CorruptStore { .. } => ErrorKind::CorruptStore,
            DedupeError::OutOfSpace => ErrorKind::OutOfSpace,
            DedupeError::Config(_) => ErrorKind::Config,
        }
    }

    /// True for errors that indicate a bug in mapping or reference counting
    /// rather than a hardware or transport fault.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            DedupeError::NotFound { .. } | DedupeError::CorruptStore { .. }
        )
    }

    /// Shorthand for an [`DedupeError::InvalidRequest`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        DedupeError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Wraps a provider error at the given byte offset.
    pub fn io(offset: u64, source: std::io::Error) -> Self {
        DedupeError::IoError { offset, source }
    }

    /// Re-targets an I/O error to a different offset, leaving other kinds untouched.
    pub fn at_offset(self, offset: u64) -> Self {
        match self {
            DedupeError::IoError { source, .. } => DedupeError::IoError { offset, source },
            other => other,
        }
    }
}
