//! Block I/O requests and their lifecycle.

use core::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Type of I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BioCmd {
    /// Read a byte range
    Read,
    /// Write a byte range
    Write,
    /// Delete (trim) a byte range
    Delete,
    /// Barrier: make acknowledged writes durable
    Flush,
}

impl fmt::Display for BioCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BioCmd::Read => write!(f, "READ"),
            BioCmd::Write => write!(f, "WRITE"),
            BioCmd::Delete => write!(f, "DELETE"),
            BioCmd::Flush => write!(f, "FLUSH"),
        }
    }
}

/// Where a request is in the pipeline.
///
/// `Received → Validated → DedupeLookup (writes) → Mapped → Completed`, or
/// `Failed` from any non-terminal state. Once `Mapped`, its effects are
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Accepted, not yet checked
    Received,
    /// Alignment and range checked
    Validated,
    /// Hashing and storing content (writes only)
    DedupeLookup,
    /// Block map updated / resolved
    Mapped,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl RequestState {
    /// True for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    fn can_advance_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Validated, DedupeLookup)
                | (Validated, Mapped)
                | (DedupeLookup, Mapped)
                | (Mapped, Completed)
                | (Validated, Completed)
        ) || (!self.is_terminal() && next == Failed)
    }
}

/// One I/O request against an exposed dedupe device.
#[derive(Debug, Clone)]
pub struct Bio {
    /// Operation
    pub cmd: BioCmd,
    /// Byte offset on the exposed device
    pub offset: u64,
    /// Byte length
    pub length: u64,
    /// Payload for writes
    pub data: Option<Bytes>,
    /// Pipeline state
    pub state: RequestState,
    /// Bytes transferred once completed
    pub completed: u64,
}

impl Bio {
    fn new(cmd: BioCmd, offset: u64, length: u64, data: Option<Bytes>) -> Self {
        Self {
            cmd,
            offset,
            length,
            data,
            state: RequestState::Received,
            completed: 0,
        }
    }

    /// A read of `length` bytes at `offset`.
    pub fn read(offset: u64, length: u64) -> Self {
        Self::new(BioCmd::Read, offset, length, None)
    }

    /// A write of `data` at `offset`.
    pub fn write(offset: u64, data: Bytes) -> Self {
        let length = data.len() as u64;
        Self::new(BioCmd::Write, offset, length, Some(data))
    }

    /// A delete of `length` bytes at `offset`.
    pub fn delete(offset: u64, length: u64) -> Self {
        Self::new(BioCmd::Delete, offset, length, None)
    }

    /// A flush barrier.
    pub fn flush() -> Self {
        Self::new(BioCmd::Flush, 0, 0, None)
    }

    /// Move to `next`. Invalid transitions are ignored in release builds.
    pub fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid bio transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(cmd = %self.cmd, offset = self.offset, from = ?self.state, to = ?next, "bio state");
        self.state = next;
    }
}

/// Result of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BioCompletion {
    /// Operation that completed
    pub cmd: BioCmd,
    /// Byte offset of the request
    pub offset: u64,
    /// Bytes transferred (0 for flush)
    pub completed: u64,
    /// Read payload
    pub data: Option<Bytes>,
}

impl BioCompletion {
    /// Completion record for `bio`, carrying `data` for reads.
    pub fn of(bio: &Bio, data: Option<Bytes>) -> Self {
        Self {
            cmd: bio.cmd,
            offset: bio.offset,
            completed: bio.completed,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let bio = Bio::write(4096, Bytes::from(vec![1; 512]));
        assert_eq!(bio.cmd, BioCmd::Write);
        assert_eq!(bio.length, 512);
        assert_eq!(bio.state, RequestState::Received);

        let bio = Bio::flush();
        assert_eq!(bio.cmd, BioCmd::Flush);
        assert_eq!(bio.length, 0);
    }

    #[test]
    fn test_write_path_transitions() {
        let mut bio = Bio::write(0, Bytes::from(vec![0; 512]));
        bio.advance(RequestState::Validated);
        bio.advance(RequestState::DedupeLookup);
        bio.advance(RequestState::Mapped);
        bio.advance(RequestState::Completed);
        assert!(bio.state.is_terminal());
    }

    #[test]
    fn test_transition_rules() {
        use RequestState::*;
        assert!(Received.can_advance_to(Validated));
        assert!(Received.can_advance_to(Failed));
        assert!(Mapped.can_advance_to(Failed));
        assert!(!Received.can_advance_to(Mapped));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Completed));
    }

    #[test]
    fn test_completion_of() {
        let mut bio = Bio::read(512, 1024);
        bio.completed = 1024;
        let done = BioCompletion::of(&bio, Some(Bytes::from(vec![0; 1024])));
        assert_eq!(done.cmd, BioCmd::Read);
        assert_eq!(done.offset, 512);
        assert_eq!(done.completed, 1024);
        assert_eq!(done.data.map(|d| d.len()), Some(1024));
    }

    #[test]
    fn test_cmd_display() {
        assert_eq!(format!("{}", BioCmd::Read), "READ");
        assert_eq!(format!("{}", BioCmd::Delete), "DELETE");
    }
}
