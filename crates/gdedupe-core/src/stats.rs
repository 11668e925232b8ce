//! Per-device request counters.

use serde::{Deserialize, Serialize};

use crate::bio::BioCmd;

/// Counters of one dedupe device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Read requests completed
    pub reads: u64,
    /// Write requests completed
    pub writes: u64,
    /// Delete requests completed
    pub deletes: u64,
    /// Flush requests completed
    pub flushes: u64,
    /// Bytes returned by reads
    pub read_bytes: u64,
    /// Bytes accepted by writes
    pub wrote_bytes: u64,
    /// Written blocks that matched existing content
    pub dedupe_hits: u64,
    /// Requests that failed
    pub errors: u64,
    /// Requests failed by fault injection
    pub injected_failures: u64,
}

impl DeviceStats {
    /// Account one completed request.
    pub fn record(&mut self, cmd: BioCmd, bytes: u64) {
        match cmd {
            BioCmd::Read => {
                self.reads += 1;
                self.read_bytes += bytes;
            }
            BioCmd::Write => {
                self.writes += 1;
                self.wrote_bytes += bytes;
            }
            BioCmd::Delete => self.deletes += 1,
            BioCmd::Flush => self.flushes += 1,
        }
    }
}
