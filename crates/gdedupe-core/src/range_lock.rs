//! Striped LBA lock: the mutual-exclusion region of one device.
//!
//! Each LBA maps to one of a fixed number of stripes (`lba % stripes`). A
//! request locks every stripe it touches, always in ascending stripe order,
//! so two requests can never wait on each other in a cycle. Writers take the
//! stripes exclusively for the whole resolve → put → update → release
//! sequence; readers share them for resolve → get.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::block::Lba;

/// Fixed set of per-stripe async read/write locks.
#[derive(Debug)]
pub struct RangeLock {
    stripes: Vec<RwLock<()>>,
}

/// Shared hold on a set of stripes.
pub struct ReadHold<'a> {
    _guards: Vec<RwLockReadGuard<'a, ()>>,
}

/// Exclusive hold on a set of stripes.
pub struct WriteHold<'a> {
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
}

impl RangeLock {
    /// Create a lock with `stripes` stripes (at least one).
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Number of stripes.
    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    /// Sorted, de-duplicated stripe indices covering `lbas`.
    fn indices(&self, lbas: impl IntoIterator<Item = Lba>) -> Vec<usize> {
        let n = self.stripes.len() as u64;
        let mut idx: Vec<usize> = lbas.into_iter().map(|l| (l.0 % n) as usize).collect();
        idx.sort_unstable();
        idx.dedup();
        idx
    }

    /// Lock the stripes of `lbas` for reading.
    pub async fn read(&self, lbas: impl IntoIterator<Item = Lba>) -> ReadHold<'_> {
        let mut guards = Vec::new();
        for i in self.indices(lbas) {
            guards.push(self.stripes[i].read().await);
        }
        ReadHold { _guards: guards }
    }

    /// Lock the stripes of `lbas` for writing.
    pub async fn write(&self, lbas: impl IntoIterator<Item = Lba>) -> WriteHold<'_> {
        let mut guards = Vec::new();
        for i in self.indices(lbas) {
            guards.push(self.stripes[i].write().await);
        }
        WriteHold { _guards: guards }
    }

    /// Lock every stripe for writing (quiesces the device).
    pub async fn write_all(&self) -> WriteHold<'_> {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in &self.stripes {
            guards.push(stripe.write().await);
        }
        WriteHold { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_indices_sorted_and_unique() {
        let lock = RangeLock::new(4);
        let idx = lock.indices([Lba(7), Lba(3), Lba(4), Lba(8), Lba(11)]);
        assert_eq!(idx, vec![0, 3]);
    }

    #[test]
    fn test_zero_stripes_clamped() {
        assert_eq!(RangeLock::new(0).stripes(), 1);
    }

    #[tokio::test]
    async fn test_readers_share() {
        let lock = RangeLock::new(8);
        let _a = lock.read([Lba(1)]).await;
        let b = tokio::time::timeout(Duration::from_millis(50), lock.read([Lba(1)])).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_writer_excludes_same_stripe() {
        let lock = RangeLock::new(8);
        let _w = lock.write([Lba(2)]).await;
        let r = tokio::time::timeout(Duration::from_millis(50), lock.read([Lba(10)])).await;
        assert!(r.is_err(), "lba 10 shares stripe 2");
        let other = tokio::time::timeout(Duration::from_millis(50), lock.write([Lba(3)])).await;
        assert!(other.is_ok(), "disjoint stripes proceed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_writers_do_not_deadlock() {
        let lock = Arc::new(RangeLock::new(4));
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let lock = Arc::clone(&lock);
            handles.push(tokio::spawn(async move {
                let lbas: Vec<Lba> = if i % 2 == 0 {
                    vec![Lba(0), Lba(1), Lba(2)]
                } else {
                    vec![Lba(2), Lba(1), Lba(0)]
                };
                let _hold = lock.write(lbas).await;
                tokio::task::yield_now().await;
            }));
        }
        let all = async {
            for h in handles {
                h.await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), all).await.unwrap();
    }
}
