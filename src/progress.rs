use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use indicatif::{HumanBytes, HumanCount, ProgressBar};
use log::info;

use crate::error::{Error, Result};

/// Sizes of a running dump, readable from other threads.
#[derive(Debug, Default)]
pub struct DiskProgress {
    capacity: AtomicU64,
    processed: AtomicU64,
    estimate: AtomicU64,
    finished: AtomicU64,
}

impl DiskProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Bytes of the disk covered by block discovery so far.
    pub fn set_processed(&self, bytes: u64) {
        self.processed.store(bytes, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Bytes the copy is expected to transfer.
    pub fn set_estimate(&self, bytes: u64) {
        self.estimate.store(bytes, Ordering::Relaxed);
    }

    pub fn estimate(&self) -> u64 {
        self.estimate.load(Ordering::Relaxed)
    }

    pub fn add_finished(&self, bytes: u64) {
        self.finished.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Cooperative cancellation, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Operation and byte counters for one copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
}

impl TransferStats {
    pub fn record_read(&mut self, bytes: usize) {
        self.read_ops += 1;
        self.read_bytes += bytes as u64;
    }

    pub fn record_write(&mut self, bytes: usize) {
        self.write_ops += 1;
        self.write_bytes += bytes as u64;
    }

    pub fn log(&self) {
        if self.read_ops > 0 {
            info!(
                "Read {} in {} operations ({} per operation)",
                HumanBytes(self.read_bytes),
                HumanCount(self.read_ops),
                HumanBytes(self.read_bytes / self.read_ops)
            );
        }
        if self.write_ops > 0 {
            info!(
                "Wrote {} in {} operations ({} per operation)",
                HumanBytes(self.write_bytes),
                HumanCount(self.write_ops),
                HumanBytes(self.write_bytes / self.write_ops)
            );
        }
    }
}

/// Percentage progress bar that only redraws when the percentage moves.
pub(crate) struct SimpleProgress {
    pb: ProgressBar,
    max: u64,
    last: Option<u64>,
}

impl SimpleProgress {
    pub fn new(max: u64) -> Self {
        Self {
            pb: ProgressBar::new(100),
            max,
            last: None,
        }
    }

    pub fn update(&mut self, value: u64) {
        if self.max == 0 {
            return;
        }
        let value = (value.min(self.max) * 100) / self.max;

        match self.last {
            Some(v) if v == value => {
                // no change
            }
            _ => {
                self.pb.set_position(value);
                self.last = Some(value);
            }
        }
    }

    pub fn finish(self) {
        self.pb.finish();
    }
}
