use std::sync::Arc;

use log::{debug, info};

use crate::{
    changemap::ChangeMap,
    disklib::{DiskLib, MAX_CHUNK_NUMBER, SECTOR_SIZE},
    error::Result,
    progress::{CancelToken, DiskProgress, SimpleProgress},
    session::DiskSession,
};

/// Sectors per scanned block (1 MiB).
pub const BLOCK_SECTORS: u64 = 2048;

/// Builds a [`ChangeMap`] from the library's allocated-block queries.
///
/// The disk is walked in blocks of [`BLOCK_SECTORS`]; each query covers at
/// most `max_chunk_number` blocks, the library's per-call ceiling.  The
/// concatenated results equal those of one unbounded query, split at query
/// boundaries.
pub struct BlockScanner {
    max_chunk_number: u64,
    progress: Arc<DiskProgress>,
    cancel: CancelToken,
}

impl Default for BlockScanner {
    fn default() -> Self {
        Self {
            max_chunk_number: MAX_CHUNK_NUMBER,
            progress: DiskProgress::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl BlockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_max_chunk_number(self, max_chunk_number: u64) -> Self {
        assert!(max_chunk_number > 0);
        Self {
            max_chunk_number,
            ..self
        }
    }

    pub fn with_progress(self, progress: Arc<DiskProgress>) -> Self {
        Self { progress, ..self }
    }

    pub fn with_cancel(self, cancel: CancelToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn scan<L: DiskLib>(&self, session: &DiskSession<L>) -> Result<ChangeMap> {
        let capacity = session.info().capacity;
        let mut map = ChangeMap::new(0, capacity * SECTOR_SIZE);

        let mut block_count = capacity / BLOCK_SECTORS;
        debug!(
            "Scanning {} blocks of {} sectors, at most {} per query",
            block_count, BLOCK_SECTORS, self.max_chunk_number
        );

        let mut pb = SimpleProgress::new(capacity);
        let mut offset = 0u64;
        while block_count > 0 {
            self.cancel.check()?;
            pb.update(offset);

            let once = u64::min(block_count, self.max_chunk_number);
            let extents =
                session.query_allocated_blocks(offset, once * BLOCK_SECTORS, BLOCK_SECTORS)?;
            for e in extents {
                map.push_area(e.offset * SECTOR_SIZE, e.length * SECTOR_SIZE)?;
            }

            block_count -= once;
            offset += once * BLOCK_SECTORS;
            self.progress.set_processed(offset * SECTOR_SIZE);
        }

        // Queries only accept whole chunks, so a partial last block is
        // copied unconditionally.
        if offset < capacity {
            debug!("Tail of {} sectors marked changed", capacity - offset);
            map.push_area(offset * SECTOR_SIZE, (capacity - offset) * SECTOR_SIZE)?;
            self.progress.set_processed(capacity * SECTOR_SIZE);
        }
        pb.finish();

        info!(
            "Found {} changed areas, {} bytes",
            map.changed_areas.len(),
            map.estimate()
        );
        Ok(map)
    }
}
