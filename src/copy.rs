use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
    changemap::ChangeMap,
    disklib::{DiskLib, SECTOR_SIZE},
    error::{Error, Result},
    progress::{CancelToken, DiskProgress, SimpleProgress, TransferStats},
    session::DiskSession,
};

/// Bytes moved per read/write pair: 2048 sectors, 1 MiB.
pub const COPY_UNIT: usize = (SECTOR_SIZE * 1024 * 2) as usize;

/// What to do when the library transfers fewer bytes than asked for.
///
/// A transfer of zero bytes is always fatal, whatever the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ShortTransferPolicy {
    /// Issue follow-up calls for the remainder until the unit is complete.
    #[default]
    Retry,
    /// Abort the copy with [`Error::ShortTransfer`].
    FailFast,
    /// Log the discrepancy and advance by the bytes actually read.  A short
    /// write leaves the rest of that unit uncopied.
    Tolerate,
}

/// Applies a [`ChangeMap`] by copying each changed range from one session
/// to the other, at the same offsets.
///
/// Any read or write error aborts the whole copy.  Nothing is kept to
/// resume from; the map can simply be applied again.
pub struct CopyEngine {
    policy: ShortTransferPolicy,
    progress: Arc<DiskProgress>,
    cancel: CancelToken,
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self {
            policy: ShortTransferPolicy::default(),
            progress: DiskProgress::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl CopyEngine {
    pub fn new(policy: ShortTransferPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn with_progress(self, progress: Arc<DiskProgress>) -> Self {
        Self { progress, ..self }
    }

    pub fn with_cancel(self, cancel: CancelToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn copy<S: DiskLib, D: DiskLib>(
        &self,
        map: &ChangeMap,
        source: &DiskSession<S>,
        destination: &DiskSession<D>,
    ) -> Result<TransferStats> {
        map.validate()?;
        let mut stats = TransferStats::default();
        if map.is_identical() {
            info!("No changed areas, nothing to copy");
            return Ok(stats);
        }

        let estimate = map.estimate();
        self.progress.set_estimate(estimate);
        let mut pb = SimpleProgress::new(estimate);
        let mut done = 0u64;

        let mut block = vec![0u8; COPY_UNIT];
        for area in &map.changed_areas {
            debug!("Copying area {:#x}+{:#x}", area.start, area.length);
            // Validated above: neither sum can wrap.
            let mut offset = map.start_offset + area.start;
            let bound = offset + area.length;

            while offset < bound {
                self.cancel.check()?;
                pb.update(done);

                // The last unit of an area is cut short rather than reading
                // past the area's end.
                let want = u64::min(COPY_UNIT as u64, bound - offset) as usize;
                let buf = &mut block[..want];

                let read = self.read_unit(source, buf, offset, &mut stats)?;
                self.write_unit(destination, &buf[..read], offset, &mut stats)?;

                offset += read as u64;
                done += read as u64;
                self.progress.add_finished(read as u64);
            }
        }
        pb.finish();

        stats.log();
        Ok(stats)
    }

    fn read_unit<L: DiskLib>(
        &self,
        session: &DiskSession<L>,
        buf: &mut [u8],
        offset: u64,
        stats: &mut TransferStats,
    ) -> Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = session.read_at(&mut buf[filled..], offset + filled as u64)?;
            stats.record_read(n);
            if n == 0 {
                return Err(short("read", offset, buf.len(), filled));
            }
            filled += n;
            if filled < buf.len() {
                match self.policy {
                    ShortTransferPolicy::Retry => {
                        debug!("Short read at {:#x}: {} of {}", offset, filled, buf.len());
                    }
                    ShortTransferPolicy::FailFast => {
                        return Err(short("read", offset, buf.len(), filled));
                    }
                    ShortTransferPolicy::Tolerate => {
                        warn!("readLen: {}, expected: {}, offset: {:#x}", filled, buf.len(), offset);
                        break;
                    }
                }
            }
        }
        Ok(filled)
    }

    fn write_unit<L: DiskLib>(
        &self,
        session: &DiskSession<L>,
        buf: &[u8],
        offset: u64,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let mut written = 0usize;
        while written < buf.len() {
            let n = session.write_at(&buf[written..], offset + written as u64)?;
            stats.record_write(n);
            if n == 0 {
                return Err(short("write", offset, buf.len(), written));
            }
            written += n;
            if written < buf.len() {
                match self.policy {
                    ShortTransferPolicy::Retry => {
                        debug!("Short write at {:#x}: {} of {}", offset, written, buf.len());
                    }
                    ShortTransferPolicy::FailFast => {
                        return Err(short("write", offset, buf.len(), written));
                    }
                    ShortTransferPolicy::Tolerate => {
                        warn!(
                            "writeLen: {}, expected: {}, offset: {:#x}",
                            written,
                            buf.len(),
                            offset
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn short(op: &'static str, offset: u64, expected: usize, actual: usize) -> Error {
    Error::ShortTransfer {
        op,
        offset,
        expected,
        actual,
    }
}
