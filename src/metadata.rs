use log::{debug, info};

use crate::{disklib::DiskLib, error::Result, session::DiskSession};

/// One disk metadata key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Copies disk-level metadata (change ids, UUIDs, geometry hints) between
/// sessions.  Keys that are empty after trimming are skipped.
pub struct MetadataReplicator;

impl MetadataReplicator {
    /// Every non-blank entry of `session`, in the library's key order.
    pub fn read_all<L: DiskLib>(session: &DiskSession<L>) -> Result<Vec<MetadataEntry>> {
        let keys = session.metadata_keys()?;
        debug!("Metadata keys: {:?}", keys);
        keys.into_iter()
            .filter(|k| !k.trim().is_empty())
            .map(|key| {
                let value = session.read_metadata(&key)?;
                Ok(MetadataEntry { key, value })
            })
            .collect()
    }

    /// Stops at the first key that cannot be read or written.  Returns the
    /// number of entries written.
    pub fn replicate<S: DiskLib, D: DiskLib>(
        source: &DiskSession<S>,
        destination: &DiskSession<D>,
    ) -> Result<usize> {
        let mut written = 0;
        for key in source.metadata_keys()? {
            if key.trim().is_empty() {
                debug!("Skipping blank metadata key");
                continue;
            }
            let value = source.read_metadata(&key)?;
            debug!("Metadata {} = {}", key, String::from_utf8_lossy(&value));
            destination.write_metadata(&key, &value)?;
            written += 1;
        }
        info!("Replicated {} metadata entries", written);
        Ok(written)
    }
}
