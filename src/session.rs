use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
    descriptor::ConnectionDescriptor,
    disklib::{CreateParams, DiskInfo, DiskLib, VixError, VixResult},
    error::{Error, Result},
};

/// One opened disk and the connection it was opened on.
///
/// Closing releases the disk handle before the connection.  A session that
/// is dropped while still open is closed on the way out.
pub struct DiskSession<L: DiskLib> {
    lib: Arc<L>,
    descriptor: ConnectionDescriptor,
    conn: Option<L::Connection>,
    disk: Option<L::Disk>,
    info: DiskInfo,
}

impl<L: DiskLib> DiskSession<L> {
    /// Connects, opens and queries the disk.  Anything acquired before a
    /// failing step is released again.
    pub fn open(lib: Arc<L>, descriptor: ConnectionDescriptor) -> Result<Self> {
        Self::open_with(lib, descriptor, None)
    }

    /// Like [`DiskSession::open`], but first creates the disk on the fresh
    /// connection.
    pub fn create(
        lib: Arc<L>,
        descriptor: ConnectionDescriptor,
        params: &CreateParams,
    ) -> Result<Self> {
        Self::open_with(lib, descriptor, Some(params))
    }

    fn open_with(
        lib: Arc<L>,
        descriptor: ConnectionDescriptor,
        create: Option<&CreateParams>,
    ) -> Result<Self> {
        let failed = |stage: &'static str, source: VixError| Error::DiskOpenFailed {
            stage,
            path: descriptor.path.clone(),
            source,
        };

        let conn = if descriptor.is_remote() {
            lib.connect_ex(&descriptor)
        } else {
            lib.connect(&descriptor)
        }
        .map_err(|e| failed("connect", e))?;
        debug!("Connected for {}", descriptor.path);

        let opened = create
            .map_or(Ok(()), |params| {
                lib.create(&conn, &descriptor.path, params)
                    .map_err(|e| failed("create", e))
            })
            .and_then(|_| {
                lib.open(&conn, &descriptor.path, descriptor.open_flags())
                    .map_err(|e| failed("open", e))
            });
        let disk = match opened {
            Ok(disk) => disk,
            Err(e) => {
                release(lib.disconnect(conn), "disconnect");
                return Err(e);
            }
        };

        let info = match lib.get_info(&disk) {
            Ok(info) => info,
            Err(e) => {
                release(lib.close(disk), "close");
                release(lib.disconnect(conn), "disconnect");
                return Err(failed("get info", e));
            }
        };
        info!(
            "Opened {} ({} sectors, read-only: {})",
            descriptor.path, info.capacity, descriptor.read_only
        );

        Ok(Self {
            lib,
            descriptor,
            conn: Some(conn),
            disk: Some(disk),
            info,
        })
    }

    fn disk(&self) -> Result<&L::Disk> {
        self.disk.as_ref().ok_or(Error::InvalidHandle)
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn info(&self) -> &DiskInfo {
        &self.info
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.info.capacity_bytes()
    }

    /// May read fewer bytes than `buf.len()`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.lib
            .read_at(self.disk()?, buf, offset)
            .map_err(|source| Error::Io {
                op: "read",
                offset,
                source,
            })
    }

    /// May write fewer bytes than `buf.len()`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.lib
            .write_at(self.disk()?, buf, offset)
            .map_err(|source| Error::Io {
                op: "write",
                offset,
                source,
            })
    }

    pub fn query_allocated_blocks(
        &self,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> Result<Vec<crate::disklib::BlockExtent>> {
        self.lib
            .query_allocated_blocks(self.disk()?, start_sector, num_sectors, chunk_size)
            .map_err(|source| Error::Io {
                op: "query allocated blocks",
                offset: start_sector * crate::disklib::SECTOR_SIZE,
                source,
            })
    }

    pub fn metadata_keys(&self) -> Result<Vec<String>> {
        let disk = self.disk()?;
        let buf = fetch_sized(|buf| self.lib.get_metadata_keys(disk, buf)).map_err(|source| {
            Error::Metadata {
                op: "list",
                key: String::new(),
                source,
            }
        })?;
        Ok(split_keys(&buf))
    }

    /// Value of `key`, without the library's terminating NUL.
    pub fn read_metadata(&self, key: &str) -> Result<Vec<u8>> {
        let disk = self.disk()?;
        let mut buf = fetch_sized(|buf| self.lib.read_metadata(disk, key, buf)).map_err(
            |source| Error::Metadata {
                op: "read",
                key: key.to_string(),
                source,
            },
        )?;
        if buf.last() == Some(&0) {
            buf.pop();
        }
        Ok(buf)
    }

    pub fn write_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lib
            .write_metadata(self.disk()?, key, value)
            .map_err(|source| Error::Metadata {
                op: "write",
                key: key.to_string(),
                source,
            })
    }

    /// Releases the disk handle, then the connection.  Closing an already
    /// closed session does nothing.  Both releases are attempted even when
    /// the first fails; the first failure is returned.
    pub fn close(&mut self) -> VixResult<()> {
        let mut result = Ok(());
        if let Some(disk) = self.disk.take() {
            result = self.lib.close(disk);
        }
        if let Some(conn) = self.conn.take() {
            let disconnected = self.lib.disconnect(conn);
            if result.is_ok() {
                result = disconnected;
            }
        }
        if result.is_ok() {
            debug!("Closed {}", self.descriptor.path);
        }
        result
    }
}

impl<L: DiskLib> Drop for DiskSession<L> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing {} failed: {}", self.descriptor.path, e);
        }
    }
}

fn release(result: VixResult<()>, what: &str) {
    if let Err(e) = result {
        warn!("{} during failed open: {}", what, e);
    }
}

/// Two-phase fetch: ask for the length with an empty buffer, then fetch
/// into a buffer of that size.
fn fetch_sized(mut call: impl FnMut(&mut [u8]) -> VixResult<usize>) -> VixResult<Vec<u8>> {
    let required = match call(&mut []) {
        Ok(n) => n,
        Err(VixError::BufferTooSmall { required }) => required,
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; required];
    if required > 0 {
        let n = call(&mut buf)?;
        buf.truncate(n);
    }
    Ok(buf)
}

/// Splits a NUL-delimited list; the empty tail after the last NUL is dropped.
fn split_keys(buf: &[u8]) -> Vec<String> {
    let mut parts: Vec<&[u8]> = buf.split(|b| *b == 0).collect();
    if parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
        .into_iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        disklib::codes,
        fake::{FakeDiskLib, Fail},
        tests::init_logger,
    };

    fn open(lib: &Arc<FakeDiskLib>, path: &str) -> Result<DiskSession<FakeDiskLib>> {
        DiskSession::open(lib.clone(), ConnectionDescriptor::local(path, false))
    }

    #[test]
    fn open_reports_capacity() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("a", 4 << 20);
        let s = open(&lib, "a").unwrap();
        assert_eq!(s.capacity(), 4 << 20);
        assert_eq!(s.info().capacity, (4 << 20) / 512);
    }

    #[test]
    fn close_twice_releases_once() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("a", 1 << 20);
        let mut s = open(&lib, "a").unwrap();
        s.close().unwrap();
        s.close().unwrap();
        drop(s);
        let calls = lib.calls();
        assert_eq!(calls.close, 1);
        assert_eq!(calls.disconnect, 1);
    }

    #[test]
    fn closed_session_returns_invalid_handle() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("a", 1 << 20);
        let mut s = open(&lib, "a").unwrap();
        s.close().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(s.read_at(&mut buf, 0), Err(Error::InvalidHandle)));
        assert!(matches!(s.write_at(&buf, 0), Err(Error::InvalidHandle)));
        assert!(matches!(s.metadata_keys(), Err(Error::InvalidHandle)));
    }

    #[test]
    fn failed_open_releases_connection() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        assert!(matches!(
            open(&lib, "missing"),
            Err(Error::DiskOpenFailed { stage: "open", .. })
        ));
        let calls = lib.calls();
        assert_eq!(calls.connect, 1);
        assert_eq!(calls.disconnect, 1);
        assert_eq!(calls.close, 0);
    }

    #[test]
    fn failed_get_info_releases_everything() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("a", 1 << 20);
        lib.fail(Fail::GetInfo);
        assert!(matches!(
            open(&lib, "a"),
            Err(Error::DiskOpenFailed { stage: "get info", .. })
        ));
        let calls = lib.calls();
        assert_eq!(calls.close, 1);
        assert_eq!(calls.disconnect, 1);
    }

    #[test]
    fn remote_descriptor_uses_extended_connect() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("[ds1] vm.vmdk", 1 << 20);
        let mut d = ConnectionDescriptor::local("[ds1] vm.vmdk", true);
        d.host = "esx.local".to_string();
        let _s = DiskSession::open(lib.clone(), d).unwrap();
        assert_eq!(lib.calls().connect_ex, 1);
        assert_eq!(lib.calls().connect, 0);
    }

    #[test]
    fn metadata_two_phase_protocol() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("a", 1 << 20);
        lib.set_metadata("a", "changeId", b"52 de/4");
        lib.set_metadata("a", "uuid", b"60 00 C2");
        let s = open(&lib, "a").unwrap();
        assert_eq!(s.metadata_keys().unwrap(), vec!["changeId", "uuid"]);
        assert_eq!(s.read_metadata("changeId").unwrap(), b"52 de/4");
        s.write_metadata("new", b"value").unwrap();
        assert_eq!(s.read_metadata("new").unwrap(), b"value");
    }

    #[test]
    fn metadata_read_error_names_key() {
        init_logger();
        let lib = Arc::new(FakeDiskLib::new());
        lib.add_disk("a", 1 << 20);
        let s = open(&lib, "a").unwrap();
        match s.read_metadata("absent") {
            Err(Error::Metadata { key, source, .. }) => {
                assert_eq!(key, "absent");
                assert_eq!(source.code(), codes::VIX_E_DISK_NOKEY);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn split_keys_drops_tail() {
        assert_eq!(split_keys(b"a\0bc\0"), vec!["a", "bc"]);
        assert_eq!(split_keys(b""), Vec::<String>::new());
        assert_eq!(split_keys(b"a\0\0b\0"), vec!["a", "", "b"]);
    }
}
