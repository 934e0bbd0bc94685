//! In-memory [`DiskLib`] with call counters and failure injection.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    descriptor::ConnectionDescriptor,
    disklib::{
        codes, BlockExtent, CleanupCounts, CreateParams, DiskInfo, DiskLib, AdapterType,
        LibraryVersion, OpenFlags, VixError, VixResult, SECTOR_SIZE,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fail {
    Init,
    Open,
    GetInfo,
    /// Fail this many prepare calls, then succeed.
    Prepare(u32),
    /// Fail this many end access calls, then succeed.
    EndAccess(u32),
    Cleanup,
    Query,
    /// Fail the read that starts at this byte offset.
    ReadAt(u64),
    WriteAt(u64),
    WriteMetadata,
    /// Transfer at most this many bytes per read.
    ShortReads(usize),
    ShortWrites(usize),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Calls {
    pub init: u32,
    pub exit: u32,
    pub connect: u32,
    pub connect_ex: u32,
    pub disconnect: u32,
    pub open: u32,
    pub close: u32,
    pub create: u32,
    pub prepare: u32,
    pub end_access: u32,
    pub cleanup: u32,
    /// (start sector, sector count, chunk size)
    pub queries: Vec<(u64, u64, u64)>,
    /// (offset, length)
    pub reads: Vec<(u64, usize)>,
    pub writes: Vec<(u64, usize)>,
    pub metadata_writes: Vec<String>,
    /// Every call in order, by name.
    pub sequence: Vec<&'static str>,
}

struct FakeDisk {
    data: Vec<u8>,
    metadata: Vec<(String, Vec<u8>)>,
    allocated: Option<Vec<BlockExtent>>,
}

#[derive(Default)]
struct State {
    disks: HashMap<String, FakeDisk>,
    handles: HashMap<u32, (String, bool)>,
    next_handle: u32,
    calls: Calls,
    failures: Vec<Fail>,
}

impl State {
    fn record(&mut self, name: &'static str) {
        self.calls.sequence.push(name);
    }

    fn failing(&self, f: Fail) -> bool {
        self.failures.contains(&f)
    }

    /// Consumes one failure from a counted `Fail` variant.
    fn take_counted(&mut self, matches: fn(&Fail) -> Option<u32>, make: fn(u32) -> Fail) -> bool {
        let pos = self.failures.iter().position(|f| matches(f).is_some());
        match pos {
            Some(i) => {
                let left = matches(&self.failures[i]).unwrap_or(0);
                if left == u32::MAX {
                    return true;
                }
                if left <= 1 {
                    self.failures.remove(i);
                } else {
                    self.failures[i] = make(left - 1);
                }
                true
            }
            None => false,
        }
    }

    fn short_limit(&self, which: fn(&Fail) -> Option<usize>) -> Option<usize> {
        self.failures.iter().find_map(which)
    }

    fn disk(&mut self, handle: u32) -> VixResult<(&mut FakeDisk, bool)> {
        let (path, read_only) = self
            .handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| VixError::new(INVALID_HANDLE, "bad handle"))?;
        let disk = self
            .disks
            .get_mut(&path)
            .ok_or_else(|| VixError::new(codes::VIX_E_FILE_NOT_FOUND, path))?;
        Ok((disk, read_only))
    }
}

/// The library's code for a stale or unknown handle.
const INVALID_HANDLE: u64 = 1000;

pub(crate) struct FakeDiskLib {
    state: Mutex<State>,
}

fn injected(what: &str) -> VixError {
    VixError::new(codes::VIX_E_FAIL, format!("injected {} failure", what))
}

impl FakeDiskLib {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_disk(&self, path: &str, capacity: u64) {
        self.add_disk_with(path, vec![0u8; capacity as usize]);
    }

    pub fn add_disk_with(&self, path: &str, data: Vec<u8>) {
        self.lock().disks.insert(
            path.to_string(),
            FakeDisk {
                data,
                metadata: Vec::new(),
                allocated: None,
            },
        );
    }

    /// Allocated extents, in sectors.  Without this every query reports its
    /// whole range as allocated.
    pub fn set_allocated(&self, path: &str, extents: Vec<BlockExtent>) {
        self.lock().disks.get_mut(path).unwrap().allocated = Some(extents);
    }

    pub fn set_metadata(&self, path: &str, key: &str, value: &[u8]) {
        let mut st = self.lock();
        let md = &mut st.disks.get_mut(path).unwrap().metadata;
        match md.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_vec(),
            None => md.push((key.to_string(), value.to_vec())),
        }
    }

    pub fn metadata(&self, path: &str) -> Vec<(String, Vec<u8>)> {
        self.lock().disks[path].metadata.clone()
    }

    pub fn data(&self, path: &str) -> Vec<u8> {
        self.lock().disks[path].data.clone()
    }

    pub fn has_disk(&self, path: &str) -> bool {
        self.lock().disks.contains_key(path)
    }

    pub fn fail(&self, f: Fail) {
        self.lock().failures.push(f);
    }

    pub fn calls(&self) -> Calls {
        self.lock().calls.clone()
    }

    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }
}

impl DiskLib for FakeDiskLib {
    type Connection = u32;
    type Disk = u32;

    fn init(&self, _version: &LibraryVersion) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.init += 1;
        st.record("init");
        if st.failing(Fail::Init) {
            return Err(injected("init"));
        }
        Ok(())
    }

    fn exit(&self) {
        let mut st = self.lock();
        st.calls.exit += 1;
        st.record("exit");
    }

    fn connect(&self, _params: &ConnectionDescriptor) -> VixResult<u32> {
        let mut st = self.lock();
        st.calls.connect += 1;
        st.record("connect");
        st.next_handle += 1;
        Ok(st.next_handle)
    }

    fn connect_ex(&self, _params: &ConnectionDescriptor) -> VixResult<u32> {
        let mut st = self.lock();
        st.calls.connect_ex += 1;
        st.record("connect_ex");
        st.next_handle += 1;
        Ok(st.next_handle)
    }

    fn disconnect(&self, _conn: u32) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.disconnect += 1;
        st.record("disconnect");
        Ok(())
    }

    fn open(&self, _conn: &u32, path: &str, flags: OpenFlags) -> VixResult<u32> {
        let mut st = self.lock();
        st.calls.open += 1;
        st.record("open");
        if st.failing(Fail::Open) {
            return Err(injected("open"));
        }
        if !st.disks.contains_key(path) {
            return Err(VixError::new(codes::VIX_E_FILE_NOT_FOUND, path));
        }
        st.next_handle += 1;
        let h = st.next_handle;
        st.handles.insert(
            h,
            (path.to_string(), flags.contains(OpenFlags::OPEN_READ_ONLY)),
        );
        Ok(h)
    }

    fn close(&self, disk: u32) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.close += 1;
        st.record("close");
        st.handles
            .remove(&disk)
            .map(|_| ())
            .ok_or_else(|| VixError::new(INVALID_HANDLE, "double close"))
    }

    fn create(&self, _conn: &u32, path: &str, params: &CreateParams) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.create += 1;
        st.record("create");
        if st.disks.contains_key(path) {
            return Err(VixError::new(codes::VIX_E_FILE_ALREADY_EXISTS, path));
        }
        st.disks.insert(
            path.to_string(),
            FakeDisk {
                data: vec![0u8; (params.capacity * SECTOR_SIZE) as usize],
                metadata: Vec::new(),
                allocated: None,
            },
        );
        Ok(())
    }

    fn get_info(&self, disk: &u32) -> VixResult<DiskInfo> {
        let mut st = self.lock();
        st.record("get_info");
        if st.failing(Fail::GetInfo) {
            return Err(injected("get info"));
        }
        let (d, _) = st.disk(*disk)?;
        Ok(DiskInfo {
            capacity: d.data.len() as u64 / SECTOR_SIZE,
            adapter_type: AdapterType::ScsiLsiLogic,
            num_links: 1,
        })
    }

    fn query_allocated_blocks(
        &self,
        disk: &u32,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> VixResult<Vec<BlockExtent>> {
        let mut st = self.lock();
        st.calls.queries.push((start_sector, num_sectors, chunk_size));
        st.record("query");
        if st.failing(Fail::Query) {
            return Err(injected("query"));
        }
        let end = start_sector.saturating_add(num_sectors);
        let (d, _) = st.disk(*disk)?;
        Ok(match &d.allocated {
            None => vec![BlockExtent {
                offset: start_sector,
                length: num_sectors,
            }],
            Some(extents) => extents
                .iter()
                .filter_map(|e| {
                    let s = e.offset.max(start_sector);
                    let t = e.offset.saturating_add(e.length).min(end);
                    (s < t).then(|| BlockExtent {
                        offset: s,
                        length: t - s,
                    })
                })
                .collect(),
        })
    }

    fn read_at(&self, disk: &u32, buf: &mut [u8], offset: u64) -> VixResult<usize> {
        let mut st = self.lock();
        st.calls.reads.push((offset, buf.len()));
        st.record("read");
        if st.failing(Fail::ReadAt(offset)) {
            return Err(injected("read"));
        }
        let limit = st.short_limit(|f| match f {
            Fail::ShortReads(n) => Some(*n),
            _ => None,
        });
        let (d, _) = st.disk(*disk)?;
        let start = offset as usize;
        if start.checked_add(buf.len()).is_none_or(|end| end > d.data.len()) {
            return Err(VixError::new(codes::VIX_E_DISK_OUTOFRANGE, "read past end"));
        }
        let n = limit.map_or(buf.len(), |l| l.min(buf.len()));
        buf[..n].copy_from_slice(&d.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, disk: &u32, buf: &[u8], offset: u64) -> VixResult<usize> {
        let mut st = self.lock();
        st.calls.writes.push((offset, buf.len()));
        st.record("write");
        if st.failing(Fail::WriteAt(offset)) {
            return Err(injected("write"));
        }
        let limit = st.short_limit(|f| match f {
            Fail::ShortWrites(n) => Some(*n),
            _ => None,
        });
        let (d, read_only) = st.disk(*disk)?;
        if read_only {
            return Err(VixError::new(codes::VIX_E_FILE_READ_ONLY, "read-only"));
        }
        let start = offset as usize;
        if start.checked_add(buf.len()).is_none_or(|end| end > d.data.len()) {
            return Err(VixError::new(codes::VIX_E_DISK_OUTOFRANGE, "write past end"));
        }
        let n = limit.map_or(buf.len(), |l| l.min(buf.len()));
        d.data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn get_metadata_keys(&self, disk: &u32, buf: &mut [u8]) -> VixResult<usize> {
        let mut st = self.lock();
        st.record("get_metadata_keys");
        let (d, _) = st.disk(*disk)?;
        let mut list = Vec::new();
        for (k, _) in &d.metadata {
            list.extend_from_slice(k.as_bytes());
            list.push(0);
        }
        if buf.len() < list.len() {
            return Err(VixError::BufferTooSmall {
                required: list.len(),
            });
        }
        buf[..list.len()].copy_from_slice(&list);
        Ok(list.len())
    }

    fn read_metadata(&self, disk: &u32, key: &str, buf: &mut [u8]) -> VixResult<usize> {
        let mut st = self.lock();
        st.record("read_metadata");
        let (d, _) = st.disk(*disk)?;
        let mut value = d
            .metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| VixError::new(codes::VIX_E_DISK_NOKEY, key))?;
        value.push(0);
        if buf.len() < value.len() {
            return Err(VixError::BufferTooSmall {
                required: value.len(),
            });
        }
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    }

    fn write_metadata(&self, disk: &u32, key: &str, value: &[u8]) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.metadata_writes.push(key.to_string());
        st.record("write_metadata");
        if st.failing(Fail::WriteMetadata) {
            return Err(injected("write metadata"));
        }
        let (d, _) = st.disk(*disk)?;
        match d.metadata.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_vec(),
            None => d.metadata.push((key.to_string(), value.to_vec())),
        }
        Ok(())
    }

    fn prepare_for_access(&self, _params: &ConnectionDescriptor) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.prepare += 1;
        st.record("prepare");
        if st.take_counted(
            |f| match f {
                Fail::Prepare(n) => Some(*n),
                _ => None,
            },
            Fail::Prepare,
        ) {
            return Err(injected("prepare"));
        }
        Ok(())
    }

    fn end_access(&self, _params: &ConnectionDescriptor) -> VixResult<()> {
        let mut st = self.lock();
        st.calls.end_access += 1;
        st.record("end_access");
        if st.take_counted(
            |f| match f {
                Fail::EndAccess(n) => Some(*n),
                _ => None,
            },
            Fail::EndAccess,
        ) {
            return Err(injected("end access"));
        }
        Ok(())
    }

    fn cleanup(&self, _params: &ConnectionDescriptor) -> VixResult<CleanupCounts> {
        let mut st = self.lock();
        st.calls.cleanup += 1;
        st.record("cleanup");
        if st.failing(Fail::Cleanup) {
            return Err(injected("cleanup"));
        }
        Ok(CleanupCounts::default())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    fn open(lib: &FakeDiskLib, path: &str) -> u32 {
        let conn = lib.connect(&ConnectionDescriptor::local(path, true)).unwrap();
        lib.open(&conn, path, OpenFlags::OPEN_READ_ONLY).unwrap()
    }

    #[test]
    fn query_clips_extents_to_the_window() {
        let lib = FakeDiskLib::new();
        lib.add_disk("d", 8 << 20);
        lib.set_allocated(
            "d",
            vec![BlockExtent {
                offset: 2048,
                length: 2048,
            }],
        );
        let disk = open(&lib, "d");

        // Windows entirely before and entirely after the extent.
        assert!(lib.query_allocated_blocks(&disk, 0, 2048, 128).unwrap().is_empty());
        assert!(lib.query_allocated_blocks(&disk, 8192, 2048, 128).unwrap().is_empty());
        assert_eq!(
            lib.query_allocated_blocks(&disk, 3072, 2048, 128).unwrap(),
            vec![BlockExtent {
                offset: 3072,
                length: 1024,
            }]
        );
    }

    #[test]
    fn state_survives_a_panic_while_locked() {
        let lib = FakeDiskLib::new();
        lib.add_disk("d", 4096);
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            let _st = lib.lock();
            panic!("assertion failed while holding the fake's lock");
        }));
        assert!(r.is_err());

        assert!(lib.has_disk("d"));
        let disk = open(&lib, "d");
        assert_eq!(lib.calls().open, 1);
        lib.close(disk).unwrap();
        assert_eq!(lib.open_handles(), 0);
    }
}
