//! [`DiskLib`] over raw flat disk files.
//!
//! Datastore paths of the form `[ds] dir/disk.vmdk` resolve to
//! `<root>/ds/dir/disk.vmdk`; other relative paths resolve against `root`
//! and absolute paths are used as they are.  Allocated blocks come from
//! FIEMAP, metadata from a `<disk>.meta.json` sidecar, and access
//! preparation is an owner-stamped marker file per VM.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    descriptor::ConnectionDescriptor,
    disklib::{
        codes, AdapterType, BlockExtent, CleanupCounts, CreateParams, DiskInfo, DiskLib, DiskType,
        LibraryVersion, OpenFlags, TransportMode, VixError, VixResult, MAX_CHUNK_NUMBER,
        MIN_CHUNK_SIZE, SECTOR_SIZE,
    },
    fiemap,
};

const ACCESS_MARKER_PREFIX: &str = ".access-";

pub struct FlatDiskLib {
    root: PathBuf,
}

#[derive(Debug)]
pub struct FlatConnection {
    remote: bool,
    transport: TransportMode,
}

#[derive(Debug)]
pub struct FlatDisk {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl FlatDisk {
    fn len(&self) -> VixResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn check_range(&self, offset: u64, len: usize) -> VixResult<()> {
        let size = self.len()?;
        if offset + len as u64 > size {
            return Err(VixError::new(
                codes::VIX_E_DISK_OUTOFRANGE,
                format!(
                    "{}: {} bytes at {} past end ({})",
                    self.path.display(),
                    len,
                    offset,
                    size
                ),
            ));
        }
        Ok(())
    }
}

impl FlatDiskLib {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix('[') {
            if let Some((datastore, rest)) = rest.split_once(']') {
                return self.root.join(datastore.trim()).join(rest.trim_start());
            }
        }
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    fn access_marker(&self, params: &ConnectionDescriptor) -> VixResult<PathBuf> {
        if params.vm_mo_ref.is_empty() {
            return Err(VixError::new(codes::VIX_E_INVALID_ARG, "no VM reference"));
        }
        Ok(self
            .root
            .join(format!("{}{}", ACCESS_MARKER_PREFIX, params.vm_mo_ref)))
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".meta.json");
    PathBuf::from(s)
}

fn load_metadata(path: &Path) -> VixResult<BTreeMap<String, String>> {
    match fs::read(sidecar(path)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| VixError::new(codes::VIX_E_FAIL, format!("metadata: {}", e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn store_metadata(path: &Path, md: &BTreeMap<String, String>) -> VixResult<()> {
    let json = serde_json::to_vec_pretty(md)
        .map_err(|e| VixError::new(codes::VIX_E_FAIL, format!("metadata: {}", e)))?;
    fs::write(sidecar(path), json)?;
    Ok(())
}

/// Copies `data` into `buf`, or reports the length needed.
fn fill(buf: &mut [u8], data: &[u8]) -> VixResult<usize> {
    if buf.len() < data.len() {
        return Err(VixError::BufferTooSmall {
            required: data.len(),
        });
    }
    buf[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Whether the filesystem cannot map extents at all.
fn fiemap_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(fiemap::EOPNOTSUPP) | Some(fiemap::ENOTTY)
    )
}

impl DiskLib for FlatDiskLib {
    type Connection = FlatConnection;
    type Disk = FlatDisk;

    fn init(&self, version: &LibraryVersion) -> VixResult<()> {
        info!(
            "Flat disk library {}.{} at {}",
            version.major,
            version.minor,
            self.root.display()
        );
        if let Some(p) = &version.lib_path {
            debug!("Ignoring library path {}", p.display());
        }
        Ok(())
    }

    fn exit(&self) {
        debug!("Flat disk library exit");
    }

    fn connect(&self, params: &ConnectionDescriptor) -> VixResult<FlatConnection> {
        Ok(FlatConnection {
            remote: false,
            transport: params.transport,
        })
    }

    fn connect_ex(&self, params: &ConnectionDescriptor) -> VixResult<FlatConnection> {
        debug!(
            "Connecting to {}:{} as {} ({})",
            params.host, params.port, params.username, params.identity
        );
        Ok(FlatConnection {
            remote: true,
            transport: params.transport,
        })
    }

    fn disconnect(&self, _conn: FlatConnection) -> VixResult<()> {
        Ok(())
    }

    fn open(&self, conn: &FlatConnection, path: &str, flags: OpenFlags) -> VixResult<FlatDisk> {
        let resolved = self.resolve(path);
        let read_only = flags.contains(OpenFlags::OPEN_READ_ONLY);
        debug!(
            "Opening {} (remote: {}, transport: {}, flags: {:?})",
            resolved.display(),
            conn.remote,
            conn.transport,
            flags
        );
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&resolved)?;
        Ok(FlatDisk {
            file,
            path: resolved,
            read_only,
        })
    }

    fn close(&self, disk: FlatDisk) -> VixResult<()> {
        if !disk.read_only {
            disk.file.sync_all()?;
        }
        Ok(())
    }

    fn create(&self, _conn: &FlatConnection, path: &str, params: &CreateParams) -> VixResult<()> {
        if params.disk_type == DiskType::MonolithicSparse {
            return Err(VixError::new(
                codes::VIX_E_NOT_SUPPORTED,
                "sparse disks are not supported",
            ));
        }
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&resolved)?;
        file.set_len(params.capacity * SECTOR_SIZE)?;
        info!(
            "Created {} ({} sectors, {:?}, hw version {})",
            resolved.display(),
            params.capacity,
            params.adapter_type,
            params.hw_version
        );
        Ok(())
    }

    fn get_info(&self, disk: &FlatDisk) -> VixResult<DiskInfo> {
        Ok(DiskInfo {
            capacity: disk.len()? / SECTOR_SIZE,
            adapter_type: AdapterType::ScsiLsiLogic,
            num_links: 1,
        })
    }

    fn query_allocated_blocks(
        &self,
        disk: &FlatDisk,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> VixResult<Vec<BlockExtent>> {
        if chunk_size < MIN_CHUNK_SIZE
            || start_sector % chunk_size != 0
            || num_sectors % chunk_size != 0
            || num_sectors / chunk_size > MAX_CHUNK_NUMBER
        {
            return Err(VixError::new(
                codes::VIX_E_INVALID_ARG,
                format!(
                    "bad query: start {} count {} chunk {}",
                    start_sector, num_sectors, chunk_size
                ),
            ));
        }
        let end_sector = start_sector + num_sectors;
        if end_sector * SECTOR_SIZE > disk.len()? {
            return Err(VixError::new(
                codes::VIX_E_DISK_OUTOFRANGE,
                format!("query past end: {}", end_sector),
            ));
        }

        let range = start_sector * SECTOR_SIZE..end_sector * SECTOR_SIZE;
        let mapped = match fiemap::mapped_ranges(&disk.file, range.clone()) {
            Ok(m) => m,
            Err(e) if fiemap_unsupported(&e) => {
                warn!(
                    "No extent map for {} ({}), reporting everything allocated",
                    disk.path.display(),
                    e
                );
                vec![range.clone()]
            }
            Err(e) => return Err(e.into()),
        };

        let chunk_bytes = chunk_size * SECTOR_SIZE;
        let mut extents: Vec<BlockExtent> = Vec::new();
        for r in mapped {
            let start = (r.start / chunk_bytes * chunk_bytes).max(range.start) / SECTOR_SIZE;
            let end = (r.end.div_ceil(chunk_bytes) * chunk_bytes).min(range.end) / SECTOR_SIZE;
            if start >= end {
                continue;
            }
            match extents.last_mut() {
                Some(prev) if prev.offset + prev.length >= start => {
                    prev.length = prev.length.max(end - prev.offset);
                }
                _ => extents.push(BlockExtent {
                    offset: start,
                    length: end - start,
                }),
            }
        }
        Ok(extents)
    }

    fn read_at(&self, disk: &FlatDisk, buf: &mut [u8], offset: u64) -> VixResult<usize> {
        disk.check_range(offset, buf.len())?;
        Ok(disk.file.read_at(buf, offset)?)
    }

    fn write_at(&self, disk: &FlatDisk, buf: &[u8], offset: u64) -> VixResult<usize> {
        if disk.read_only {
            return Err(VixError::new(
                codes::VIX_E_FILE_READ_ONLY,
                format!("{} is open read-only", disk.path.display()),
            ));
        }
        disk.check_range(offset, buf.len())?;
        Ok(disk.file.write_at(buf, offset)?)
    }

    fn get_metadata_keys(&self, disk: &FlatDisk, buf: &mut [u8]) -> VixResult<usize> {
        let mut list = Vec::new();
        for key in load_metadata(&disk.path)?.keys() {
            list.extend_from_slice(key.as_bytes());
            list.push(0);
        }
        fill(buf, &list)
    }

    fn read_metadata(&self, disk: &FlatDisk, key: &str, buf: &mut [u8]) -> VixResult<usize> {
        let md = load_metadata(&disk.path)?;
        let value = md
            .get(key)
            .ok_or_else(|| VixError::new(codes::VIX_E_DISK_NOKEY, key))?;
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        fill(buf, &bytes)
    }

    fn write_metadata(&self, disk: &FlatDisk, key: &str, value: &[u8]) -> VixResult<()> {
        if disk.read_only {
            return Err(VixError::new(
                codes::VIX_E_FILE_READ_ONLY,
                format!("{} is open read-only", disk.path.display()),
            ));
        }
        let value = std::str::from_utf8(value)
            .map_err(|e| VixError::new(codes::VIX_E_INVALID_UTF8_STRING, format!("{}: {}", key, e)))?;
        let mut md = load_metadata(&disk.path)?;
        md.insert(key.to_string(), value.to_string());
        store_metadata(&disk.path, &md)
    }

    fn prepare_for_access(&self, params: &ConnectionDescriptor) -> VixResult<()> {
        let marker = self.access_marker(params)?;
        match fs::read_to_string(&marker) {
            Ok(owner) if owner != params.identity => {
                return Err(VixError::new(
                    codes::VIX_E_OBJECT_IS_BUSY,
                    format!("{} is held by {}", params.vm_mo_ref, owner),
                ))
            }
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.root)?;
        fs::write(&marker, &params.identity)?;
        debug!("Prepared {} for {}", params.vm_mo_ref, params.identity);
        Ok(())
    }

    fn end_access(&self, params: &ConnectionDescriptor) -> VixResult<()> {
        let marker = self.access_marker(params)?;
        match fs::read_to_string(&marker) {
            Ok(owner) if owner != params.identity => Err(VixError::new(
                codes::VIX_E_OBJECT_IS_BUSY,
                format!("{} is held by {}", params.vm_mo_ref, owner),
            )),
            Ok(_) => Ok(fs::remove_file(&marker)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the VM's access marker whoever holds it.  `remaining`
    /// counts markers left behind for other VMs.
    fn cleanup(&self, params: &ConnectionDescriptor) -> VixResult<CleanupCounts> {
        let own = self.access_marker(params)?;
        let mut counts = CleanupCounts::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(counts),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            let is_marker = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(ACCESS_MARKER_PREFIX));
            if !is_marker {
                continue;
            }
            if path == own {
                fs::remove_file(&path)?;
                counts.cleaned += 1;
            } else {
                counts.remaining += 1;
            }
        }
        Ok(counts)
    }
}
