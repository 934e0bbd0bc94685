//! Contract of the native virtual disk library.
//!
//! The core never talks to the library directly; everything goes through
//! [`DiskLib`], which mirrors the subset of the VixDiskLib API the dumper
//! needs.  All calls are synchronous, even when the library uses NBD
//! underneath.

use std::fmt;
use std::path::PathBuf;

use bitflags::bitflags;
use thiserror::Error;

/// Bytes per sector, fixed by the library.
pub const SECTOR_SIZE: u64 = 512;

/// Upper bound on the number of chunks a single allocated-block query
/// may cover.
pub const MAX_CHUNK_NUMBER: u64 = 512 * 1024;

/// Smallest chunk size (in sectors) accepted by allocated-block queries.
pub const MIN_CHUNK_SIZE: u64 = 128;

/// Native error codes the core branches on or produces.
pub mod codes {
    pub const VIX_E_FAIL: u64 = 1;
    pub const VIX_E_INVALID_ARG: u64 = 3;
    pub const VIX_E_FILE_NOT_FOUND: u64 = 4;
    pub const VIX_E_OBJECT_IS_BUSY: u64 = 5;
    pub const VIX_E_NOT_SUPPORTED: u64 = 6;
    pub const VIX_E_FILE_READ_ONLY: u64 = 11;
    pub const VIX_E_FILE_ALREADY_EXISTS: u64 = 12;
    pub const VIX_E_BUFFER_TOOSMALL: u64 = 24;
    pub const VIX_E_INVALID_UTF8_STRING: u64 = 27;
    pub const VIX_E_DISK_OUTOFRANGE: u64 = 16007;
    pub const VIX_E_DISK_NOKEY: u64 = 16017;
}

/// Error returned across the native boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VixError {
    /// The caller's buffer cannot hold the result; `required` bytes are needed.
    ///
    /// The length-then-fetch protocols rely on this variant.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("{message} (vix error {code})")]
    Native { code: u64, message: String },
}

impl VixError {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        if code == codes::VIX_E_BUFFER_TOOSMALL {
            return VixError::BufferTooSmall { required: 0 };
        }
        VixError::Native {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            VixError::BufferTooSmall { .. } => codes::VIX_E_BUFFER_TOOSMALL,
            VixError::Native { code, .. } => *code,
        }
    }
}

impl From<std::io::Error> for VixError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => codes::VIX_E_FILE_NOT_FOUND,
            std::io::ErrorKind::AlreadyExists => codes::VIX_E_FILE_ALREADY_EXISTS,
            std::io::ErrorKind::PermissionDenied => codes::VIX_E_FILE_READ_ONLY,
            std::io::ErrorKind::InvalidInput => codes::VIX_E_INVALID_ARG,
            _ => codes::VIX_E_FAIL,
        };
        VixError::new(code, e.to_string())
    }
}

pub type VixResult<T> = std::result::Result<T, VixError>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Disable host disk caching.
        const OPEN_UNBUFFERED = 0x00000001;
        /// Don't open parent disk(s).
        const OPEN_SINGLE_LINK = 0x00000002;
        /// Open read-only.
        const OPEN_READ_ONLY = 0x00000004;
    }
}

/// How the library reaches a remote disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TransportMode {
    #[default]
    Nbd,
    #[value(name = "nbdssl")]
    NbdSsl,
    #[value(name = "hotadd")]
    HotAdd,
    San,
    File,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Nbd => "nbd",
            TransportMode::NbdSsl => "nbdssl",
            TransportMode::HotAdd => "hotadd",
            TransportMode::San => "san",
            TransportMode::File => "file",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version the library is initialised with, plus where to load it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryVersion {
    pub major: u32,
    pub minor: u32,
    pub lib_path: Option<PathBuf>,
}

impl Default for LibraryVersion {
    fn default() -> Self {
        Self {
            major: 7,
            minor: 0,
            lib_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterType {
    ScsiLsiLogic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    MonolithicSparse,
    VmfsFlat,
}

/// What [`DiskLib::get_info`] reports about an open disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    /// Capacity in sectors.
    pub capacity: u64,
    pub adapter_type: AdapterType,
    pub num_links: u32,
}

impl DiskInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity * SECTOR_SIZE
    }
}

/// Parameters for [`DiskLib::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    pub disk_type: DiskType,
    pub adapter_type: AdapterType,
    pub hw_version: u16,
    /// Capacity in sectors.
    pub capacity: u64,
}

impl CreateParams {
    /// A flat disk of `capacity_bytes`, rounded up to whole sectors.
    pub fn flat(capacity_bytes: u64) -> Self {
        Self {
            disk_type: DiskType::VmfsFlat,
            adapter_type: AdapterType::ScsiLsiLogic,
            hw_version: 7,
            capacity: capacity_bytes.div_ceil(SECTOR_SIZE),
        }
    }
}

/// One allocated (or changed) run of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExtent {
    pub offset: u64,
    pub length: u64,
}

/// Result of [`DiskLib::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub cleaned: u32,
    pub remaining: u32,
}

/// The native disk library.
///
/// `Connection` and `Disk` stand for the library's opaque handles.  They
/// are moved into [`DiskLib::disconnect`] and [`DiskLib::close`], so a
/// handle cannot be released twice.
pub trait DiskLib {
    type Connection;
    type Disk;

    /// Process-wide initialisation.  Must be called at most once per
    /// process; see [`crate::library::LibraryRegistry`].
    fn init(&self, version: &LibraryVersion) -> VixResult<()>;
    fn exit(&self);

    fn connect(&self, params: &crate::descriptor::ConnectionDescriptor)
        -> VixResult<Self::Connection>;
    /// Connect with an extended authentication context (remote endpoints).
    fn connect_ex(
        &self,
        params: &crate::descriptor::ConnectionDescriptor,
    ) -> VixResult<Self::Connection>;
    fn disconnect(&self, conn: Self::Connection) -> VixResult<()>;

    fn open(
        &self,
        conn: &Self::Connection,
        path: &str,
        flags: OpenFlags,
    ) -> VixResult<Self::Disk>;
    fn close(&self, disk: Self::Disk) -> VixResult<()>;
    fn create(&self, conn: &Self::Connection, path: &str, params: &CreateParams) -> VixResult<()>;
    fn get_info(&self, disk: &Self::Disk) -> VixResult<DiskInfo>;

    /// Extents are in sectors.  A single call covers at most
    /// [`MAX_CHUNK_NUMBER`] chunks of `chunk_size` sectors.
    fn query_allocated_blocks(
        &self,
        disk: &Self::Disk,
        start_sector: u64,
        num_sectors: u64,
        chunk_size: u64,
    ) -> VixResult<Vec<BlockExtent>>;

    /// May transfer fewer bytes than `buf.len()`.
    fn read_at(&self, disk: &Self::Disk, buf: &mut [u8], offset: u64) -> VixResult<usize>;
    /// May transfer fewer bytes than `buf.len()`.
    fn write_at(&self, disk: &Self::Disk, buf: &[u8], offset: u64) -> VixResult<usize>;

    /// Fills `buf` with the null-delimited key list and returns its length,
    /// or fails with [`VixError::BufferTooSmall`] carrying the length needed.
    fn get_metadata_keys(&self, disk: &Self::Disk, buf: &mut [u8]) -> VixResult<usize>;
    /// Same length-then-fetch protocol as [`DiskLib::get_metadata_keys`].
    fn read_metadata(&self, disk: &Self::Disk, key: &str, buf: &mut [u8]) -> VixResult<usize>;
    fn write_metadata(&self, disk: &Self::Disk, key: &str, value: &[u8]) -> VixResult<()>;

    fn prepare_for_access(&self, params: &crate::descriptor::ConnectionDescriptor)
        -> VixResult<()>;
    fn end_access(&self, params: &crate::descriptor::ConnectionDescriptor) -> VixResult<()>;
    fn cleanup(&self, params: &crate::descriptor::ConnectionDescriptor)
        -> VixResult<CleanupCounts>;
}
