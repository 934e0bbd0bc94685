// Definitions taken from `/usr/include/linux`.
use bitflags::bitflags;
use log::debug;
use std::{
    ffi::c_int,
    fs::File,
    io,
    ops::Range,
    os::{fd::AsRawFd, raw::c_ulong},
};

/// Byte ranges of `file` within `range` that have storage behind them,
/// in ascending order.  Ranges are clipped to `range`.
pub(crate) fn mapped_ranges(file: &File, range: Range<u64>) -> io::Result<Vec<Range<u64>>> {
    let mut result: Vec<Range<u64>> = Vec::new();
    let mut offset = range.start;
    while offset < range.end {
        let mut fr = Box::new(FiemapRequestFull::default());
        fr.request.fm_start = offset;
        fr.request.fm_length = range.end - offset;
        fr.request.fm_flags = FiemapFlag::SYNC.bits();
        fr.request.fm_mapped_extents = 0;
        fr.request.fm_extent_count = fr.fm_extents.len() as u32;

        let rc = unsafe {
            ioctl(
                file.as_raw_fd(),
                fs_ioc_fiemap(),
                (&mut *fr) as *mut FiemapRequestFull,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let mapped = fr.request.fm_mapped_extents as usize;
        if mapped == 0 {
            break;
        }

        let before = offset;
        let mut last = false;
        for e in &fr.fm_extents[..mapped.min(fr.fm_extents.len())] {
            let flags = FiemapExtentFlag::from_bits_truncate(e.fe_flags);
            debug!("Extent: {:?} {:?}", *e, flags);

            let start = e.fe_logical.max(range.start);
            let end = (e.fe_logical + e.fe_length).min(range.end);
            if start < end {
                match result.last_mut() {
                    Some(prev) if prev.end >= start => prev.end = prev.end.max(end),
                    _ => result.push(start..end),
                }
            }
            offset = offset.max(e.fe_logical + e.fe_length);
            last |= flags.contains(FiemapExtentFlag::LAST);
        }
        if last || offset == before {
            break;
        }
    }
    Ok(result)
}

/// errno when the filesystem does not implement FIEMAP.
pub const EOPNOTSUPP: i32 = 95;
/// errno when the file is not on a filesystem at all (pipes, some FUSE).
pub const ENOTTY: i32 = 25;

extern "C" {
    fn ioctl(fd: c_int, request: c_ulong, ...) -> c_int;
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct FiemapFlag: u32 {
        /// sync file data before map
        const SYNC = 0x00000001 ;
        /// map extended attribute tree
        const XATTR = 0x00000002 ;
        /// request caching of the extents
        const CACHE = 0x00000004;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
        pub(crate) struct FiemapExtentFlag: u32 {
        /// Last extent in file.
        const LAST            =  0x00000001;
        /// Data location unknown.
        const UNKNOWN         =  0x00000002 ;
        /// Location still pending. Sets EXTENT_UNKNOWN.
        const DELALLOC        =  0x00000004;
        /// Space allocated, but no data (i.e. zero).
        const UNWRITTEN        = 0x00000800;
        /// Space shared with other files.
        const SHARED          =  0x00002000;
    }
}

#[repr(C)]
#[derive(Default, Debug)]
struct FiemapExtent {
    /// logical offset in bytes for the start of
    /// the extent from the beginning of the file
    fe_logical: u64,
    /// physical offset in bytes for the start
    /// of the extent from the beginning of the disk
    fe_physical: u64,
    /// length in bytes for this extent
    fe_length: u64,
    fe_reserved64: [u64; 2],
    /// FIEMAP_EXTENT_* flags for this extent
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default)]
struct FiemapRequest {
    /// logical offset (inclusive) at which to start mapping (in)
    fm_start: u64,
    /// logical length of mapping which userspace wants (in)
    fm_length: u64,
    /// FIEMAP_FLAG_* flags for request (in/out)
    fm_flags: u32,
    /// number of extents that were mapped (out)
    fm_mapped_extents: u32,
    /// size of fm_extents array (in)
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct FiemapRequestFull {
    request: FiemapRequest,
    /// array of mapped extents (out)
    /// 32 is the most that `Default` gives us ootb.
    fm_extents: [FiemapExtent; 32],
}

/// The value of FS_IOC_FIEMAP, computed from the request size so that a
/// wrong struct layout shows up in the test below.
fn fs_ioc_fiemap() -> c_ulong {
    // access mode
    (0b11 << 30) |
        // size of request
        (((std::mem::size_of::<FiemapRequest>() as c_ulong) & 0x3FFF) << 16) |
        // type (f = file?)
        (c_ulong::from(b'f') << 8) |
        // FIEMAP code.
        11
}
