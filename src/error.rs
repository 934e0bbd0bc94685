//! Error taxonomy of the dumper.

use thiserror::Error;

use crate::{
    disklib::VixError,
    dump::{DumpMode, DumpState},
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed connection parameters.  Never retried.
    #[error("invalid connection parameters: {0}")]
    Connection(String),

    #[error("prepare for access failed after {attempts} attempts: {source}")]
    PrepareFailed { attempts: u32, source: VixError },

    #[error("end access failed after {attempts} attempts: {source}")]
    EndAccessFailed { attempts: u32, source: VixError },

    #[error("disk library initialisation failed: {0}")]
    LibraryInit(VixError),

    #[error("disk library already shut down for this process")]
    LibraryExited,

    #[error("opening {path} failed during {stage}: {source}")]
    DiskOpenFailed {
        stage: &'static str,
        path: String,
        source: VixError,
    },

    #[error("{op} at offset {offset:#x} failed: {source}")]
    Io {
        op: &'static str,
        offset: u64,
        source: VixError,
    },

    #[error("{op} at offset {offset:#x} transferred {actual} of {expected} bytes")]
    ShortTransfer {
        op: &'static str,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// The session was never opened or is already closed.
    #[error("invalid disk handle")]
    InvalidHandle,

    #[error("extent {start:#x}+{length:#x} exceeds {limit:#x}")]
    InvalidExtent { start: u64, length: u64, limit: u64 },

    #[error("{op} of metadata key {key:?} failed: {source}")]
    Metadata {
        op: &'static str,
        key: String,
        source: VixError,
    },

    #[error("CBT document: {0}")]
    Document(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{op} not allowed in state {state:?}")]
    InvalidState { op: &'static str, state: DumpState },

    #[error("{mode:?} dump failed in state {state:?}: {source}")]
    Dump {
        mode: DumpMode,
        state: DumpState,
        source: Box<Error>,
    },
}

impl Error {
    /// Failures of the access handshake, which are retried before being
    /// surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::PrepareFailed { .. } | Error::EndAccessFailed { .. } => true,
            Error::Dump { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disklib::codes;

    #[test]
    fn io_error_names_offset() {
        let err = Error::Io {
            op: "read",
            offset: 0x100000,
            source: VixError::new(codes::VIX_E_FAIL, "boom"),
        };
        let msg = err.to_string();
        assert!(msg.contains("read"));
        assert!(msg.contains("0x100000"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn dump_error_reports_mode_and_state() {
        let err = Error::Dump {
            mode: DumpMode::Backup,
            state: DumpState::Copying,
            source: Box::new(Error::InvalidHandle),
        };
        let msg = err.to_string();
        assert!(msg.contains("Backup"));
        assert!(msg.contains("Copying"));
        assert!(msg.contains("invalid disk handle"));
        assert!(!err.is_transient());
    }

    #[test]
    fn access_failures_are_transient() {
        let err = Error::PrepareFailed {
            attempts: 10,
            source: VixError::new(codes::VIX_E_FAIL, "busy"),
        };
        assert!(err.is_transient());
        let wrapped = Error::Dump {
            mode: DumpMode::Clone,
            state: DumpState::Created,
            source: Box::new(err),
        };
        assert!(wrapped.is_transient());
    }
}
