use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    cbt::{ConnParams, DiskParams},
    disklib::{OpenFlags, TransportMode},
    dump::DumpMode,
};

/// Everything needed to connect to and open one disk.
///
/// Built once per endpoint and never modified afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub vm_mo_ref: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub thumbprint: String,
    pub snapshot_mo_ref: String,
    pub path: String,
    /// Lock owner name handed to the library.
    pub identity: String,
    pub read_only: bool,
    pub transport: TransportMode,
}

impl ConnectionDescriptor {
    /// Descriptor for the hypervisor-hosted disk.
    ///
    /// Only `Restore` opens the remote side writable.
    pub fn remote(
        conn: &ConnParams,
        disk: &DiskParams,
        identity: &str,
        mode: DumpMode,
        transport: TransportMode,
    ) -> Self {
        Self {
            vm_mo_ref: conn.vm_mo_ref.clone(),
            host: conn.host.clone(),
            port: conn.port,
            username: conn.username.clone(),
            password: conn.password.clone(),
            thumbprint: conn.thumbprint.clone(),
            snapshot_mo_ref: conn.snapshot_mo_ref.clone(),
            path: disk.remote_path().to_string(),
            identity: identity.to_string(),
            read_only: mode != DumpMode::Restore,
            transport,
        }
    }

    /// Descriptor for a file-backed disk on this machine.
    pub fn local(path: &str, read_only: bool) -> Self {
        Self {
            vm_mo_ref: String::new(),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            thumbprint: String::new(),
            snapshot_mo_ref: String::new(),
            path: path.to_string(),
            identity: String::new(),
            read_only,
            transport: TransportMode::File,
        }
    }

    pub fn is_remote(&self) -> bool {
        !self.host.is_empty()
    }

    /// Whether the descriptor names a VM managed through a management
    /// server, which requires the prepare/end access handshake.
    pub fn targets_vm(&self) -> bool {
        !self.vm_mo_ref.is_empty()
    }

    pub fn open_flags(&self) -> OpenFlags {
        if self.read_only {
            OpenFlags::OPEN_READ_ONLY
        } else {
            OpenFlags::empty()
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("vm_mo_ref", &self.vm_mo_ref)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("thumbprint", &self.thumbprint)
            .field("snapshot_mo_ref", &self.snapshot_mo_ref)
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("read_only", &self.read_only)
            .field("transport", &self.transport)
            .finish()
    }
}

/// A lock owner name unique to this process and start time.
pub fn session_identity() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("cbtdump_{}_{}", std::process::id(), secs)
}
