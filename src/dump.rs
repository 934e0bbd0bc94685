//! Top-level dump state machine.
//!
//! ```text
//! Created -> RemoteOpened -> BlocksQueried | Ready -> Copying -> Done
//! ```
//!
//! Any step may move the machine to `Failed`.  [`DumpOrchestrator::cleanup`]
//! is reachable from every state, is idempotent, and leaves it `Closed`.

use std::sync::Arc;

use log::{error, info, warn};

use crate::{
    cbt::{ConnParams, DiskParams},
    changemap::ChangeMap,
    copy::{CopyEngine, ShortTransferPolicy},
    descriptor::{session_identity, ConnectionDescriptor},
    disklib::{CreateParams, DiskLib, LibraryVersion, TransportMode},
    error::{Error, Result},
    library::LibraryRegistry,
    lifecycle::{ConnectionLifecycle, RetryPolicy},
    metadata::{MetadataEntry, MetadataReplicator},
    progress::{CancelToken, DiskProgress, TransferStats},
    scan::BlockScanner,
    session::DiskSession,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Discover changed blocks only.
    BlocksOnly,
    Backup,
    Clone,
    /// Write a previous backup's changed areas back to the remote disk.
    Restore,
}

impl DumpMode {
    fn needs_scan(self) -> bool {
        self != DumpMode::Restore
    }

    fn copies(self) -> bool {
        self != DumpMode::BlocksOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Created,
    RemoteOpened,
    BlocksQueried,
    Ready,
    Copying,
    Done,
    Failed,
    Closed,
}

/// The file-backed disk on this side of the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDisk {
    pub path: String,
    /// Create the disk, sized like the remote one, before opening it.
    pub create: bool,
}

#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub mode: DumpMode,
    pub version: LibraryVersion,
    pub conn: ConnParams,
    pub disk: DiskParams,
    /// Required for every mode except `BlocksOnly`.
    pub local: Option<LocalDisk>,
    pub transport: TransportMode,
    pub identity: String,
    pub prepare_retry: RetryPolicy,
    pub end_access_retry: RetryPolicy,
    pub short_transfer: ShortTransferPolicy,
}

impl DumpConfig {
    pub fn new(mode: DumpMode, conn: ConnParams, disk: DiskParams) -> Self {
        Self {
            mode,
            version: LibraryVersion::default(),
            conn,
            disk,
            local: None,
            transport: TransportMode::default(),
            identity: session_identity(),
            prepare_retry: RetryPolicy::prepare(),
            end_access_retry: RetryPolicy::end_access(),
            short_transfer: ShortTransferPolicy::default(),
        }
    }

    fn validate(&self, supplied: Option<&ChangeMap>) -> Result<()> {
        if self.disk.remote_path().is_empty() {
            return Err(Error::Connection("no remote disk path".to_string()));
        }
        if !self.conn.vm_mo_ref.is_empty() && self.conn.host.is_empty() {
            return Err(Error::Connection(format!(
                "VM {} given without a host",
                self.conn.vm_mo_ref
            )));
        }
        if self.mode.copies() && self.local.as_ref().is_none_or(|l| l.path.is_empty()) {
            return Err(Error::Connection(format!(
                "{:?} needs a local disk",
                self.mode
            )));
        }
        if self.mode == DumpMode::Restore {
            match supplied {
                Some(map) => map.validate()?,
                None => {
                    return Err(Error::Connection(
                        "restore needs the change map of a previous backup".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub mode: DumpMode,
    pub change_map: ChangeMap,
    pub metadata_entries: usize,
    pub stats: TransferStats,
}

/// Drives one dump from connection to cleanup.
///
/// Each session is owned exclusively by the orchestrator; `remote` and
/// `local` are assigned as source or destination depending on the mode.
pub struct DumpOrchestrator<'r, L: DiskLib> {
    lib: Arc<L>,
    registry: &'r LibraryRegistry,
    config: DumpConfig,
    state: DumpState,
    descriptor: ConnectionDescriptor,
    remote: Option<DiskSession<L>>,
    local: Option<DiskSession<L>>,
    change_map: Option<ChangeMap>,
    library_acquired: bool,
    access_prepared: bool,
    progress: Arc<DiskProgress>,
    cancel: CancelToken,
}

impl<'r, L: DiskLib> DumpOrchestrator<'r, L> {
    pub fn new(lib: Arc<L>, registry: &'r LibraryRegistry, config: DumpConfig) -> Self {
        let descriptor = ConnectionDescriptor::remote(
            &config.conn,
            &config.disk,
            &config.identity,
            config.mode,
            config.transport,
        );
        Self {
            lib,
            registry,
            config,
            state: DumpState::Created,
            descriptor,
            remote: None,
            local: None,
            change_map: None,
            library_acquired: false,
            access_prepared: false,
            progress: DiskProgress::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> DumpState {
        self.state
    }

    pub fn mode(&self) -> DumpMode {
        self.config.mode
    }

    pub fn progress(&self) -> Arc<DiskProgress> {
        self.progress.clone()
    }

    /// A token that stops the scan or copy at the next chunk boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs every step for the configured mode, then cleans up whatever
    /// the outcome.  `supplied` is the change map of an earlier backup and
    /// is used (and required) only by `Restore`.
    pub fn run(&mut self, supplied: Option<ChangeMap>) -> Result<DumpReport> {
        info!("Starting {:?} of {}", self.config.mode, self.descriptor.path);
        let result = self.execute(supplied);
        if let Err(e) = &result {
            error!("{}", e);
        }
        if let Err(e) = self.cleanup() {
            warn!("Cleanup after {:?} dump failed: {}", self.config.mode, e);
        }
        result
    }

    fn execute(&mut self, supplied: Option<ChangeMap>) -> Result<DumpReport> {
        self.step(|d| d.config.validate(supplied.as_ref()))?;
        self.step(|d| d.prepare_for_access())?;
        self.step(|d| d.open_remote_disk())?;

        let mode = self.config.mode;
        if mode.needs_scan() {
            self.step(|d| d.query_allocated_blocks())?;
        } else if let Some(map) = supplied {
            self.step(|d| d.use_change_map(map))?;
        }

        if !mode.copies() {
            self.state = DumpState::Done;
            return Ok(self.report(0, TransferStats::default()));
        }

        self.step(|d| d.open_local_disk())?;
        let entries = self.step(|d| d.replicate_metadata())?;
        let stats = self.step(|d| d.copy())?;
        self.state = DumpState::Done;
        info!("{:?} done", mode);
        Ok(self.report(entries, stats))
    }

    /// Runs one step; a failure moves the machine to `Failed` and is
    /// wrapped with the mode and the state it happened in.
    fn step<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let at = self.state;
        f(self).map_err(|source| {
            self.state = DumpState::Failed;
            Error::Dump {
                mode: self.config.mode,
                state: at,
                source: Box::new(source),
            }
        })
    }

    fn report(&self, metadata_entries: usize, stats: TransferStats) -> DumpReport {
        DumpReport {
            mode: self.config.mode,
            change_map: self.change_map.clone().unwrap_or_default(),
            metadata_entries,
            stats,
        }
    }

    fn expect_state(&self, op: &'static str, allowed: &[DumpState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Initialises the library and, for a VM behind a management server,
    /// performs the prepare-for-access handshake.
    pub fn prepare_for_access(&mut self) -> Result<()> {
        self.expect_state("prepare for access", &[DumpState::Created])?;
        if !self.library_acquired {
            self.registry.acquire(&*self.lib, &self.config.version)?;
            self.library_acquired = true;
        }
        if self.descriptor.targets_vm() && !self.access_prepared {
            self.lifecycle()
                .prepare_for_access(&self.descriptor)?;
            self.access_prepared = true;
        }
        Ok(())
    }

    fn lifecycle(&self) -> ConnectionLifecycle<'_, L> {
        ConnectionLifecycle::with_policies(
            &*self.lib,
            self.config.prepare_retry,
            self.config.end_access_retry,
        )
    }

    pub fn open_remote_disk(&mut self) -> Result<()> {
        self.expect_state("open remote disk", &[DumpState::Created])?;
        if !self.library_acquired {
            return Err(Error::InvalidState {
                op: "open remote disk before prepare",
                state: self.state,
            });
        }
        let session = DiskSession::open(self.lib.clone(), self.descriptor.clone())?;
        self.progress.set_capacity(session.capacity());
        self.remote = Some(session);
        self.state = DumpState::RemoteOpened;
        Ok(())
    }

    /// Every metadata entry of the opened remote disk.
    pub fn remote_metadata(&self) -> Result<Vec<MetadataEntry>> {
        self.expect_state("read remote metadata", &[DumpState::RemoteOpened])?;
        let remote = self.remote.as_ref().ok_or(Error::InvalidHandle)?;
        MetadataReplicator::read_all(remote)
    }

    pub fn query_allocated_blocks(&mut self) -> Result<()> {
        self.expect_state("query allocated blocks", &[DumpState::RemoteOpened])?;
        let remote = self.remote.as_ref().ok_or(Error::InvalidHandle)?;
        let map = BlockScanner::new()
            .with_progress(self.progress.clone())
            .with_cancel(self.cancel.clone())
            .scan(remote)?;
        self.progress.set_estimate(map.estimate());
        self.change_map = Some(map);
        self.state = DumpState::BlocksQueried;
        Ok(())
    }

    /// Takes a change map produced elsewhere, for a restore target that
    /// has no change tracking of its own.
    pub fn use_change_map(&mut self, map: ChangeMap) -> Result<()> {
        self.expect_state("use change map", &[DumpState::RemoteOpened])?;
        map.validate()?;
        let capacity = self.progress.capacity();
        let fits = map
            .start_offset
            .checked_add(map.length)
            .is_some_and(|end| end <= capacity);
        if !fits {
            return Err(Error::InvalidExtent {
                start: map.start_offset,
                length: map.length,
                limit: capacity,
            });
        }
        self.progress.set_estimate(map.estimate());
        self.change_map = Some(map);
        self.state = DumpState::Ready;
        Ok(())
    }

    /// Opens the local disk: read-only as the source of a restore,
    /// writable (created first if asked) as the destination otherwise.
    pub fn open_local_disk(&mut self) -> Result<()> {
        self.expect_state(
            "open local disk",
            &[DumpState::BlocksQueried, DumpState::Ready],
        )?;
        let local = self
            .config
            .local
            .clone()
            .ok_or_else(|| Error::Connection("no local disk".to_string()))?;
        let restoring = self.config.mode == DumpMode::Restore;
        let descriptor = ConnectionDescriptor::local(&local.path, restoring);

        let session = if local.create && !restoring {
            let capacity = self.progress.capacity();
            DiskSession::create(self.lib.clone(), descriptor, &CreateParams::flat(capacity))?
        } else {
            DiskSession::open(self.lib.clone(), descriptor)?
        };
        if session.capacity() < self.progress.capacity() {
            warn!(
                "Local disk {} is smaller than the remote disk ({} < {})",
                session.descriptor().path,
                session.capacity(),
                self.progress.capacity()
            );
        }
        self.local = Some(session);
        Ok(())
    }

    fn sides(&self) -> Result<(&DiskSession<L>, &DiskSession<L>)> {
        let remote = self.remote.as_ref().ok_or(Error::InvalidHandle)?;
        let local = self.local.as_ref().ok_or(Error::InvalidHandle)?;
        Ok(match self.config.mode {
            DumpMode::Restore => (local, remote),
            _ => (remote, local),
        })
    }

    pub fn replicate_metadata(&mut self) -> Result<usize> {
        self.expect_state(
            "replicate metadata",
            &[DumpState::BlocksQueried, DumpState::Ready],
        )?;
        self.state = DumpState::Copying;
        let (source, destination) = self.sides()?;
        MetadataReplicator::replicate(source, destination)
    }

    pub fn copy(&mut self) -> Result<TransferStats> {
        self.expect_state("copy", &[DumpState::Copying])?;
        let map = self.change_map.as_ref().ok_or(Error::InvalidHandle)?;
        let (source, destination) = self.sides()?;
        CopyEngine::new(self.config.short_transfer)
            .with_progress(self.progress.clone())
            .with_cancel(self.cancel.clone())
            .copy(map, source, destination)
    }

    /// Closes both sessions, ends access and releases the library.  Safe
    /// to call from any state and any number of times; every release is
    /// attempted and the first failure returned.
    pub fn cleanup(&mut self) -> Result<()> {
        let mut first: Option<Error> = None;

        for (name, session) in [("remote", self.remote.take()), ("local", self.local.take())] {
            if let Some(mut s) = session {
                if let Err(e) = s.close() {
                    warn!("Closing {} disk failed: {}", name, e);
                    first.get_or_insert(Error::Io {
                        op: "close",
                        offset: 0,
                        source: e,
                    });
                }
            }
        }

        if self.access_prepared {
            self.access_prepared = false;
            if let Err(e) = self.lifecycle().end_access(&self.descriptor) {
                first.get_or_insert(e);
            }
        }

        if self.library_acquired {
            self.library_acquired = false;
            self.registry.release(&*self.lib);
        }

        if self.state != DumpState::Closed {
            info!("Cleanup from {:?}", self.state);
        }
        self.state = DumpState::Closed;
        first.map_or(Ok(()), Err)
    }
}

impl<'r, L: DiskLib> Drop for DumpOrchestrator<'r, L> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Cleanup on drop failed: {}", e);
        }
    }
}
