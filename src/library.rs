//! Process-wide lifetime of the native disk library.
//!
//! The library may be initialised only once per process, from one thread
//! at a time, and must not be initialised again after it has exited.
//! [`LibraryRegistry`] reference-counts its users under a mutex: the first
//! acquire initialises, the last release exits.

use std::sync::{Mutex, PoisonError};

use log::{debug, info};

use crate::{
    disklib::{DiskLib, LibraryVersion},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LibraryState {
    Uninitialized,
    Active { refs: usize },
    Exited,
}

pub struct LibraryRegistry {
    state: Mutex<LibraryState>,
}

static GLOBAL: LibraryRegistry = LibraryRegistry::new();

impl LibraryRegistry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(LibraryState::Uninitialized),
        }
    }

    /// The registry guarding the one real library of this process.
    pub fn global() -> &'static LibraryRegistry {
        &GLOBAL
    }

    pub fn acquire<L: DiskLib>(&self, lib: &L, version: &LibraryVersion) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            LibraryState::Uninitialized => {
                lib.init(version).map_err(Error::LibraryInit)?;
                info!(
                    "Disk library {}.{} initialised",
                    version.major, version.minor
                );
                *state = LibraryState::Active { refs: 1 };
            }
            LibraryState::Active { refs } => {
                *state = LibraryState::Active { refs: refs + 1 };
            }
            LibraryState::Exited => return Err(Error::LibraryExited),
        }
        debug!("Library state: {:?}", *state);
        Ok(())
    }

    /// Drops one reference; the last one shuts the library down.  Releasing
    /// more often than acquiring is ignored.
    pub fn release<L: DiskLib>(&self, lib: &L) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            LibraryState::Active { refs } if refs > 1 => {
                *state = LibraryState::Active { refs: refs - 1 };
            }
            LibraryState::Active { .. } => {
                lib.exit();
                info!("Disk library shut down");
                *state = LibraryState::Exited;
            }
            LibraryState::Uninitialized | LibraryState::Exited => {}
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
