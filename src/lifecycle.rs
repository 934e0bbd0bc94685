//! The prepare/end access handshake around a backup window.
//!
//! Both directions are flaky over the network and are retried a bounded
//! number of times.  Teardown gets more attempts: it also runs during
//! failure recovery, where giving up leaks a server-side lock.

use std::{thread, time::Duration};

use log::{info, warn};

use crate::{
    descriptor::ConnectionDescriptor,
    disklib::{codes, DiskLib},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn prepare() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
        }
    }

    pub fn end_access() -> Self {
        Self {
            attempts: 30,
            delay: Duration::from_secs(2),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

pub struct ConnectionLifecycle<'a, L: DiskLib> {
    lib: &'a L,
    prepare: RetryPolicy,
    end: RetryPolicy,
}

impl<'a, L: DiskLib> ConnectionLifecycle<'a, L> {
    pub fn with_policies(lib: &'a L, prepare: RetryPolicy, end: RetryPolicy) -> Self {
        Self { lib, prepare, end }
    }

    /// Each failed attempt is followed by a best-effort end access, so the
    /// next attempt never starts from a half-prepared session.
    pub fn prepare_for_access(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.lib.prepare_for_access(descriptor) {
                Ok(()) => {
                    info!("Prepared {} for access", descriptor.vm_mo_ref);
                    return Ok(());
                }
                Err(e) => e,
            };
            warn!(
                "Prepare for access attempt {}/{} failed: {}",
                attempt, self.prepare.attempts, err
            );
            if err.code() == codes::VIX_E_OBJECT_IS_BUSY {
                info!("{} is held by another session", descriptor.vm_mo_ref);
            }
            if let Err(e) = self.lib.end_access(descriptor) {
                warn!("Compensating end access failed: {}", e);
            }
            if attempt >= self.prepare.attempts {
                return Err(Error::PrepareFailed {
                    attempts: attempt,
                    source: err,
                });
            }
            thread::sleep(self.prepare.delay);
        }
    }

    /// On success also runs the library's lock cleanup, whose failure is
    /// only logged.
    pub fn end_access(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.lib.end_access(descriptor) {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "End access attempt {}/{} failed: {}",
                        attempt, self.end.attempts, e
                    );
                    if attempt >= self.end.attempts {
                        return Err(Error::EndAccessFailed {
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }
            thread::sleep(self.end.delay);
        }
        info!("Ended access to {}", descriptor.vm_mo_ref);

        match self.lib.cleanup(descriptor) {
            Ok(counts) => info!(
                "Library cleanup: {} cleaned, {} remaining",
                counts.cleaned, counts.remaining
            ),
            Err(e) => warn!("Library cleanup failed: {}", e),
        }
        Ok(())
    }
}
