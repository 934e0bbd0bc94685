//! Turns SIGINT and SIGTERM into a cancelled [`CancelToken`].
//!
//! The first signal only trips the token, so the running scan or copy stops
//! at its next chunk and the dump still ends access and releases its
//! handles.  The handler then restores the default disposition: a second
//! signal terminates the process.

use std::{ffi::c_int, sync::OnceLock};

use log::{debug, warn};

use crate::progress::CancelToken;

const SIGINT: c_int = 2;
const SIGTERM: c_int = 15;

const SIG_DFL: usize = 0;
const SIG_ERR: usize = usize::MAX;

static TOKEN: OnceLock<CancelToken> = OnceLock::new();

extern "C" {
    fn signal(signum: c_int, handler: usize) -> usize;
}

extern "C" fn on_signal(signum: c_int) {
    // Only async-signal-safe work here: an atomic store and signal(2).
    if let Some(token) = TOKEN.get() {
        token.cancel();
    }
    unsafe {
        signal(signum, SIG_DFL);
    }
}

/// Routes both signals to `token`.  Only the first call per process takes
/// effect; later calls return `false`.
pub(crate) fn install(token: CancelToken) -> bool {
    if TOKEN.set(token).is_err() {
        debug!("Interrupt handler already installed");
        return false;
    }
    let handler = on_signal as extern "C" fn(c_int) as usize;
    for signum in [SIGINT, SIGTERM] {
        if unsafe { signal(signum, handler) } == SIG_ERR {
            warn!("Cannot handle signal {}, it will end the process", signum);
        }
    }
    true
}
