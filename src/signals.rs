//! Process-wide cancellation. SIGINT/SIGTERM only raise a flag; the mutation
//! loop notices it, kills the running test, restores the file and stops.

use std::sync::atomic::{AtomicBool, Ordering};

static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Exit code for a run stopped by a signal (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

pub fn cancel_flag() -> &'static AtomicBool {
    &CANCELLED
}

pub fn is_cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    // only async-signal-safe work here
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Install the handlers. Safe to call more than once.
#[cfg(unix)]
pub fn install() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install() {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn sigterm_sets_the_flag() {
        install();
        CANCELLED.store(false, Ordering::SeqCst);
        // SAFETY: raising a signal we just installed a handler for.
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert!(is_cancelled());
        CANCELLED.store(false, Ordering::SeqCst);
    }
}
