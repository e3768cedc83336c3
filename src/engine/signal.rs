//! SIGUSR1-driven cooperative cancellation. Grounded
//! on the original's signal-handler pattern: the handler itself only
//! sets a flag (async-signal-safe), `SIGUSR1` is blocked for the whole
//! thread except during the `pselect` wait, and `stop()` sets `stopping`
//! before raising the signal so the woken worker can tell "cancelled"
//! apart from "spuriously interrupted".

use std::sync::atomic::{AtomicBool, Ordering};

/// Set by the installed handler; the worker clears it after observing a
/// wakeup. `'static` since `sigaction` requires a function pointer, not a
/// closure capturing state.
static SIGNALED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigusr1(_signum: libc::c_int) {
    SIGNALED.store(true, Ordering::SeqCst);
}

/// Installs the handler and returns the *empty* signal mask to hand to
/// `pselect` (so `SIGUSR1`, blocked for the thread at large, is
/// atomically unblocked only for the duration of the wait).
pub fn install() -> libc::sigset_t {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigusr1 as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());

        let mut block_set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut block_set);
        libc::sigaddset(&mut block_set, libc::SIGUSR1);
        libc::pthread_sigmask(libc::SIG_BLOCK, &block_set, std::ptr::null_mut());

        let mut empty_set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty_set);
        empty_set
    }
}

/// True if `SIGUSR1` has arrived since the last call to `clear`.
pub fn was_signaled() -> bool {
    SIGNALED.load(Ordering::SeqCst)
}

pub fn clear() {
    SIGNALED.store(false, Ordering::SeqCst);
}

/// Sends `SIGUSR1` to the given thread, waking a blocked `pselect`.
pub fn wake(thread: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(thread, libc::SIGUSR1);
    }
}
