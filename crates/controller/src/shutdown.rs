//! Signal-triggered cooperative shutdown.
//!
//! The handlers only flip a process-wide flag; the poll loop notices it at
//! its next iteration boundary. No daemon state is ever touched from
//! signal context.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM to the stop flag.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

pub fn requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}
