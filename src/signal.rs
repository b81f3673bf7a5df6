//! Signal-to-flag registration
//!
//! Both roles poll flags instead of running logic in handlers: the daemon's
//! accept loop turns SIGTERM/SIGINT into a child-group kill, and the session
//! driver turns SIGTERM into a kill byte before exiting.

use libc::c_int;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Register a single signal onto `flag`
pub fn register(signal: c_int, flag: &Arc<AtomicBool>) -> io::Result<()> {
    signal_hook::flag::register(signal, Arc::clone(flag))?;
    Ok(())
}

/// Register SIGTERM and SIGINT onto `flag` (daemon shutdown path)
pub fn register_shutdown_flag(flag: &Arc<AtomicBool>) -> io::Result<()> {
    register(SIGTERM, flag)?;
    register(SIGINT, flag)?;
    Ok(())
}

/// Flag that flips when the process receives SIGTERM
pub fn sigterm_flag() -> io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    register(SIGTERM, &flag)?;
    Ok(flag)
}
