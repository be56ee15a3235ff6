//! Best-effort reclamation of a port held by a stale server process.
//!
//! There is no portable way to ask "which process owns this socket", so each
//! platform shells out to its native tooling. Failure to identify or kill
//! the occupier is reported to the caller but never fatal; the subsequent
//! spawn surfaces the real error if the port is still taken.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::kill_listener;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::kill_listener;
