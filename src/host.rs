//! The host collaborator contract.
//!
//! The managed host supplies one [`HostEnv`] at startup. The bridge calls out
//! to it for the few things it must never do itself: allocating buffers that
//! outlive a call, releasing host objects that were wrapped into the engine,
//! and reporting diagnostics.

use std::ffi::c_void;

/// Callbacks supplied by the managed host.
///
/// Installed once, process-wide, by the first context initialization and never
/// replaced (see [`crate::platform`]).
pub trait HostEnv: Send + Sync + 'static {
    /// Allocate `byte_count` bytes of host-owned memory.
    ///
    /// Used for oversized string transports and error messages crossing the
    /// boundary. The returned buffer is written as NUL-terminated UTF-16 code
    /// units; ownership transfers to the host, which must reclaim it with
    /// [`free_memory`](HostEnv::free_memory).
    fn allocate_memory(&self, byte_count: usize) -> *mut u16;

    /// Release a buffer previously handed out by
    /// [`allocate_memory`](HostEnv::allocate_memory).
    fn free_memory(&self, ptr: *mut u16);

    /// Release a host object that was wrapped into the engine.
    ///
    /// Invoked exactly once per wrapper, either on a forced release or once
    /// the engine value became unreachable. The bridge never frees host
    /// memory itself.
    fn free_handle(&self, host_ptr: *mut c_void);

    /// Diagnostics sink for non-fatal messages.
    fn log(&self, message: &str);

    /// Unrecoverable engine failure. Reported, never retried.
    fn fatal_error(&self, location: &str, message: &str);
}

/// Opaque inspector message transport.
///
/// The inspector protocol itself is an external collaborator; the bridge only
/// delivers messages into it.
pub trait DebugChannel {
    fn send_message(&mut self, message: &str);
}
