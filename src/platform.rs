//! Global V8 platform and host environment initialization.
//!
//! V8 can only be initialized once per process. This module provides the
//! single entry point for platform initialization used by every execution
//! context, plus the host environment singleton installed alongside it.
//! Neither is ever torn down; per-context disposal does not touch them.

use std::sync::{Arc, OnceLock};

use crate::host::HostEnv;

static PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();
static HOST: OnceLock<Arc<dyn HostEnv>> = OnceLock::new();

/// Install the host environment and bootstrap the engine platform.
///
/// The first call wins; subsequent calls (one per additional context) are
/// no-ops. Safe to call from multiple threads.
pub fn init(host: Arc<dyn HostEnv>) {
    let _ = HOST.set(host);
    get_platform();
}

/// Get the global V8 platform, initializing it if necessary.
pub fn get_platform() -> &'static v8::SharedRef<v8::Platform> {
    PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        log::info!("V8 platform initialized");
        platform
    })
}

/// The host environment installed by the first [`init`] call.
///
/// # Panics
///
/// Calling any bridge operation before a context has been initialized is a
/// programmer error; this is where it surfaces.
pub fn host() -> &'static Arc<dyn HostEnv> {
    HOST.get()
        .expect("host environment not installed; initialize a context first")
}
