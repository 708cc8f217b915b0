#![allow(dead_code)]

//! Shared helpers for bridge integration tests.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, OnceLock};

use hostbridge_v8::{ExecutionContext, HostEnv, Response};

/// Host environment for tests: tracks every buffer it hands out and every
/// wrapper pointer it is asked to release.
#[derive(Default)]
pub struct TestHost {
    /// Live host-owned buffers, ptr → length in code units.
    buffers: Mutex<HashMap<usize, usize>>,
    /// Every pointer passed to `free_memory`, in order.
    freed_buffers: Mutex<Vec<usize>>,
    /// Every pointer passed to `free_handle`, in order.
    freed_handles: Mutex<Vec<usize>>,
    pub fatal_errors: Mutex<Vec<String>>,
    pub log_lines: Mutex<Vec<String>>,
}

impl TestHost {
    pub fn freed_handle_count(&self, ptr: *mut c_void) -> usize {
        self.freed_handles
            .lock()
            .unwrap()
            .iter()
            .filter(|&&p| p == ptr as usize)
            .count()
    }

    pub fn buffer_live(&self, ptr: *mut u16) -> bool {
        self.buffers.lock().unwrap().contains_key(&(ptr as usize))
    }

    pub fn buffer_freed(&self, ptr: *mut u16) -> bool {
        self.freed_buffers.lock().unwrap().contains(&(ptr as usize))
    }
}

impl HostEnv for TestHost {
    fn allocate_memory(&self, byte_count: usize) -> *mut u16 {
        let units = byte_count / 2;
        let buffer = vec![0u16; units].into_boxed_slice();
        let ptr = Box::into_raw(buffer) as *mut u16;
        self.buffers.lock().unwrap().insert(ptr as usize, units);
        ptr
    }

    fn free_memory(&self, ptr: *mut u16) {
        let units = self.buffers.lock().unwrap().remove(&(ptr as usize));
        self.freed_buffers.lock().unwrap().push(ptr as usize);
        if let Some(units) = units {
            let slice = std::ptr::slice_from_raw_parts_mut(ptr, units);
            drop(unsafe { Box::from_raw(slice) });
        }
    }

    fn free_handle(&self, host_ptr: *mut c_void) {
        self.freed_handles.lock().unwrap().push(host_ptr as usize);
    }

    fn log(&self, message: &str) {
        self.log_lines.lock().unwrap().push(message.to_string());
    }

    fn fatal_error(&self, location: &str, message: &str) {
        self.fatal_errors
            .lock()
            .unwrap()
            .push(format!("{location}: {message}"));
    }
}

/// The process-wide host shared by every test in this binary.
pub fn test_host() -> &'static Arc<TestHost> {
    static HOST: OnceLock<Arc<TestHost>> = OnceLock::new();
    HOST.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(TestHost::default())
    })
}

pub fn new_context() -> ExecutionContext {
    let host: Arc<dyn HostEnv> = Arc::clone(test_host()) as Arc<dyn HostEnv>;
    ExecutionContext::initialize(None, host).expect("context initialization")
}

/// Decode a string response immediately (scratch transports are only valid
/// until the next operation).
pub fn string_of(response: &Response) -> String {
    match response {
        Response::String(s) => s.to_string_lossy(),
        other => panic!("expected a string response, got {other:?}"),
    }
}

pub fn error_of(response: &Response) -> String {
    match response {
        Response::Error(s) => s.to_string_lossy(),
        other => panic!("expected an error response, got {other:?}"),
    }
}

pub fn number_of(response: &Response) -> f64 {
    match response {
        Response::Number(n) => *n,
        other => panic!("expected a number response, got {other:?}"),
    }
}
