//! Host pointers embedded as opaque engine values.
//!
//! A wrapper is an ordinary engine object carrying a `v8::External` under a
//! symbol-keyed slot. Script sees an opaque object (the symbol is never
//! exported), while marshaling and the GC sweep can recognize wrappers and
//! recover the payload.

use std::ffi::c_void;

/// Embed `host_ptr` as an opaque engine object, branded with `marker`.
pub(crate) fn wrap<'s>(
    scope: &v8::PinScope<'s, '_>,
    marker: v8::Local<'s, v8::Symbol>,
    host_ptr: *mut c_void,
) -> v8::Local<'s, v8::Object> {
    let external = v8::External::new(scope, host_ptr);
    let wrapper = v8::Object::new(scope);
    wrapper.set(scope, marker.into(), external.into());
    wrapper
}

/// Recover the host pointer from a wrapper created by [`wrap`].
///
/// Returns `None` for every value that is not one of ours.
pub(crate) fn unwrap<'s>(
    scope: &v8::PinScope<'s, '_>,
    marker: v8::Local<'s, v8::Symbol>,
    value: v8::Local<'s, v8::Value>,
) -> Option<*mut c_void> {
    let wrapper = v8::Local::<v8::Object>::try_from(value).ok()?;
    let payload = wrapper.get(scope, marker.into())?;
    let external = v8::Local::<v8::External>::try_from(payload).ok()?;
    Some(external.value())
}
