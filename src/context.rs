//! The execution context: one isolate, one engine context, and every boundary
//! operation the host can issue against them.
//!
//! Each operation enters a fresh handle scope, performs the engine work,
//! captures the pending exception if one was raised, and marshals the outcome
//! into a single [`Response`]. Nothing engine-internal escapes raw.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr};
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;

use crate::dispatch::{self, DispatchTable};
use crate::error::BridgeError;
use crate::external;
use crate::handle::{HandleArena, HandleId, HandleKind, SweepQueue};
use crate::host::{DebugChannel, HostEnv};
use crate::platform;
use crate::response::{HandleRef, Response, Scratch, TransportString, SCRATCH_CAPACITY};

/// Tri-state property attribute: unset attributes leave engine defaults
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropertyFlag {
    #[default]
    NotSet,
    False,
    True,
}

/// Attribute triple for [`ExecutionContext::define_property`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyAttributes {
    pub configurable: PropertyFlag,
    pub enumerable: PropertyFlag,
    pub writable: PropertyFlag,
}

/// Unwrap a `Result<_, BridgeError>`, turning the failure into an Error
/// response right where it was detected.
macro_rules! expect {
    ($state:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => return $state.bridge_error(&err),
        }
    };
}

/// Marshal the pending exception out of a `TryCatch`. Must run immediately
/// after the failing engine call, before any other engine operation.
macro_rules! catch_response {
    ($state:expr, $tc:expr) => {{
        match $tc.exception() {
            None => $state.error_response("No error specified"),
            Some(exception) => {
                // Prefer the exception's `.stack` rendering; fall back to its
                // own string conversion.
                let rendered = $tc
                    .stack_trace()
                    .unwrap_or(exception)
                    .to_string($tc)
                    .map(|s| s.to_rust_string_lossy($tc));
                match rendered {
                    Some(text) => $state.bridge_error(&BridgeError::EngineException(text)),
                    None => $state.error_response("No error specified"),
                }
            }
        }
    }};
}

/// Shared context state, reachable both from [`ExecutionContext`] methods and
/// from the dispatch trampoline (through the engine context's slot).
pub(crate) struct ContextState {
    pub(crate) context: v8::Global<v8::Context>,
    pub(crate) global: v8::Global<v8::Object>,
    undefined: v8::Global<v8::Primitive>,
    null: v8::Global<v8::Primitive>,
    wrap_marker: v8::Global<v8::Symbol>,
    pub(crate) handles: RefCell<HandleArena>,
    pub(crate) dispatch: RefCell<DispatchTable>,
    scratch: RefCell<Scratch>,
    sweep: Arc<SweepQueue>,
    pub(crate) host: Arc<dyn HostEnv>,
}

impl ContextState {
    /// Map an engine value onto the transport tag set, allocating a handle for
    /// anything that is not a primitive.
    pub(crate) fn from_value<'s>(
        &self,
        scope: &v8::PinScope<'s, '_>,
        value: v8::Local<'s, v8::Value>,
    ) -> Response {
        if value.is_undefined() {
            return Response::Undefined;
        }
        if value.is_null() {
            return Response::Null;
        }
        if value.is_boolean() {
            return Response::Boolean(value.is_true());
        }
        if value.is_number() {
            return match value.number_value(scope) {
                Some(number) => Response::Number(number),
                None => self.error_response("Number conversion failed"),
            };
        }
        if value.is_string() {
            return match value.to_string(scope) {
                Some(string) => self.string_value(scope, string),
                None => self.error_response("String conversion failed"),
            };
        }

        // Objects, functions, symbols and wrapped externals live on as
        // handles. Re-encountering a wrapper reports its host pointer but
        // does not take ownership of it: the wrapper's owner is the handle
        // created by `wrap`, and only that slot owes a release.
        let marker = v8::Local::new(scope, &self.wrap_marker);
        let host_ptr = external::unwrap(scope, marker, value);
        let kind = match host_ptr {
            Some(_) => HandleKind::Wrapped,
            None => HandleKind::Plain,
        };
        let global = v8::Global::new(scope.as_ref(), value);
        let id = self.handles.borrow_mut().insert(global, kind, None);
        Response::Handle(HandleRef { id, kind, host_ptr })
    }

    /// Re-encode a response as an engine value; the inverse of
    /// [`from_value`](ContextState::from_value) for everything but errors.
    pub(crate) fn to_engine_value<'s>(
        &self,
        scope: &v8::PinScope<'s, '_>,
        response: &Response,
    ) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
        match response {
            Response::Undefined => Ok(v8::undefined(scope).into()),
            Response::Null => Ok(v8::null(scope).into()),
            Response::Boolean(value) => Ok(v8::Boolean::new(scope, *value).into()),
            Response::Number(value) => Ok(v8::Number::new(scope, *value).into()),
            Response::Integer(value) => Ok(v8::Number::new(scope, *value as f64).into()),
            Response::String(string) => v8::String::new_from_two_byte(
                scope,
                string.code_units(),
                v8::NewStringType::Normal,
            )
            .map(Into::into)
            .ok_or(BridgeError::Marshal("String allocation failed")),
            Response::Handle(handle) => self.local_value(scope, handle.id),
            Response::Error(_) => Err(BridgeError::Marshal(
                "Error responses do not marshal back into engine values",
            )),
        }
    }

    /// Resolve a handle id to the engine value it keeps alive.
    pub(crate) fn local_value<'s>(
        &self,
        scope: &v8::PinScope<'s, '_>,
        id: HandleId,
    ) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
        let handles = self.handles.borrow();
        let global = handles.value(id)?;
        Ok(v8::Local::new(scope, global))
    }

    fn string_value<'s>(
        &self,
        scope: &v8::PinScope<'s, '_>,
        string: v8::Local<'s, v8::String>,
    ) -> Response {
        let text = string.to_rust_string_lossy(scope);
        let units: Vec<u16> = text.encode_utf16().collect();
        Response::String(self.transport(&units))
    }

    /// Encode code units into the scratch buffer or, at the threshold, into
    /// host-allocated memory the host must release.
    fn transport(&self, units: &[u16]) -> TransportString {
        if units.len() < SCRATCH_CAPACITY {
            return self.scratch.borrow_mut().fill(units);
        }
        let ptr = self.host.allocate_memory((units.len() + 1) * 2);
        unsafe {
            std::ptr::copy_nonoverlapping(units.as_ptr(), ptr, units.len());
            *ptr.add(units.len()) = 0;
        }
        TransportString::HostOwned {
            ptr,
            len: units.len(),
        }
    }

    /// Synthesize an Error response without consulting engine exception state.
    pub(crate) fn error_response(&self, message: &str) -> Response {
        let units: Vec<u16> = message.encode_utf16().collect();
        Response::Error(self.transport(&units))
    }

    pub(crate) fn bridge_error(&self, err: &BridgeError) -> Response {
        self.error_response(&err.to_string())
    }

    /// Release one handle slot. Slots that own a wrapper either surrender
    /// their host pointer now (`force`) or are downgraded to a weak reference
    /// whose finalizer schedules the release; every other slot is simply
    /// deleted.
    fn release_slot(
        &self,
        scope: &v8::PinScope<'_, '_>,
        id: HandleId,
        force: bool,
    ) -> Result<(), BridgeError> {
        let owned_ptr = self.handles.borrow().host_ptr(id)?;
        match owned_ptr {
            None => {
                self.handles.borrow_mut().remove(id)?;
            }
            Some(ptr) if force => {
                self.handles.borrow_mut().remove(id)?;
                self.host.free_handle(ptr);
            }
            Some(_) => {
                let weak = {
                    let handles = self.handles.borrow();
                    let global = handles.value(id)?;
                    let local = v8::Local::new(scope, global);
                    let sweep = Arc::clone(&self.sweep);
                    v8::Weak::with_finalizer(
                        scope.as_ref(),
                        local,
                        Box::new(move |_isolate| sweep.enqueue(id)),
                    )
                };
                self.handles.borrow_mut().downgrade(id, weak)?;
            }
        }
        Ok(())
    }

    /// Drain the sweep queue, releasing each finalized wrapper exactly once.
    fn sweep_pending(&self) -> usize {
        let pending = self.sweep.drain();
        if pending.is_empty() {
            return 0;
        }
        let mut reclaimed = Vec::new();
        {
            let mut handles = self.handles.borrow_mut();
            for id in pending {
                // An id may already be gone if disposal raced the finalizer;
                // removal failing means nothing is owed.
                if let Ok(slot) = handles.remove(id) {
                    if let Some(ptr) = slot.host_ptr {
                        reclaimed.push(ptr);
                    }
                }
            }
        }
        let count = reclaimed.len();
        for ptr in reclaimed {
            self.host.free_handle(ptr);
        }
        count
    }
}

fn as_object<'s>(
    value: v8::Local<'s, v8::Value>,
    message: &'static str,
) -> Result<v8::Local<'s, v8::Object>, BridgeError> {
    v8::Local::<v8::Object>::try_from(value).map_err(|_| BridgeError::Marshal(message))
}

fn as_function<'s>(
    value: v8::Local<'s, v8::Value>,
) -> Result<v8::Local<'s, v8::Function>, BridgeError> {
    v8::Local::<v8::Function>::try_from(value)
        .map_err(|_| BridgeError::Marshal("Target is not a function"))
}

fn as_array<'s>(
    value: v8::Local<'s, v8::Value>,
) -> Result<v8::Local<'s, v8::Array>, BridgeError> {
    v8::Local::<v8::Array>::try_from(value)
        .map_err(|_| BridgeError::Marshal("Target is not an array"))
}

/// One isolate plus one engine context, owned by the host.
///
/// All operations are synchronous and assume single-threaded access; the
/// caller serializes use across threads if it has any.
pub struct ExecutionContext {
    // Declared before the isolate so its persistent references drop while the
    // isolate is still alive.
    state: Rc<ContextState>,
    debug: Option<Box<dyn DebugChannel>>,
    isolate: v8::OwnedIsolate,
    disposed: bool,
}

impl ExecutionContext {
    /// Create a context. The first call in the process also installs the host
    /// environment and bootstraps the engine platform.
    pub fn initialize(
        debug: Option<Box<dyn DebugChannel>>,
        host: Arc<dyn HostEnv>,
    ) -> Result<ExecutionContext, BridgeError> {
        platform::init(Arc::clone(&host));

        let params = v8::CreateParams::default().array_buffer_allocator(v8::new_default_allocator());
        let mut isolate = v8::Isolate::new(params);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
        isolate.set_promise_reject_callback(on_promise_reject);
        isolate.add_message_listener(on_engine_message);
        isolate.set_oom_error_handler(on_engine_oom);

        let state = {
            let scope = pin!(v8::HandleScope::new(&mut isolate));
            let mut scope = scope.init();
            let context = v8::Context::new(&scope, Default::default());
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            // Script can address the global object by name.
            let global = context.global(scope);
            let global_name = v8::String::new(scope, "global").unwrap();
            global.set(scope, global_name.into(), global.into());

            let marker_name = v8::String::new(scope, "WrappedInstance").unwrap();
            let wrap_marker = v8::Symbol::new(scope, Some(marker_name));

            let undefined = v8::undefined(scope);
            let null = v8::null(scope);

            let state = Rc::new(ContextState {
                context: v8::Global::new(scope.as_ref(), context),
                global: v8::Global::new(scope.as_ref(), global),
                undefined: v8::Global::new(scope.as_ref(), undefined),
                null: v8::Global::new(scope.as_ref(), null),
                wrap_marker: v8::Global::new(scope.as_ref(), wrap_marker),
                handles: RefCell::new(HandleArena::new()),
                dispatch: RefCell::new(DispatchTable::new()),
                scratch: RefCell::new(Scratch::new()),
                sweep: SweepQueue::new(),
                host: Arc::clone(&host),
            });

            // The trampoline recovers the state through the engine context.
            context.set_slot(Rc::clone(&state));
            state
        };

        log::debug!("execution context initialized");
        Ok(ExecutionContext {
            state,
            debug,
            isolate,
            disposed: false,
        })
    }

    /// Enter the context and run one operation against it.
    fn op<F>(&mut self, f: F) -> Response
    where
        F: for<'s, 'i> FnOnce(&mut v8::PinScope<'s, 'i>, &Rc<ContextState>) -> Response,
    {
        if self.disposed {
            return self.state.bridge_error(&BridgeError::Disposed);
        }
        let state = Rc::clone(&self.state);
        let scope = pin!(v8::HandleScope::new(&mut self.isolate));
        let mut scope = scope.init();
        let context = v8::Local::new(&scope, &state.context);
        let scope = &mut v8::ContextScope::new(&mut scope, context);
        f(scope, &state)
    }

    /// Compile and run a script. `location` is diagnostic only.
    pub fn evaluate(&mut self, source: &str, location: &str) -> Response {
        log::trace!("evaluate {location}");
        self.op(|scope, state| {
            let Some(code) = v8::String::new(scope, source) else {
                return state.error_response("Script allocation failed");
            };
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            let Some(script) = v8::Script::compile(&tc, code, None) else {
                return catch_response!(state, &tc);
            };
            match script.run(&tc) {
                Some(result) => state.from_value(&tc, result),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn create_object(&mut self) -> Response {
        self.op(|scope, state| {
            let object = v8::Object::new(scope);
            state.from_value(scope, object.into())
        })
    }

    pub fn create_array(&mut self) -> Response {
        self.op(|scope, state| {
            let array = v8::Array::new(scope, 0);
            state.from_value(scope, array.into())
        })
    }

    pub fn create_number(&mut self, value: f64) -> Response {
        self.op(move |scope, state| {
            let number = v8::Number::new(scope, value);
            state.from_value(scope, number.into())
        })
    }

    pub fn create_boolean(&mut self, value: bool) -> Response {
        self.op(move |scope, state| {
            let boolean = v8::Boolean::new(scope, value);
            state.from_value(scope, boolean.into())
        })
    }

    pub fn create_string(&mut self, value: &str) -> Response {
        self.op(|scope, state| {
            let Some(string) = v8::String::new(scope, value) else {
                return state.error_response("String allocation failed");
            };
            state.from_value(scope, string.into())
        })
    }

    pub fn create_symbol(&mut self, description: &str) -> Response {
        self.op(|scope, state| {
            let Some(description) = v8::String::new(scope, description) else {
                return state.error_response("String allocation failed");
            };
            let symbol = v8::Symbol::new(scope, Some(description));
            state.from_value(scope, symbol.into())
        })
    }

    pub fn create_date(&mut self, epoch_millis: i64) -> Response {
        self.op(move |scope, state| match v8::Date::new(scope, epoch_millis as f64) {
            Some(date) => state.from_value(scope, date.into()),
            None => state.error_response("Date creation failed"),
        })
    }

    pub fn create_undefined(&mut self) -> Response {
        self.op(|scope, state| {
            let undefined = v8::Local::new(scope, &state.undefined);
            state.from_value(scope, undefined.into())
        })
    }

    pub fn create_null(&mut self) -> Response {
        self.op(|scope, state| {
            let null = v8::Local::new(scope, &state.null);
            state.from_value(scope, null.into())
        })
    }

    /// A handle to the global object.
    pub fn get_global(&mut self) -> Response {
        self.op(|scope, state| {
            let global = v8::Local::new(scope, &state.global);
            state.from_value(scope, global.into())
        })
    }

    pub fn get_property(&mut self, target: HandleId, name: &str) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "This is not an object"));
            let Some(key) = v8::String::new(scope, name) else {
                return state.error_response("String allocation failed");
            };
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.get(&tc, key.into()) {
                Some(value) => state.from_value(&tc, value),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Set a named property; echoes the value back on success.
    pub fn set_property(&mut self, target: HandleId, name: &str, value: &Response) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "This is not an object"));
            let Some(key) = v8::String::new(scope, name) else {
                return state.error_response("String allocation failed");
            };
            let value = expect!(state, state.to_engine_value(scope, value));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.set(&tc, key.into(), value) {
                Some(_) => state.from_value(&tc, value),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn has_property(&mut self, target: HandleId, name: &str) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "Target is not an object"));
            let Some(key) = v8::String::new(scope, name) else {
                return state.error_response("String allocation failed");
            };
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.has_own_property(&tc, key.into()) {
                Some(found) => Response::Boolean(found),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn delete_property(&mut self, target: HandleId, name: &str) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "Target is not an object"));
            let Some(key) = v8::String::new(scope, name) else {
                return state.error_response("String allocation failed");
            };
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.delete(&tc, key.into()) {
                Some(deleted) => Response::Boolean(deleted),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Get a property by arbitrary key.
    pub fn get(&mut self, target: HandleId, key: &Response) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "This is not an object"));
            let key = expect!(state, state.to_engine_value(scope, key));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.get(&tc, key) {
                Some(value) => state.from_value(&tc, value),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn set(&mut self, target: HandleId, key: &Response, value: &Response) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "This is not an object"));
            let key = expect!(state, state.to_engine_value(scope, key));
            let value = expect!(state, state.to_engine_value(scope, value));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.set(&tc, key, value) {
                Some(_) => state.from_value(&tc, value),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Own-property check by arbitrary key; the key must be a property name.
    pub fn has(&mut self, target: HandleId, key: &Response) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "Target is not an object"));
            let key = expect!(state, state.to_engine_value(scope, key));
            let Ok(key) = v8::Local::<v8::Name>::try_from(key) else {
                return state.error_response("Key is not a property name");
            };
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.has_own_property(&tc, key) {
                Some(found) => Response::Boolean(found),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn get_property_at(&mut self, target: HandleId, index: u32) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let array = expect!(state, as_array(target));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match array.get_index(&tc, index) {
                Some(value) => state.from_value(&tc, value),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn set_property_at(&mut self, target: HandleId, index: u32, value: &Response) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let array = expect!(state, as_array(target));
            let value = expect!(state, state.to_engine_value(scope, value));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match array.set_index(&tc, index, value) {
                Some(_) => state.from_value(&tc, value),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn get_array_length(&mut self, target: HandleId) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let array = expect!(state, as_array(target));
            Response::Integer(array.length() as i64)
        })
    }

    /// Define a property from either a value or an accessor pair. Unset
    /// attributes are left to the engine.
    pub fn define_property(
        &mut self,
        target: HandleId,
        name: &str,
        attributes: PropertyAttributes,
        getter: Option<&Response>,
        setter: Option<&Response>,
        value: Option<&Response>,
    ) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "Target is not an object"));
            let Some(key) = v8::String::new(scope, name) else {
                return state.error_response("String allocation failed");
            };

            let mut descriptor = if let Some(value) = value {
                let value = expect!(state, state.to_engine_value(scope, value));
                v8::PropertyDescriptor::new_from_value_writable(
                    value,
                    attributes.writable == PropertyFlag::True,
                )
            } else {
                let get = match getter {
                    Some(get) => expect!(state, state.to_engine_value(scope, get)),
                    None => v8::undefined(scope).into(),
                };
                let set = match setter {
                    Some(set) => expect!(state, state.to_engine_value(scope, set)),
                    None => v8::undefined(scope).into(),
                };
                v8::PropertyDescriptor::new_from_get_set(get, set)
            };
            if attributes.configurable != PropertyFlag::NotSet {
                descriptor.set_configurable(attributes.configurable == PropertyFlag::True);
            }
            if attributes.enumerable != PropertyFlag::NotSet {
                descriptor.set_enumerable(attributes.enumerable == PropertyFlag::True);
            }

            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match object.define_property(&tc, key.into(), &descriptor) {
                Some(defined) => Response::Boolean(defined),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Abstract (`==`-style) equality between two marshaled values.
    pub fn equals(&mut self, left: &Response, right: &Response) -> Response {
        self.op(move |scope, state| {
            let left = expect!(state, state.to_engine_value(scope, left));
            let right = expect!(state, state.to_engine_value(scope, right));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match left.equals(&tc, right) {
                Some(result) => Response::Boolean(result),
                None => catch_response!(state, &tc),
            }
        })
    }

    pub fn to_string(&mut self, target: HandleId) -> Response {
        self.op(move |scope, state| {
            let value = expect!(state, state.local_value(scope, target));
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match value.to_string(&tc) {
                Some(string) => state.string_value(&tc, string),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Embed a host pointer as an opaque engine object and hand back the
    /// wrapper's owning handle. Exactly one release path frees the pointer:
    /// explicit release, the GC sweep, or the disposal force-sweep.
    pub fn wrap(&mut self, host_ptr: *mut c_void) -> Response {
        self.op(move |scope, state| {
            let marker = v8::Local::new(scope, &state.wrap_marker);
            let wrapper = external::wrap(scope, marker, host_ptr);
            let wrapper: v8::Local<v8::Value> = wrapper.into();
            let global = v8::Global::new(scope.as_ref(), wrapper);
            let id = state
                .handles
                .borrow_mut()
                .insert(global, HandleKind::Wrapped, Some(host_ptr));
            Response::Handle(HandleRef {
                id,
                kind: HandleKind::Wrapped,
                host_ptr: Some(host_ptr),
            })
        })
    }

    /// Release a handle. For wrapped handles, `force` surrenders the host
    /// pointer immediately; otherwise release follows engine reachability.
    /// Releasing an id twice is an error and never reaches the host callback
    /// again.
    pub fn release(&mut self, handle: HandleId, force: bool) -> Response {
        self.op(move |scope, state| match state.release_slot(scope, handle, force) {
            Ok(()) => Response::Boolean(true),
            Err(err) => state.bridge_error(&err),
        })
    }

    /// Sweep wrappers whose engine values were finalized since the last call.
    /// Not a full engine collection; repeat calls with no intervening engine
    /// activity release nothing further.
    pub fn gc(&mut self) -> Response {
        self.op(|_scope, state| {
            let released = state.sweep_pending();
            if released > 0 {
                tracing::trace!("gc sweep released {released} wrappers");
            }
            Response::Undefined
        })
    }

    /// Call a function handle. A missing, undefined or null receiver falls
    /// back to the global object.
    pub fn invoke_function(
        &mut self,
        target: HandleId,
        this: Option<&Response>,
        args: &[Response],
    ) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let function = expect!(state, as_function(target));
            let receiver: v8::Local<v8::Value> = match this {
                Some(this) => {
                    let value = expect!(state, state.to_engine_value(scope, this));
                    if value.is_undefined() || value.is_null() {
                        v8::Local::new(scope, &state.global).into()
                    } else {
                        value
                    }
                }
                None => v8::Local::new(scope, &state.global).into(),
            };
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                argv.push(expect!(state, state.to_engine_value(scope, arg)));
            }
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match function.call(&tc, receiver, &argv) {
                Some(result) => state.from_value(&tc, result),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Call `target[name](...)` with `target` as the receiver.
    pub fn invoke_method(&mut self, target: HandleId, name: &str, args: &[Response]) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let object = expect!(state, as_object(target, "Target is not an object"));
            let Some(key) = v8::String::new(scope, name) else {
                return state.error_response("String allocation failed");
            };
            let method = match object.get(scope, key.into()) {
                Some(method) if method.is_function() => method,
                _ => return state.error_response("Method does not exist"),
            };
            let function = expect!(state, as_function(method));
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                argv.push(expect!(state, state.to_engine_value(scope, arg)));
            }
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match function.call(&tc, object.into(), &argv) {
                Some(result) => state.from_value(&tc, result),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Construct an instance from a constructor handle.
    pub fn new_instance(&mut self, target: HandleId, args: &[Response]) -> Response {
        self.op(move |scope, state| {
            let target = expect!(state, state.local_value(scope, target));
            let function = expect!(state, as_function(target));
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                argv.push(expect!(state, state.to_engine_value(scope, arg)));
            }
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();
            match function.new_instance(&tc, &argv) {
                Some(instance) => state.from_value(&tc, instance.into()),
                None => catch_response!(state, &tc),
            }
        })
    }

    /// Expose a host callback as an engine function, named for diagnostics.
    ///
    /// The callback receives the marshaled receiver and an arguments-array
    /// handle; its `Handle` result becomes the return value, an `Error`
    /// result is thrown into script, anything else yields `undefined`.
    pub fn create_function<F>(&mut self, name: &str, callback: F) -> Response
    where
        F: Fn(Response, Response) -> Response + 'static,
    {
        self.op(move |scope, state| {
            let id = state.dispatch.borrow_mut().register(Rc::new(callback));
            let data = v8::Number::new(scope, id as f64);
            let Some(function) = v8::Function::builder(dispatch::trampoline)
                .data(data.into())
                .build(scope)
            else {
                return state.error_response("Function creation failed");
            };
            if let Some(name) = v8::String::new(scope, name) {
                function.set_name(name);
            }
            state.from_value(scope, function.into())
        })
    }

    /// Deliver one inspector protocol message to the debug channel, if any.
    pub fn dispatch_debug_message(&mut self, message: &str) -> Response {
        if self.disposed {
            return self.state.bridge_error(&BridgeError::Disposed);
        }
        if let Some(channel) = self.debug.as_mut() {
            channel.send_message(message);
        }
        Response::Boolean(true)
    }

    /// Tear the context down: inspector first, then every remaining wrapper
    /// is released unconditionally (exactly once each). Idempotent; also runs
    /// on drop. Any later operation returns a disposed error.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.debug = None;

        let state = Rc::clone(&self.state);
        {
            let scope = pin!(v8::HandleScope::new(&mut self.isolate));
            let scope = scope.init();
            let context = v8::Local::new(&scope, &state.context);
            let _ = context.remove_slot::<Rc<ContextState>>();
        }

        // Wrappers the engine already finalized, then everything left.
        state.sweep_pending();
        let slots = state.handles.borrow_mut().drain();
        let mut reclaimed = Vec::new();
        for slot in slots {
            if let Some(ptr) = slot.host_ptr {
                reclaimed.push(ptr);
            }
        }
        for ptr in reclaimed {
            state.host.free_handle(ptr);
        }
        state.dispatch.borrow_mut().clear();
        log::debug!("execution context disposed");
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

extern "C" fn on_promise_reject(message: v8::PromiseRejectMessage) {
    log::warn!("promise rejected: {:?}", message.get_event());
}

extern "C" fn on_engine_message(message: v8::Local<v8::Message>, _exception: v8::Local<v8::Value>) {
    let scope = pin!(unsafe { v8::CallbackScope::new(message) });
    let scope = &mut scope.init();
    let text = message.get(scope).to_rust_string_lossy(scope);
    log::error!("engine message: {text}");
    platform::host().log(&text);
}

unsafe extern "C" fn on_engine_oom(location: *const c_char, details: &v8::OomDetails) {
    let location = if location.is_null() {
        "unknown"
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { CStr::from_ptr(location) }
            .to_str()
            .unwrap_or("invalid utf8")
    };
    let detail = if details.detail.is_null() {
        "out of memory"
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { CStr::from_ptr(details.detail as *const c_char) }
            .to_str()
            .unwrap_or("out of memory")
    };
    log::error!("engine fatal error at {location}: {detail}");
    platform::host().fatal_error(location, detail);
}
