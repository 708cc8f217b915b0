//! Engine→host call dispatch.
//!
//! Host callbacks are closures in a per-context table keyed by a numeric
//! function id; the id rides along as the engine function's captured data.
//! One trampoline serves every host-backed function: it recovers the context
//! state from the current engine context, marshals the receiver and the
//! arguments, and dispatches on the id.

use std::collections::HashMap;
use std::rc::Rc;

use crate::context::ContextState;
use crate::error::BridgeError;
use crate::response::{Response, TransportString};

pub(crate) type FunctionId = u64;

/// A host callback: receives the marshaled receiver and an arguments-array
/// handle, returns the marshaled result. An `Error` result becomes a thrown
/// engine exception; a `Handle` result becomes the return value; anything
/// else yields `undefined`.
pub(crate) type HostFunction = dyn Fn(Response, Response) -> Response + 'static;

/// Function-id → callback table. Entries are only added; the table is
/// read-only between registrations and cleared at context disposal.
pub(crate) struct DispatchTable {
    entries: HashMap<FunctionId, Rc<HostFunction>>,
    next_id: FunctionId,
}

impl DispatchTable {
    pub(crate) fn new() -> DispatchTable {
        DispatchTable {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn register(&mut self, callback: Rc<HostFunction>) -> FunctionId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, callback);
        id
    }

    pub(crate) fn lookup(&self, id: FunctionId) -> Option<Rc<HostFunction>> {
        self.entries.get(&id).cloned()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The single engine-invoked entry point for every host-backed function.
pub(crate) fn trampoline(
    scope: &mut v8::PinScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let state = {
        let context = scope.get_current_context();
        match context.get_slot::<Rc<ContextState>>() {
            Some(state) => Rc::clone(state),
            None => return,
        }
    };

    let Some(function_id) = args.data().number_value(scope).map(|n| n as FunctionId) else {
        rv.set_undefined();
        return;
    };

    // Clone the entry out so the table is not borrowed while the host runs;
    // a callback may register further functions.
    let callback = state.dispatch.borrow().lookup(function_id);
    let Some(callback) = callback else {
        throw_error(
            scope,
            &BridgeError::ExternalCall(format!("no host function {function_id}")).to_string(),
        );
        return;
    };

    let argc = args.length();
    let arguments = v8::Array::new(scope, argc);
    for i in 0..argc {
        let value = args.get(i);
        arguments.set_index(scope, i as u32, value);
    }

    let this = state.from_value(scope, args.this().into());
    let arguments = state.from_value(scope, arguments.into());

    match callback(this, arguments) {
        Response::Error(message) => {
            let text = message.to_string_lossy();
            // The message buffer was transferred to us; release it after the
            // conversion, not the host.
            if let TransportString::HostOwned { ptr, .. } = message {
                state.host.free_memory(ptr);
            }
            throw_error(scope, &text);
        }
        Response::Handle(handle) => match state.local_value(scope, handle.id) {
            Ok(value) => rv.set(value),
            Err(_) => rv.set_undefined(),
        },
        _ => rv.set_undefined(),
    }
}

fn throw_error(scope: &mut v8::PinScope, message: &str) {
    let Some(message) = v8::String::new(scope, message) else {
        return;
    };
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}
