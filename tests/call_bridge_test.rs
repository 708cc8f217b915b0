mod common;

use std::sync::{Arc, Mutex};

use common::{new_context, string_of, test_host};
use hostbridge_v8::{HandleRef, Response, TransportString};

#[test]
fn script_calls_host_function_and_sees_its_return_value() {
    let mut ctx = new_context();

    // Pre-build the value the callback will hand back.
    let result = ctx
        .evaluate("({ answer: 7 })", "test://cb")
        .handle()
        .expect("result handle");

    let calls: Arc<Mutex<Vec<(Option<HandleRef>, Option<HandleRef>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let calls_in_cb = Arc::clone(&calls);

    let function = ctx.create_function("f", move |this, args| {
        calls_in_cb
            .lock()
            .unwrap()
            .push((this.handle(), args.handle()));
        Response::Handle(result)
    });
    let global = ctx.get_global().handle().unwrap();
    ctx.set_property(global.id, "f", &function);

    let response = ctx.evaluate("f(1, 2).answer", "test://call");
    assert!(matches!(response, Response::Number(n) if n == 7.0));

    let (this, args) = {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        calls[0]
    };
    assert!(this.is_some(), "receiver should marshal as a handle");

    // The arguments arrived as an array handle holding both numbers.
    let args = args.expect("arguments array handle");
    assert!(matches!(ctx.get_array_length(args.id), Response::Integer(2)));
    assert!(matches!(
        ctx.get_property_at(args.id, 0),
        Response::Number(n) if n == 1.0
    ));
    assert!(matches!(
        ctx.get_property_at(args.id, 1),
        Response::Number(n) if n == 2.0
    ));
}

#[test]
fn host_error_becomes_a_catchable_script_exception() {
    let mut ctx = new_context();
    let host = test_host();

    let error_ptr: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));
    let error_ptr_in_cb = Arc::clone(&error_ptr);

    let function = ctx.create_function("failing", move |_this, _args| {
        let message = TransportString::host_owned(test_host().as_ref(), "host boom");
        if let TransportString::HostOwned { ptr, .. } = &message {
            *error_ptr_in_cb.lock().unwrap() = Some(*ptr as usize);
        }
        Response::Error(message)
    });
    let global = ctx.get_global().handle().unwrap();
    ctx.set_property(global.id, "failing", &function);

    let response = ctx.evaluate(
        "(() => { try { failing(); return 'no-throw'; } catch (e) { return e.message; } })()",
        "test://host-error",
    );
    assert_eq!(string_of(&response), "host boom");

    // The message buffer transferred to the bridge, which released it after
    // converting it into the thrown exception.
    let ptr = error_ptr.lock().unwrap().take().expect("error buffer") as *mut u16;
    assert!(host.buffer_freed(ptr));
    assert!(!host.buffer_live(ptr));
}

#[test]
fn non_handle_results_yield_undefined() {
    let mut ctx = new_context();

    let function = ctx.create_function("nothing", |_this, _args| Response::Number(3.0));
    let global = ctx.get_global().handle().unwrap();
    ctx.set_property(global.id, "nothing", &function);

    assert!(matches!(
        ctx.evaluate("nothing() === undefined", "test://undef"),
        Response::Boolean(true)
    ));
}

#[test]
fn host_functions_carry_their_debug_name() {
    let mut ctx = new_context();

    let function = ctx.create_function("renamed", |_this, _args| Response::Undefined);
    let global = ctx.get_global().handle().unwrap();
    ctx.set_property(global.id, "g", &function);

    assert_eq!(string_of(&ctx.evaluate("g.name", "test://name")), "renamed");
}

#[test]
fn host_to_engine_invocation_paths() {
    let mut ctx = new_context();

    // invoke_function with an explicit receiver.
    let function = ctx
        .evaluate("(function () { return this.tag; })", "test://invoke")
        .handle()
        .unwrap();
    let receiver = ctx.evaluate("({ tag: 'mine' })", "test://invoke");
    let response = ctx.invoke_function(function.id, Some(&receiver), &[]);
    assert_eq!(string_of(&response), "mine");

    // An undefined receiver falls back to the global object.
    let function = ctx
        .evaluate("(function () { return this === global; })", "test://invoke")
        .handle()
        .unwrap();
    let response = ctx.invoke_function(function.id, Some(&Response::Undefined), &[]);
    assert!(matches!(response, Response::Boolean(true)));

    // invoke_method resolves by name with the target as receiver.
    let counter = ctx
        .evaluate(
            "({ total: 0, add(n) { this.total += n; return this.total; } })",
            "test://invoke",
        )
        .handle()
        .unwrap();
    let response = ctx.invoke_method(counter.id, "add", &[Response::Number(5.0)]);
    assert!(matches!(response, Response::Number(n) if n == 5.0));
    let response = ctx.invoke_method(counter.id, "add", &[Response::Number(2.0)]);
    assert!(matches!(response, Response::Number(n) if n == 7.0));

    let missing = ctx.invoke_method(counter.id, "subtract", &[]);
    assert_eq!(common::error_of(&missing), "Method does not exist");

    // new_instance constructs with marshaled arguments.
    let constructor = ctx
        .evaluate("(function Point(x) { this.x = x; })", "test://invoke")
        .handle()
        .unwrap();
    let instance = ctx
        .new_instance(constructor.id, &[Response::Number(3.0)])
        .handle()
        .expect("constructed instance");
    assert!(matches!(
        ctx.get_property(instance.id, "x"),
        Response::Number(n) if n == 3.0
    ));
}

#[test]
fn engine_exceptions_propagate_through_invocation() {
    let mut ctx = new_context();

    let function = ctx
        .evaluate(
            "(function angry() { throw new Error('no thanks'); })",
            "test://throw",
        )
        .handle()
        .unwrap();
    let response = ctx.invoke_function(function.id, None, &[]);
    let text = common::error_of(&response);
    assert!(text.starts_with("Error: no thanks"), "unexpected: {text}");
}
