use crate::errors::OpError;
use crate::ops::OpPayload;
use crate::ops::ZeroCopyBuf;
use crate::runtime::JsRuntime;
use crate::runtime::TimerCallback;
use anyhow::Error;
use std::ffi::c_void;

/// Populates a new JavaScript context with low-level Rust bindings.
///
/// Publishes exactly the primitives the bootstrap script (`./js/core.js`)
/// needs to build the promise ring and timer wrappers on top of: `send` /
/// `sendAsync` / `recv` for op dispatch, `close` / `resources` shortcuts,
/// raw `setTimeout`-family bindings, `encode` / `decode`, and `print`.
/// Everything else — `Promise`-returning `sendAsync`, the op name cache,
/// `console` — is built in JavaScript over these.
pub fn create_new_context<'s>(scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, v8::Context> {
    // Here we need an EscapableHandleScope so V8 doesn't drop the newly
    // created HandleScope on return. (https://v8.dev/docs/embed#handles-and-garbage-collection)
    let scope = &mut v8::EscapableHandleScope::new(scope);

    let context = v8::Context::new(scope);
    let global = context.global(scope);
    let scope = &mut v8::ContextScope::new(scope, context);

    set_function_to(scope, global, "print", print);
    set_function_to(scope, global, "send", send);
    set_function_to(scope, global, "sendAsync", send_async);
    set_function_to(scope, global, "recv", recv);
    set_function_to(scope, global, "encode", encode);
    set_function_to(scope, global, "decode", decode);
    set_function_to(scope, global, "bindTimeout", bind_timeout);
    set_function_to(scope, global, "bindInterval", bind_interval);
    set_function_to(scope, global, "clearTimer", clear_timer);
    set_function_to(scope, global, "refTimer", ref_timer);
    set_function_to(scope, global, "unrefTimer", unref_timer);

    scope.escape(context)
}

/// `print(value)` — bound to Rust's `println!` macro.
fn print(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    let value = args.get(0).to_rust_string_lossy(scope);
    println!("{value}");
}

/// `send(opId, controlJson, buf?) -> [isError, resultJson]` — synchronous op
/// dispatch. Failures are encoded in-band as the `OpError` wire shape rather
/// than thrown natively, matching how async completions are delivered: the
/// JS wrapper (`core.js`'s `opSync`) is the one that consults
/// `registerErrorClass`'s table and throws the right class. Keeping this
/// symmetric with the async completion tuple means there is exactly one
/// place (JS) that ever turns an `OpError` into a thrown value.
fn send(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let op_id = args.get(0).uint32_value(scope).unwrap_or(0);
    let payload = match parse_control(scope, args.get(1)) {
        Ok(payload) => payload,
        Err(e) => return throw_exception(scope, &e),
    };
    let buf = extract_zero_copy_buf(scope, args.get(2));

    let state_rc = JsRuntime::state(scope);
    let result = {
        let state = state_rc.borrow();
        let mut op_state = state.op_state.borrow_mut();
        state.ops.dispatch_sync(&mut op_state, op_id, payload, buf)
    };

    let (is_error, json) = match result {
        Ok(value) => (false, serde_json::to_string(&value).unwrap()),
        Err(e) => (true, serde_json::to_string(&e.to_json()).unwrap()),
    };

    let outcome = v8::Array::new(scope, 2);
    let is_error = v8::Boolean::new(scope, is_error);
    outcome.set_index(scope, 0, is_error.into());
    let json = v8::String::new(scope, &json).unwrap();
    outcome.set_index(scope, 1, json.into());

    rv.set(outcome.into());
}

/// `sendAsync(opId, promiseId, controlJson, buf?)` — kicks off an async op.
/// Its eventual completion is delivered later, batched, through `recv`.
fn send_async(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    let op_id = args.get(0).uint32_value(scope).unwrap_or(0);
    let promise_id = args.get(1).uint32_value(scope).unwrap_or(0);
    let payload = match parse_control(scope, args.get(2)) {
        Ok(payload) => payload,
        Err(e) => return throw_exception(scope, &e),
    };
    let buf = extract_zero_copy_buf(scope, args.get(3));

    let state_rc = JsRuntime::state(scope);
    let mut state = state_rc.borrow_mut();
    let op_state = state.op_state.clone();

    match state.ops.dispatch_async(op_state, op_id, promise_id, payload, buf) {
        Ok(future) => state.pending_ops.push(future),
        Err(e) => throw_op_error(scope, &e),
    }
}

/// `recv(callback)` — registers the function `sendAsync` completions are
/// batched into. Only one callback may be registered at a time, matching
/// the single JS-side dispatcher `core.js` installs at startup.
fn recv(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    let callback = match v8::Local::<v8::Function>::try_from(args.get(0)) {
        Ok(callback) => callback,
        Err(_) => return throw_type_error(scope, "recv() expects a function"),
    };

    let state_rc = JsRuntime::state(scope);
    state_rc.borrow_mut().recv_cb = Some(v8::Global::new(scope, callback));
}

/// `encode(string) -> Uint8Array` — UTF-8 text encoding.
fn encode(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let text = args.get(0).to_rust_string_lossy(scope);
    let bytes = text.into_bytes();

    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    let array = v8::Uint8Array::new(scope, buffer, 0, buffer.byte_length()).unwrap();

    rv.set(array.into());
}

/// `decode(buf) -> string` — UTF-8 text decoding (lossy, like `TextDecoder`
/// without a `fatal` flag).
fn decode(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let Some(buf) = extract_zero_copy_buf(scope, args.get(0)) else {
        return throw_type_error(scope, "decode() expects a buffer");
    };
    let text = String::from_utf8_lossy(&buf).into_owned();
    rv.set(v8::String::new(scope, &text).unwrap().into());
}

/// `bindTimeout(delayMs, callback, ...args) -> timerId`
fn bind_timeout(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    bind_timer(scope, args, &mut rv, false);
}

/// `bindInterval(delayMs, callback, ...args) -> timerId`
fn bind_interval(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    bind_timer(scope, args, &mut rv, true);
}

fn bind_timer(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    rv: &mut v8::ReturnValue,
    repeat: bool,
) {
    let delay_ms = args.get(0).integer_value(scope).unwrap_or(0);

    let callback = match v8::Local::<v8::Function>::try_from(args.get(1)) {
        Ok(callback) => callback,
        Err(_) => return throw_type_error(scope, "setTimeout/setInterval expects a function"),
    };

    let extra_args: Vec<v8::Global<v8::Value>> = (2..args.length())
        .map(|i| v8::Global::new(scope, args.get(i)))
        .collect();

    let callback = TimerCallback {
        callback: v8::Global::new(scope, callback),
        args: extra_args,
    };

    let state_rc = JsRuntime::state(scope);
    let mut state = state_rc.borrow_mut();
    let id = state.timers.set(std::time::Instant::now(), delay_ms, repeat, callback);

    rv.set(v8::Number::new(scope, id as f64).into());
}

/// `clearTimer(id)` — underlies both `clearTimeout` and `clearInterval`.
fn clear_timer(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    let id = args.get(0).uint32_value(scope).unwrap_or(0);
    JsRuntime::state(scope).borrow_mut().timers.clear(id);
}

fn ref_timer(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    let id = args.get(0).uint32_value(scope).unwrap_or(0);
    JsRuntime::state(scope).borrow_mut().timers.set_ref(id, true);
}

fn unref_timer(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _rv: v8::ReturnValue) {
    let id = args.get(0).uint32_value(scope).unwrap_or(0);
    JsRuntime::state(scope).borrow_mut().timers.set_ref(id, false);
}

fn parse_control(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Result<OpPayload, Error> {
    if value.is_null_or_undefined() {
        return Ok(OpPayload::Value(serde_json::Value::Null));
    }
    let text = value.to_rust_string_lossy(scope);
    let value: serde_json::Value = serde_json::from_str(&text)?;
    Ok(OpPayload::Value(value))
}

fn extract_zero_copy_buf(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Option<ZeroCopyBuf> {
    let view = v8::Local::<v8::ArrayBufferView>::try_from(value).ok()?;
    let backing_store = view.buffer(scope)?.get_backing_store();
    Some(ZeroCopyBuf::new(backing_store, view.byte_offset(), view.byte_length()))
}

/// Adds a `Function` object which calls the given Rust function.
pub fn set_function_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &'static str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let template = v8::FunctionTemplate::new(scope, callback);
    let val = template.get_function(scope).unwrap();

    target.set(scope, key.into(), val.into());
}

/// Adds a property with the given name and value, into the given object.
pub fn set_property_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &'static str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.set(scope, key.into(), value);
}

/// Adds a read-only property with the given name and value, into the given object.
pub fn set_constant_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.define_own_property(scope, key.into(), value, v8::PropertyAttribute::READ_ONLY);
}

/// Creates an object with a given name under a `target` object.
pub fn create_object_under<'s>(
    scope: &mut v8::HandleScope<'s>,
    target: v8::Local<v8::Object>,
    name: &'static str,
) -> v8::Local<'s, v8::Object> {
    let template = v8::ObjectTemplate::new(scope);
    let key = v8::String::new(scope, name).unwrap();
    let value = template.new_instance(scope).unwrap();

    target.set(scope, key.into(), value.into());
    value
}

/// Stores a Rust type inside a v8 object.
pub fn set_internal_ref<T>(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    index: usize,
    data: T,
) {
    let boxed_ref = Box::new(data);
    let addr = Box::leak(boxed_ref) as *mut T as *mut c_void;
    let v8_ext = v8::External::new(scope, addr);

    target.set_internal_field(index, v8_ext.into());
}

/// Gets a previously stored Rust type from a v8 object.
pub fn get_internal_ref<'s, T>(
    scope: &mut v8::HandleScope<'s>,
    source: v8::Local<v8::Object>,
    index: usize,
) -> &'s mut T {
    let v8_ref = source.get_internal_field(scope, index).unwrap();
    let stored_item = unsafe { v8::Local::<v8::External>::cast(v8_ref) };
    let stored_item = stored_item.value() as *mut T;

    unsafe { &mut *stored_item }
}

/// Sets `.code = ERR_<CLASS>` on an exception for an op failure.
pub fn set_exception_code(scope: &mut v8::HandleScope<'_>, exception: v8::Local<v8::Value>, error: &Error) {
    let exception = exception.to_object(scope).unwrap();
    if let Some(op_error) = error.downcast_ref::<OpError>() {
        let key = v8::String::new(scope, "code").unwrap();
        let value = v8::String::new(scope, &format!("ERR_{}", op_error.class)).unwrap();
        exception.set(scope, key.into(), value.into());
    }
}

fn throw_op_error(scope: &mut v8::HandleScope, error: &OpError) {
    let message = v8::String::new(scope, &error.message).unwrap();
    let exception = v8::Exception::error(scope, message);
    let exception_obj = exception.to_object(scope).unwrap();
    let key = v8::String::new(scope, "code").unwrap();
    let value = v8::String::new(scope, &format!("ERR_{}", error.class)).unwrap();
    exception_obj.set(scope, key.into(), value.into());
    scope.throw_exception(exception);
}

/// Useful utility to throw v8 exceptions.
pub fn throw_exception(scope: &mut v8::HandleScope, err: &Error) {
    let message = err.to_string();
    let message = v8::String::new(scope, &message).unwrap();
    let exception = v8::Exception::error(scope, message);
    set_exception_code(scope, exception, err);
    scope.throw_exception(exception);
}

/// Useful utility to throw v8 type errors.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}
