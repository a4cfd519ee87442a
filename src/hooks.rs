use crate::bindings::set_exception_code;
use crate::bindings::throw_type_error;
use crate::errors::unwrap_or_exit;
use crate::event_loop::LoopHandle;
use crate::event_loop::TaskResult;
use crate::modules::load_import;
use crate::modules::resolve_import;
use crate::modules::DynamicImportFuture;
use crate::modules::ModuleGraph;
use crate::modules::ModuleStatus;
use crate::runtime::JsRuntime;
use std::cell::RefCell;
use std::rc::Rc;

/// Called during Module::instantiate_module.
/// https://docs.rs/v8/latest/v8/type.ResolveModuleCallback.html
pub fn module_resolve_cb<'a>(
    context: v8::Local<'a, v8::Context>,
    specifier: v8::Local<'a, v8::String>,
    _: v8::Local<'a, v8::FixedArray>,
    referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
    // SAFETY: the callback is only ever invoked by V8 while `context` is entered.
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let state = JsRuntime::state(scope);
    let state = state.borrow();

    let import_map = state.options.import_map.clone();
    let referrer_id = referrer.get_identity_hash().get();
    let referrer = v8::Global::new(scope, referrer);

    let dependant = state.modules.get_module_path(referrer_id, referrer);

    let specifier = specifier.to_rust_string_lossy(scope);
    let specifier = unwrap_or_exit(resolve_import(dependant.as_deref(), &specifier, import_map));

    // This call should always give us back the module.
    let module = state.modules.get_module(&specifier).unwrap();

    Some(v8::Local::new(scope, module))
}

/// Called the first time import.meta is accessed for a module.
/// https://docs.rs/v8/latest/v8/type.HostInitializeImportMetaObjectCallback.html
pub extern "C" fn host_initialize_import_meta_object_cb(
    context: v8::Local<v8::Context>,
    module: v8::Local<v8::Module>,
    meta: v8::Local<v8::Object>,
) {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let state = JsRuntime::state(scope);
    let state = state.borrow();

    let module_id = module.get_identity_hash().get();
    let module = v8::Global::new(scope, module);

    let url = state.modules.get_module_path(module_id, module).unwrap();
    let is_main = state.modules.main() == Some(url.to_owned());

    let key = v8::String::new(scope, "url").unwrap();
    let value = v8::String::new(scope, &url).unwrap();
    meta.create_data_property(scope, key.into(), value.into());

    let key = v8::String::new(scope, "main").unwrap();
    let value = v8::Boolean::new(scope, is_main);
    meta.create_data_property(scope, key.into(), value.into());

    let url = v8::String::new(scope, &url).unwrap();
    let builder = v8::FunctionBuilder::new(import_meta_resolve).data(url.into());

    let key = v8::String::new(scope, "resolve").unwrap();
    let value = v8::FunctionBuilder::<v8::Function>::build(builder, scope).unwrap();
    meta.set(scope, key.into(), value.into());
}

fn import_meta_resolve(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if args.length() == 0 {
        throw_type_error(scope, "Not enough arguments specified.");
        return;
    }

    let base = args.data().unwrap().to_rust_string_lossy(scope);
    let specifier = args.get(0).to_rust_string_lossy(scope);
    let import_map = JsRuntime::state(scope).borrow().options.import_map.clone();

    match resolve_import(Some(&base), &specifier, import_map) {
        Ok(path) => rv.set(v8::String::new(scope, &path).unwrap().into()),
        Err(e) => throw_type_error(scope, &e.to_string()),
    };
}

/// Called when a promise rejects with no rejection handler specified.
/// https://docs.rs/v8/latest/v8/type.PromiseRejectCallback.html
pub extern "C" fn promise_reject_cb(message: v8::PromiseRejectMessage) {
    let scope = &mut unsafe { v8::CallbackScope::new(&message) };
    let undefined = v8::undefined(scope).into();
    let event = message.get_event();

    use v8::PromiseRejectEvent::*;

    let reason = match event {
        PromiseHandlerAddedAfterReject
        | PromiseRejectAfterResolved
        | PromiseResolveAfterResolved => undefined,
        PromiseRejectWithNoHandler => message.get_value().unwrap(),
    };

    let promise = message.get_promise();
    let promise = v8::Global::new(scope, promise);

    let state_rc = JsRuntime::state(scope);
    let mut state = state_rc.borrow_mut();

    match event {
        // Note: the interrupt handle wakes the loop so this rejection gets
        // surfaced promptly instead of waiting for unrelated I/O.
        PromiseRejectWithNoHandler => {
            let reason = v8::Global::new(scope, reason);
            state.promise_exceptions.insert(promise, reason);
            state.interrupt_handle.interrupt();
        }
        PromiseHandlerAddedAfterReject => {
            state.promise_exceptions.remove(&promise);
        }
        PromiseRejectAfterResolved | PromiseResolveAfterResolved => {}
    }
}

/// Called when we require the embedder to load a module dynamically.
/// https://docs.rs/v8/latest/v8/trait.HostImportModuleDynamicallyCallback.html
pub fn host_import_module_dynamically_cb<'s>(
    scope: &mut v8::HandleScope<'s>,
    _: v8::Local<'s, v8::Data>,
    base: v8::Local<'s, v8::Value>,
    specifier: v8::Local<'s, v8::String>,
    _: v8::Local<v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
    let base = base.to_rust_string_lossy(scope);
    let specifier = specifier.to_rust_string_lossy(scope);

    let promise_resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = promise_resolver.get_promise(scope);

    let state_rc = JsRuntime::state(scope);
    let mut state = state_rc.borrow_mut();

    let import_map = state.options.import_map.clone();

    let specifier = match resolve_import(Some(&base), &specifier, import_map) {
        Ok(specifier) => specifier,
        Err(e) => {
            drop(state);
            // A dynamic import that fails to resolve or load rejects with a
            // `TypeError`, same as the browser/Node contract for a missing
            // or unresolvable specifier.
            let exception = v8::String::new(scope, &e.to_string()).unwrap();
            let exception = v8::Exception::type_error(scope, exception);
            set_exception_code(scope, exception, &e);
            promise_resolver.reject(scope, exception);
            return Some(promise);
        }
    };

    let dynamic_import_being_fetched = state
        .modules
        .pending
        .iter()
        .any(|graph_rc| graph_rc.borrow().root_rc.borrow().path == specifier);

    // Check if the requested dynamic module is already resolved.
    if state.modules.by_path.contains_key(&specifier) && !dynamic_import_being_fetched {
        let module = state.modules.get_module(&specifier).unwrap();
        let module = module.open(scope);

        // A dynamic import resolves with the module's namespace object, not
        // its evaluation result.
        promise_resolver.resolve(scope, module.get_module_namespace());
        return Some(promise);
    }

    let global_promise = v8::Global::new(scope, promise_resolver);

    if dynamic_import_being_fetched {
        // Join the graph already resolving this specifier instead of
        // double-fetching it.
        state
            .modules
            .pending
            .iter()
            .find(|graph_rc| graph_rc.borrow().root_rc.borrow().path == specifier)
            .unwrap()
            .borrow_mut()
            .same_origin
            .push_back(global_promise);

        return Some(promise);
    }

    let graph = ModuleGraph::dynamic_import(&specifier, global_promise.clone());
    let graph_rc = Rc::new(RefCell::new(graph));
    let status = ModuleStatus::Fetching;

    state.modules.pending.push(Rc::clone(&graph_rc));
    state.modules.seen.insert(specifier.clone(), status);

    // Use the event-loop's thread-pool to load the module's source off the
    // isolate thread, then settle the promise back on it.
    let task = {
        let specifier = specifier.clone();
        move || match load_import(&specifier, true) {
            anyhow::Result::Ok(source) => Some(Ok(bincode::serialize(&source).unwrap())),
            Err(e) => Some(Result::Err(e)),
        }
    };

    let task_cb = {
        let state_rc = state_rc.clone();
        move |_: LoopHandle, maybe_result: TaskResult| {
            let mut state = state_rc.borrow_mut();
            let future = DynamicImportFuture {
                specifier,
                promise: global_promise,
                maybe_result,
            };
            state.pending_futures.push(Box::new(future));
        }
    };

    state.handle.spawn(task, Some(task_cb));

    Some(promise)
}
