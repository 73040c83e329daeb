//! Engine hooks: module resolution, dynamic import, import.meta, promise
//! rejection tracking.

use crate::js::engine::Engine;
use crate::prelude::*;

/// Create a script origin.
pub(crate) fn create_origin<'s>(
  scope: &mut v8::HandleScope<'s, ()>,
  name: &str,
  is_module: bool,
) -> v8::ScriptOrigin<'s> {
  let name = v8::String::new(scope, name).unwrap();
  let source_map = v8::undefined(scope);

  v8::ScriptOrigin::new(
    scope,
    name.into(),
    0,
    0,
    false,
    0,
    source_map.into(),
    false,
    false,
    is_module,
  )
}

fn throw_error(scope: &mut v8::HandleScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::error(scope, message);
  scope.throw_exception(exception);
}

/// Resolves a static module tree, synchronously. Every module source comes
/// from the installed source hook; failures are thrown into the current
/// execution so callers observe them through their `TryCatch`.
pub(crate) fn fetch_module_tree<'a>(
  scope: &mut v8::HandleScope<'a>,
  filename: &str,
  source: Option<&str>,
) -> Option<v8::Local<'a, v8::Module>> {
  let state_rc = Engine::state(scope);

  // Already compiled.
  if let Some(module) = state_rc.borrow().module_index.get(filename) {
    return Some(v8::Local::new(scope, module));
  }

  let origin = create_origin(scope, filename, true);

  let source = match source {
    Some(source) => source.to_string(),
    None => {
      let hook = state_rc.borrow().source_hook.clone();
      let loaded = match hook {
        Some(hook) => hook.load(filename),
        None => anyhow::Result::Err(anyhow::anyhow!("no module source hook installed")),
      };
      match loaded {
        Ok(source) => source,
        Err(e) => {
          throw_error(scope, &e.to_string());
          return None;
        }
      }
    }
  };
  trace!("Loaded module {:?} ({} bytes)", filename, source.len());

  let source = v8::String::new(scope, &source).unwrap();
  let mut source = v8::script_compiler::Source::new(source, Some(&origin));

  let module = v8::script_compiler::compile_module(scope, &mut source)?;

  // Subscribe module to the module index before fetching dependencies so
  // cycles terminate.
  let module_ref = v8::Global::new(scope, module);
  state_rc.borrow_mut().module_index.insert(filename, module_ref);

  let requests = module.get_module_requests();
  for i in 0..requests.length() {
    let request = requests.get(scope, i).unwrap();
    let request = v8::Local::<v8::ModuleRequest>::try_from(request).unwrap();
    let specifier = request.get_specifier().to_rust_string_lossy(scope);

    let hook = state_rc.borrow().source_hook.clone();
    let resolved = match hook {
      Some(hook) => hook.resolve(Some(filename), &specifier),
      None => anyhow::Result::Err(anyhow::anyhow!("no module source hook installed")),
    };
    let specifier = match resolved {
      Ok(path) => path,
      Err(e) => {
        throw_error(scope, &e.to_string());
        return None;
      }
    };
    trace!("Resolved dependency {:?} from {:?}", specifier, filename);

    if !state_rc.borrow().module_index.contains(&specifier) {
      fetch_module_tree(scope, &specifier, None)?;
    }
  }

  Some(module)
}

/// Called during `Module::instantiate_module` to map a specifier back to a
/// compiled module from the index.
pub(crate) fn module_resolve_cb<'a>(
  context: v8::Local<'a, v8::Context>,
  specifier: v8::Local<'a, v8::String>,
  _import_attributes: v8::Local<'a, v8::FixedArray>,
  referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
  let scope = &mut unsafe { v8::CallbackScope::new(context) };
  let state_rc = Engine::state(scope);

  let referrer = v8::Global::new(scope, referrer);
  let referrer_path = state_rc.borrow().module_index.get_path(referrer);

  let specifier = specifier.to_rust_string_lossy(scope);
  let hook = state_rc.borrow().source_hook.clone()?;
  let specifier = match hook.resolve(referrer_path.as_deref(), &specifier) {
    Ok(path) => path,
    Err(e) => {
      error!("Failed to re-resolve {:?}: {:?}", specifier, e);
      return None;
    }
  };

  // This call should always give us back the module.
  let module = state_rc.borrow().module_index.get(&specifier)?;
  Some(v8::Local::new(scope, module))
}

/// Called on `import()`. The promise is recorded and resolved by
/// [`Engine::tick_dynamic_imports`] between frames; already-loaded modules
/// resolve immediately.
pub(crate) fn host_import_module_dynamically_cb<'s>(
  scope: &mut v8::HandleScope<'s>,
  _host_defined_options: v8::Local<'s, v8::Data>,
  base: v8::Local<'s, v8::Value>,
  specifier: v8::Local<'s, v8::String>,
  _import_attributes: v8::Local<v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
  let base = base.to_rust_string_lossy(scope);
  let specifier = specifier.to_rust_string_lossy(scope);
  trace!("Dynamic import base:{:?}, specifier:{:?}", base, specifier);

  let resolver = v8::PromiseResolver::new(scope).unwrap();
  let promise = resolver.get_promise(scope);

  let state_rc = Engine::state(scope);
  let hook = state_rc.borrow().source_hook.clone();

  let resolved = match hook {
    Some(hook) => hook.resolve(Some(&base), &specifier),
    None => anyhow::Result::Err(anyhow::anyhow!("no module source hook installed")),
  };

  let path = match resolved {
    Ok(path) => path,
    Err(e) => {
      let message = v8::String::new(scope, &e.to_string()).unwrap();
      let exception = v8::Exception::error(scope, message);
      resolver.reject(scope, exception);
      return Some(promise);
    }
  };

  // Already resolved once: hand out the namespace without re-evaluating.
  if state_rc.borrow().module_index.contains(&path) {
    let module = state_rc.borrow().module_index.get(&path).unwrap();
    let module = v8::Local::new(scope, module);
    if module.get_status() == v8::ModuleStatus::Evaluated {
      resolver.resolve(scope, module.get_module_namespace());
      return Some(promise);
    }
  }

  let global_resolver = v8::Global::new(scope, resolver);
  state_rc
    .borrow_mut()
    .dynamic_imports
    .push((path, global_resolver));

  Some(promise)
}

/// Called the first time `import.meta` is accessed for a module.
pub(crate) extern "C" fn host_initialize_import_meta_object_cb(
  context: v8::Local<v8::Context>,
  module: v8::Local<v8::Module>,
  meta: v8::Local<v8::Object>,
) {
  let scope = &mut unsafe { v8::CallbackScope::new(context) };
  let scope = &mut v8::HandleScope::new(scope);

  let state_rc = Engine::state(scope);

  let module = v8::Global::new(scope, module);
  let url = match state_rc.borrow().module_index.get_path(module) {
    Some(url) => url,
    None => return,
  };
  let is_main = state_rc.borrow().module_index.main() == Some(&url);

  let key = v8::String::new(scope, "url").unwrap();
  let value = v8::String::new(scope, &url).unwrap();
  meta.create_data_property(scope, key.into(), value.into());

  let key = v8::String::new(scope, "main").unwrap();
  let value = v8::Boolean::new(scope, is_main);
  meta.create_data_property(scope, key.into(), value.into());

  // import.meta.resolve(), anchored at this module's path.
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
    let message = v8::String::new(scope, "Not enough arguments specified.").unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
    return;
  }

  let base = args.data().to_rust_string_lossy(scope);
  let specifier = args.get(0).to_rust_string_lossy(scope);

  let state_rc = Engine::state(scope);
  let hook = state_rc.borrow().source_hook.clone();
  let resolved = match hook {
    Some(hook) => hook.resolve(Some(&base), &specifier),
    None => anyhow::Result::Err(anyhow::anyhow!("no module source hook installed")),
  };

  match resolved {
    Ok(path) => {
      let path = v8::String::new(scope, &path).unwrap();
      rv.set(path.into());
    }
    Err(e) => {
      let message = v8::String::new(scope, &e.to_string()).unwrap();
      let exception = v8::Exception::type_error(scope, message);
      scope.throw_exception(exception);
    }
  }
}

/// Called when a promise rejects with no rejection handler specified.
pub(crate) extern "C" fn promise_reject_cb(message: v8::PromiseRejectMessage) {
  let scope = &mut unsafe { v8::CallbackScope::new(&message) };
  let undefined = v8::undefined(scope).into();
  let event = message.get_event();

  use v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject;
  use v8::PromiseRejectEvent::PromiseRejectAfterResolved;
  use v8::PromiseRejectEvent::PromiseRejectWithNoHandler;
  use v8::PromiseRejectEvent::PromiseResolveAfterResolved;

  let reason = match event {
    PromiseHandlerAddedAfterReject | PromiseRejectAfterResolved | PromiseResolveAfterResolved => {
      undefined
    }
    PromiseRejectWithNoHandler => message.get_value().unwrap(),
  };

  let promise = message.get_promise();
  let promise = v8::Global::new(scope, promise);

  let state_rc = Engine::state(scope);
  let mut state = state_rc.borrow_mut();

  match event {
    PromiseRejectWithNoHandler => {
      let reason = v8::Global::new(scope, reason);
      state.exceptions.capture_promise_rejection(promise, reason);
    }
    PromiseHandlerAddedAfterReject => {
      state.exceptions.remove_promise_rejection(&promise);
    }
    PromiseRejectAfterResolved | PromiseResolveAfterResolved => {}
  }
}
