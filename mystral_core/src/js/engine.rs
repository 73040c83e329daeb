//! Script engine.
//!
//! The host talks to the interpreter exclusively through this module:
//! [`Engine`], [`Scope`], [`Value`], [`Protected`] and [`CallArgs`]. No
//! backend type leaks into the rest of the crate, which keeps the bindings,
//! the module system and the frame loop backend-agnostic.
//!
//! The backend is fixed at build time:
//!
//! - `jit` (default): optimizing backend with dynamic codegen enabled.
//! - `portable`: the same engine restricted to its bytecode interpreter
//!   (no dynamic codegen), for platforms where JIT pages are forbidden.
//!
//! Capability set (everything the host is allowed to assume):
//!
//! - Evaluate source as an ES module or as a classic script.
//! - Create primitives, objects, arrays, native-backed functions, and typed
//!   arrays (copying or external-backing).
//! - Property access by name and index; calls with an explicit `this`.
//! - Conversions to bool/number/string and narrow type tests.
//! - `protect`/`unprotect` as a paired root count ([`Protected`] releases on
//!   drop and the live count is observable for tests).
//! - Private data: a native pointer attached to engine objects created via
//!   [`Scope::create_host_object`].
//! - Pending-exception report/clear/throw.
//!
//! ES module loading is engine-internal: the host installs a [`SourceHook`]
//! and the engine drives resolution and loading through it, including
//! dynamic `import()` and `import.meta`.

pub mod hook;
pub mod scope;

pub use scope::{CallArgs, NativeFn, Protected, Scope, Value};

use crate::js::err::JsError;
use crate::js::exception::ExceptionState;
use crate::prelude::*;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

/// Resolves and loads module sources for the engine's ES module machinery.
///
/// `resolve` turns a specifier plus an optional referrer path into an
/// absolute module path; `load` produces plain JavaScript source text for a
/// resolved path (transpilation happens behind this hook).
pub trait SourceHook {
  fn resolve(&self, base: Option<&str>, specifier: &str) -> AnyResult<String>;
  fn load(&self, path: &str) -> AnyResult<String>;
}

/// Module path inside the engine's module index.
pub type ModulePath = String;

/// Engine-internal index of compiled ES modules.
///
/// Keyed by absolute resolved path; the first disk-backed insert becomes the
/// main module (used for `import.meta.main`).
pub struct ModuleIndex {
  main: Option<ModulePath>,
  index: HashMap<ModulePath, v8::Global<v8::Module>>,
}

impl ModuleIndex {
  pub fn new() -> Self {
    Self {
      main: None,
      index: HashMap::new(),
    }
  }

  pub fn main(&self) -> Option<&ModulePath> {
    self.main.as_ref()
  }

  pub fn insert(&mut self, path: &str, module: v8::Global<v8::Module>) {
    if self.main.is_none() && std::fs::metadata(path).is_ok() {
      self.main = Some(path.into());
    }
    self.index.insert(path.into(), module);
  }

  pub fn get(&self, path: &str) -> Option<v8::Global<v8::Module>> {
    self.index.get(path).cloned()
  }

  pub fn contains(&self, path: &str) -> bool {
    self.index.contains_key(path)
  }

  /// Reverse lookup: the path a compiled module was registered under.
  pub fn get_path(&self, module: v8::Global<v8::Module>) -> Option<ModulePath> {
    self
      .index
      .iter()
      .find(|(_, m)| **m == module)
      .map(|(p, _)| p.clone())
  }

  pub fn clear(&mut self) {
    self.main = None;
    self.index.clear();
  }
}

impl Default for ModuleIndex {
  fn default() -> Self {
    Self::new()
  }
}

/// The state stored per engine instance, reachable from every callback.
pub struct EngineState {
  /// A sand-boxed execution context with its own set of built-in objects.
  pub context: v8::Global<v8::Context>,
  /// Holds information about resolved ES modules.
  pub module_index: ModuleIndex,
  /// Module resolution/loading hook installed by the host.
  pub source_hook: Option<Rc<dyn SourceHook>>,
  /// Stores and manages uncaught exceptions.
  pub exceptions: ExceptionState,
  /// Dynamic imports waiting to be fetched and resolved.
  pub dynamic_imports: Vec<(ModulePath, v8::Global<v8::PromiseResolver>)>,
  /// Live protected-handle count, paired increments/decrements.
  pub roots: Rc<Cell<usize>>,
  /// Host-owned state, downcast by the bindings via [`Scope::host_state`].
  pub host_slot: Option<Rc<dyn Any>>,
}

// Initialize the engine platform process-wide, exactly once.
fn init_platform() {
  static PLATFORM_INIT: Once = Once::new();
  PLATFORM_INIT.call_once(move || {
    if cfg!(feature = "portable") {
      // Interpreter-only execution; no dynamic codegen pages.
      v8::V8::set_flags_from_string("--jitless");
    }
    let platform = v8::new_default_platform(0, false).make_shared();
    v8::V8::initialize_platform(platform);
    v8::V8::initialize();
  });
}

/// The script engine instance. One per process; owns the heap and the
/// execution context. Not thread-safe, main thread only.
pub struct Engine {
  isolate: v8::OwnedIsolate,
}

impl Engine {
  pub fn new() -> Self {
    init_platform();

    let mut isolate = v8::Isolate::new(v8::CreateParams::default());

    isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
    isolate.set_promise_reject_callback(hook::promise_reject_cb);
    isolate.set_host_import_module_dynamically_callback(hook::host_import_module_dynamically_cb);
    isolate.set_host_initialize_import_meta_object_callback(
      hook::host_initialize_import_meta_object_cb,
    );

    let context = {
      let scope = &mut v8::HandleScope::new(&mut *isolate);
      let context = v8::Context::new(scope);
      v8::Global::new(scope, context)
    };

    isolate.set_slot(Rc::new(RefCell::new(EngineState {
      context,
      module_index: ModuleIndex::new(),
      source_hook: None,
      exceptions: ExceptionState::new(),
      dynamic_imports: Vec::new(),
      roots: Rc::new(Cell::new(0)),
      host_slot: None,
    })));

    Engine { isolate }
  }

  /// Returns the engine state stored in the given isolate.
  pub(crate) fn state(isolate: &v8::Isolate) -> Rc<RefCell<EngineState>> {
    isolate
      .get_slot::<Rc<RefCell<EngineState>>>()
      .unwrap()
      .clone()
  }

  pub(crate) fn get_state(&self) -> Rc<RefCell<EngineState>> {
    Self::state(&self.isolate)
  }

  /// Install the module source hook. Must happen before the first module
  /// evaluation.
  pub fn set_source_hook(&mut self, hook: Rc<dyn SourceHook>) {
    self.get_state().borrow_mut().source_hook = Some(hook);
  }

  /// Park host-owned state inside the engine so native callbacks can reach
  /// it (see [`Scope::host_state`]).
  pub fn set_host_slot(&mut self, slot: Rc<dyn Any>) {
    self.get_state().borrow_mut().host_slot = Some(slot);
  }

  /// Number of live protected handles. Every successful protect is paired
  /// with exactly one release.
  pub fn protected_count(&self) -> usize {
    self.get_state().borrow().roots.get()
  }

  /// Open an execution scope and run `f` inside it.
  pub fn with_scope<R>(&mut self, f: impl FnOnce(&mut Scope) -> R) -> R {
    let context = self.get_state().borrow().context.clone();
    let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context);
    let mut scope = Scope::new(scope);
    f(&mut scope)
  }

  /// Executes classic (non-module) JavaScript code.
  pub fn eval_script(&mut self, filename: &str, source: &str) -> Result<Value, JsError> {
    self.with_scope(|scope| scope.eval_script(filename, source))
  }

  /// Executes JavaScript code as an ES module.
  ///
  /// When `source` is `None` the module (and its whole static import tree)
  /// is resolved and loaded through the installed [`SourceHook`].
  pub fn eval_module(&mut self, filename: &str, source: Option<&str>) -> Result<(), JsError> {
    let context = self.get_state().borrow().context.clone();
    let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context);

    let tc_scope = &mut v8::TryCatch::new(scope);

    let module = match hook::fetch_module_tree(tc_scope, filename, source) {
      Some(module) => module,
      None => {
        debug_assert!(tc_scope.has_caught());
        let exception = tc_scope.exception().unwrap();
        return Err(JsError::from_v8_exception(tc_scope, exception, None));
      }
    };

    if module
      .instantiate_module(tc_scope, hook::module_resolve_cb)
      .is_none()
    {
      debug_assert!(tc_scope.has_caught());
      let exception = tc_scope.exception().unwrap();
      return Err(JsError::from_v8_exception(tc_scope, exception, None));
    }

    let _ = module.evaluate(tc_scope);

    if module.get_status() == v8::ModuleStatus::Errored {
      let exception = module.get_exception();
      // The same exception also lands in the promise-rejection table via the
      // reject hook; drop it there so it is not reported twice.
      let global_exception = v8::Global::new(tc_scope, exception);
      let state_rc = Engine::state(tc_scope);
      state_rc
        .borrow_mut()
        .exceptions
        .remove_promise_rejection_by_value(&global_exception);
      return Err(JsError::from_v8_exception(tc_scope, exception, None));
    }

    Ok(())
  }

  /// Drains the microtask queue.
  pub fn run_microtasks(&mut self) {
    let context = self.get_state().borrow().context.clone();
    let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context);
    scope.perform_microtask_checkpoint();
  }

  /// Fetches, evaluates and resolves any pending dynamic imports.
  ///
  /// Module sources are local (disk or bundle), so the tree is fetched
  /// synchronously here, between frames, never inside the import callback.
  pub fn tick_dynamic_imports(&mut self) {
    let state_rc = self.get_state();
    if state_rc.borrow().dynamic_imports.is_empty() {
      return;
    }

    let context = state_rc.borrow().context.clone();
    let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context);

    let pending: Vec<(ModulePath, v8::Global<v8::PromiseResolver>)> =
      state_rc.borrow_mut().dynamic_imports.drain(..).collect();

    for (specifier, resolver) in pending {
      let tc_scope = &mut v8::TryCatch::new(scope);
      let resolver = v8::Local::new(tc_scope, resolver);

      let module = match hook::fetch_module_tree(tc_scope, &specifier, None) {
        Some(module) => module,
        None => {
          debug_assert!(tc_scope.has_caught());
          let exception = tc_scope.exception().unwrap();
          resolver.reject(tc_scope, exception);
          continue;
        }
      };

      if module
        .instantiate_module(tc_scope, hook::module_resolve_cb)
        .is_none()
        || {
          let _ = module.evaluate(tc_scope);
          module.get_status() == v8::ModuleStatus::Errored
        }
      {
        let exception = if module.get_status() == v8::ModuleStatus::Errored {
          module.get_exception()
        } else {
          tc_scope.exception().unwrap()
        };
        let global_exception = v8::Global::new(tc_scope, exception);
        Engine::state(tc_scope)
          .borrow_mut()
          .exceptions
          .remove_promise_rejection_by_value(&global_exception);
        let exception = v8::Local::new(tc_scope, global_exception);
        resolver.reject(tc_scope, exception);
        continue;
      }

      // A dynamic import resolves with the module's namespace object.
      let namespace = module.get_module_namespace();
      resolver.resolve(tc_scope, namespace);
    }

    scope.perform_microtask_checkpoint();
  }

  /// Whether dynamic imports are waiting to be fetched.
  pub fn has_pending_imports(&self) -> bool {
    !self.get_state().borrow().dynamic_imports.is_empty()
  }

  /// Whether the engine itself still has queued background work.
  pub fn has_background_tasks(&self) -> bool {
    self.isolate.has_pending_background_tasks()
  }

  /// Drops every compiled module so the next evaluation reloads from the
  /// source hook. Used by script reload.
  pub fn clear_modules(&mut self) {
    let state_rc = self.get_state();
    let mut state = state_rc.borrow_mut();
    state.module_index.clear();
    state.dynamic_imports.clear();
  }

  /// Returns an error if an uncaught exception or an unhandled promise
  /// rejection has been captured since the last check, clearing it.
  pub fn check_exceptions(&mut self) -> Option<JsError> {
    let context = self.get_state().borrow().context.clone();
    let scope = &mut v8::HandleScope::with_context(&mut self.isolate, context);
    check_exceptions(scope)
  }
}

impl Default for Engine {
  fn default() -> Self {
    Self::new()
  }
}

/// Scope-level variant of [`Engine::check_exceptions`], usable from places
/// that already hold an execution scope.
pub(crate) fn check_exceptions(scope: &mut v8::HandleScope) -> Option<JsError> {
  let state_rc = Engine::state(scope);

  let maybe_exception = state_rc.borrow_mut().exceptions.exception.take();
  if let Some(exception) = maybe_exception {
    let exception = v8::Local::new(scope, exception);
    return Some(JsError::from_v8_exception(scope, exception, None));
  }

  let maybe_rejection = state_rc.borrow_mut().exceptions.pop_promise_rejection();
  if let Some((_promise, exception)) = maybe_rejection {
    let exception = v8::Local::new(scope, exception);
    return Some(JsError::from_v8_exception(
      scope,
      exception,
      Some("(in promise) "),
    ));
  }

  None
}
