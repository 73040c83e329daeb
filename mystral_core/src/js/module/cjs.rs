//! CommonJS loading.
//!
//! Sources are wrapped as
//! `(function (exports, require, module, __filename, __dirname) { … })`
//! and invoked with a synthesized `require` anchored at the module's own
//! path. Module objects are cached by absolute path and published before
//! evaluation, so cyclic requires observe the partially populated
//! `exports` (node semantics).

use crate::js::engine::{Scope, Value};
use crate::js::module::{load_transpiled, ModuleFormat};
use crate::js::JsRuntimeState;
use crate::prelude::*;

use std::cell::RefCell;
use std::path::Path;

/// Resolve `specifier` against `referrer` and load it as a CommonJS-style
/// dependency. This is the native backing of `require`.
pub fn require(
  scope: &mut Scope,
  referrer: Option<&str>,
  specifier: &str,
) -> Result<Value, String> {
  let state = scope.host_state::<RefCell<JsRuntimeState>>();
  let resolver = state.borrow().resolver.clone();
  let path = resolver
    .resolve(referrer, specifier)
    .map_err(|e| e.to_string())?;
  load_module(scope, &path)
}

/// Loads an already-resolved path in CommonJS mode, returning
/// `module.exports`.
pub fn load_module(scope: &mut Scope, path: &str) -> Result<Value, String> {
  let state = scope.host_state::<RefCell<JsRuntimeState>>();
  let resolver = state.borrow().resolver.clone();

  if let Some(module) = state.borrow().cjs_cache.get(path).cloned() {
    let exports = scope.get(&module, "exports");
    return Ok(exports.unwrap_or_else(|| scope.undefined()));
  }

  match resolver.format_of(path) {
    ModuleFormat::Json => {
      let text = resolver.load_text(path).map_err(|e| e.to_string())?;
      let parsed = scope
        .json_parse(&text)
        .ok_or_else(|| format!("Invalid JSON module {path:?}"))?;
      let module = scope.create_object();
      scope.set(&module, "exports", &parsed);
      state
        .borrow_mut()
        .cjs_cache
        .insert(path.to_string(), module);
      Ok(parsed)
    }
    ModuleFormat::Esm => Err(format!(
      "Cannot require an ES module {path:?}; use import instead"
    )),
    ModuleFormat::Cjs => {
      let source = load_transpiled(&resolver, path).map_err(|e| e.to_string())?;
      let wrapped = format!(
        "(function (exports, require, module, __filename, __dirname) {{\n{source}\n}})"
      );
      let function = scope.eval_script(path, &wrapped).map_err(|e| e.to_string())?;

      let module = scope.create_object();
      let exports = scope.create_object();
      scope.set(&module, "exports", &exports);
      let filename = scope.string(path);
      scope.set(&module, "filename", &filename);

      // Publish before evaluation so cycles terminate.
      state
        .borrow_mut()
        .cjs_cache
        .insert(path.to_string(), module.clone());

      let require_fn = make_require(scope, path)?;
      let dirname = Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
      let dirname = scope.string(&dirname);

      let result = scope.call(
        &function,
        Some(&exports),
        &[
          exports.clone(),
          require_fn,
          module.clone(),
          filename,
          dirname,
        ],
      );
      if let Err(e) = result {
        // A failed module must not stay cached.
        state.borrow_mut().cjs_cache.remove(path);
        return Err(e.to_string());
      }

      let exports = scope.get(&module, "exports");
      Ok(exports.unwrap_or_else(|| scope.undefined()))
    }
  }
}

// Per-module `require`, built by the JS glue so the referrer path travels
// in a closure.
fn make_require(scope: &mut Scope, referrer: &str) -> Result<Value, String> {
  let global = scope.global();
  let internal = scope
    .get(&global, "__MystralGlobal")
    .ok_or("runtime globals are not installed")?;
  let bind = scope
    .get(&internal, "bindRequire")
    .ok_or("runtime glue is not installed")?;
  let referrer = scope.string(referrer);
  scope
    .call(&bind, None, &[referrer])
    .map_err(|e| e.to_string())
}
