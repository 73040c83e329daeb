//! Module natives backing the synthesized `require`.

use crate::js::binding::{arg_string, runtime_state};
use crate::js::engine::{CallArgs, Scope, Value};
use crate::js::module::cjs;

/// `requireFrom(specifier, referrer)` — the body of every per-module
/// `require` closure.
pub fn require_from(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let specifier = arg_string(scope, args, 0)?;
  let referrer = arg_string(scope, args, 1).ok();
  cjs::require(scope, referrer.as_deref(), &specifier)
}

/// `resolveFrom(specifier, referrer)` — `require.resolve`.
pub fn resolve_from(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let specifier = arg_string(scope, args, 0)?;
  let referrer = arg_string(scope, args, 1).ok();

  let state = runtime_state(scope);
  let resolver = state.borrow().resolver.clone();
  let path = resolver
    .resolve(referrer.as_deref(), &specifier)
    .map_err(|e| e.to_string())?;
  Ok(scope.string(&path))
}

/// `requirePath(path)` — loads an already-resolved path; used by the ESM
/// interop wrapper for CommonJS files.
pub fn require_path(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let path = arg_string(scope, args, 0)?;
  cjs::load_module(scope, &path)
}
