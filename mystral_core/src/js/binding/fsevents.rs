//! File watch natives.

use crate::js::binding::{arg_f64, arg_function, arg_string, runtime_state};
use crate::js::engine::{CallArgs, Scope, Value};

use std::path::PathBuf;

/// `watchPath(path, callback) -> id`
pub fn watch_path(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let path = arg_string(scope, args, 0)?;
  let callback = arg_function(scope, args, 1)?;

  let protected = scope.protect(&callback);
  let state = runtime_state(scope);

  let id = {
    let state = state.borrow();
    let mut io = state.io.borrow_mut();
    io.watcher
      .watch(&PathBuf::from(&path))
      .map_err(|e| e.to_string())?
  };

  state.borrow_mut().watch_callbacks.insert(id, protected);
  Ok(scope.number(id as f64))
}

/// `unwatchPath(id)`; the watch stops and no further events fire.
pub fn unwatch_path(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  if let Ok(id) = arg_f64(scope, args, 0) {
    let id = id as u64;
    let state = runtime_state(scope);
    {
      let state = state.borrow();
      state.io.borrow_mut().watcher.unwatch(id);
    }
    // Dropping the table entry releases the protected callback.
    state.borrow_mut().watch_callbacks.remove(&id);
  }
  Ok(scope.undefined())
}
