//! Timer and animation-frame natives.

use crate::js::binding::{arg_f64, arg_function, runtime_state};
use crate::js::engine::{CallArgs, Scope, Value};
use crate::prelude::*;

use std::time::{Duration, Instant};

/// `createTimer(callback, delayMs, repeated, args) -> id`
pub fn create_timer(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let callback = arg_function(scope, args, 0)?;
  let delay = arg_f64(scope, args, 1).unwrap_or(0.0);
  let repeated = args.get(2).map(|v| scope.to_bool(v)).unwrap_or(false);

  let mut extra: Vec<Value> = Vec::new();
  if let Some(rest) = args.get(3) {
    let rest = rest.clone();
    if let Some(len) = scope.array_length(&rest) {
      for i in 0..len {
        if let Some(item) = scope.get_index(&rest, i) {
          extra.push(item);
        }
      }
    }
  }

  // Negative or zero delays schedule for the next step.
  let delay = Duration::from_micros((delay.max(0.0) * 1000.0) as u64);
  let period = repeated.then_some(delay);
  let protected = scope.protect(&callback);

  let state = runtime_state(scope);
  let id = state
    .borrow_mut()
    .timers
    .schedule(Instant::now(), delay, period, protected, extra);
  trace!("createTimer id:{id} delay:{delay:?} repeated:{repeated}");

  Ok(scope.number(id as f64))
}

/// `clearTimer(id)`; unknown ids are a no-op.
pub fn clear_timer(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  if let Ok(id) = arg_f64(scope, args, 0) {
    let state = runtime_state(scope);
    state.borrow_mut().timers.clear(id as u64);
    trace!("clearTimer id:{id}");
  }
  Ok(scope.undefined())
}

/// `createRaf(callback) -> id`
pub fn create_raf(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let callback = arg_function(scope, args, 0)?;
  let protected = scope.protect(&callback);

  let state = runtime_state(scope);
  let id = state.borrow_mut().raf.schedule(protected);
  Ok(scope.number(id as f64))
}

/// `cancelRaf(id)`; applies to the current frame's batch too.
pub fn cancel_raf(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  if let Ok(id) = arg_f64(scope, args, 0) {
    let state = runtime_state(scope);
    state.borrow_mut().raf.cancel(id as u64);
  }
  Ok(scope.undefined())
}
