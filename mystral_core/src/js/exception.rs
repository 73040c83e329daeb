//! Uncaught exception and unhandled rejection bookkeeping.

/// Exceptions captured outside any `TryCatch`: uncaught throws from
/// callbacks, and promise rejections that never gained a handler.
pub struct ExceptionState {
  /// The most recent uncaught exception, if any.
  pub exception: Option<v8::Global<v8::Value>>,
  promise_rejections: Vec<(v8::Global<v8::Promise>, v8::Global<v8::Value>)>,
}

impl ExceptionState {
  pub fn new() -> Self {
    ExceptionState {
      exception: None,
      promise_rejections: Vec::new(),
    }
  }

  pub fn capture_exception(&mut self, exception: v8::Global<v8::Value>) {
    if self.exception.is_none() {
      self.exception = Some(exception);
    }
  }

  pub fn capture_promise_rejection(
    &mut self,
    promise: v8::Global<v8::Promise>,
    reason: v8::Global<v8::Value>,
  ) {
    self.promise_rejections.push((promise, reason));
  }

  /// A handler was attached after the fact; the rejection is no longer
  /// unhandled.
  pub fn remove_promise_rejection(&mut self, promise: &v8::Global<v8::Promise>) {
    self.promise_rejections.retain(|(p, _)| p != promise);
  }

  /// Drops rejection entries carrying exactly this exception value. Used
  /// when the same exception is already being reported through another
  /// path (module evaluation).
  pub fn remove_promise_rejection_by_value(&mut self, exception: &v8::Global<v8::Value>) {
    self.promise_rejections.retain(|(_, e)| e != exception);
  }

  pub fn pop_promise_rejection(
    &mut self,
  ) -> Option<(v8::Global<v8::Promise>, v8::Global<v8::Value>)> {
    if self.promise_rejections.is_empty() {
      None
    } else {
      Some(self.promise_rejections.remove(0))
    }
  }

  pub fn has_promise_rejection(&self) -> bool {
    !self.promise_rejections.is_empty()
  }
}

impl Default for ExceptionState {
  fn default() -> Self {
    Self::new()
  }
}
