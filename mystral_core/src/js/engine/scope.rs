//! Execution scope and value handles.

use crate::js::engine::{hook, Engine};
use crate::js::err::JsError;

use std::any::Any;
use std::cell::Cell;
use std::ffi::c_void;
use std::rc::Rc;

/// An opaque handle to a script value. Owned by the engine's GC; identity
/// equality under the engine. Cheap to clone; cloning does not affect the
/// protect count.
#[derive(Clone)]
pub struct Value(pub(crate) v8::Global<v8::Value>);

impl Value {
  pub(crate) fn from_local(scope: &mut v8::HandleScope, local: v8::Local<v8::Value>) -> Self {
    Value(v8::Global::new(scope, local))
  }

  pub(crate) fn open<'s>(&self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Value> {
    v8::Local::new(scope, &self.0)
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0
  }
}

/// A rooted script value. Each [`Scope::protect`] increments the engine's
/// root count; the matching decrement happens exactly once, when the handle
/// is dropped (or explicitly via [`Protected::release`]).
pub struct Protected {
  value: Value,
  roots: Rc<Cell<usize>>,
}

impl Protected {
  pub fn value(&self) -> &Value {
    &self.value
  }

  /// Explicit unprotect. Dropping has the same effect; this form reads
  /// better at sites where the release is the point.
  pub fn release(self) {}
}

impl Drop for Protected {
  fn drop(&mut self) {
    let n = self.roots.get();
    debug_assert!(n > 0);
    self.roots.set(n.saturating_sub(1));
  }
}

/// Arguments passed to a native function implementation.
pub struct CallArgs {
  pub this: Value,
  pub args: Vec<Value>,
}

impl CallArgs {
  pub fn get(&self, index: usize) -> Option<&Value> {
    self.args.get(index)
  }

  pub fn len(&self) -> usize {
    self.args.len()
  }

  pub fn is_empty(&self) -> bool {
    self.args.is_empty()
  }
}

/// A native function callable from script. Returning `Err` throws the
/// message as an `Error` into the calling script.
pub type NativeFn = fn(&mut Scope, &CallArgs) -> Result<Value, String>;

// Single trampoline behind every native function; the actual callable is
// carried in the function's data slot as an external pointer.
fn native_fn_trampoline(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let external = v8::Local::<v8::External>::try_from(args.data()).unwrap();
  let f: NativeFn = unsafe { std::mem::transmute(external.value()) };

  let this: v8::Local<v8::Value> = args.this().into();
  let this = Value::from_local(scope, this);
  let mut call_args = Vec::with_capacity(args.length() as usize);
  for i in 0..args.length() {
    let arg = args.get(i);
    call_args.push(Value::from_local(scope, arg));
  }
  let call_args = CallArgs {
    this,
    args: call_args,
  };

  let result = {
    let mut wrapped = Scope::new(scope);
    f(&mut wrapped, &call_args)
  };

  match result {
    Ok(value) => {
      let local = value.open(scope);
      rv.set(local);
    }
    Err(message) => {
      let message = v8::String::new(scope, &message).unwrap();
      let exception = v8::Exception::error(scope, message);
      scope.throw_exception(exception);
    }
  }
}

/// An execution scope. Every engine operation the host performs goes
/// through one of these; native callbacks receive one as their first
/// argument.
pub struct Scope<'a, 'i> {
  pub(crate) v8: &'a mut v8::HandleScope<'i>,
}

impl<'a, 'i> Scope<'a, 'i> {
  pub(crate) fn new(scope: &'a mut v8::HandleScope<'i>) -> Self {
    Scope { v8: scope }
  }

  // Value constructors {

  pub fn undefined(&mut self) -> Value {
    let local = v8::undefined(self.v8);
    Value::from_local(self.v8, local.into())
  }

  pub fn null(&mut self) -> Value {
    let local = v8::null(self.v8);
    Value::from_local(self.v8, local.into())
  }

  pub fn boolean(&mut self, value: bool) -> Value {
    let local = v8::Boolean::new(self.v8, value);
    Value::from_local(self.v8, local.into())
  }

  pub fn number(&mut self, value: f64) -> Value {
    let local = v8::Number::new(self.v8, value);
    Value::from_local(self.v8, local.into())
  }

  pub fn string(&mut self, value: &str) -> Value {
    let local = v8::String::new(self.v8, value).unwrap();
    Value::from_local(self.v8, local.into())
  }

  pub fn create_object(&mut self) -> Value {
    let local = v8::Object::new(self.v8);
    Value::from_local(self.v8, local.into())
  }

  /// An object with one internal slot for private data (see
  /// [`Scope::set_private_data`]). Used to pair script wrappers with native
  /// resources.
  pub fn create_host_object(&mut self) -> Value {
    let template = v8::ObjectTemplate::new(self.v8);
    template.set_internal_field_count(1);
    let local = template.new_instance(self.v8).unwrap();
    Value::from_local(self.v8, local.into())
  }

  pub fn create_array(&mut self, items: &[Value]) -> Value {
    let array = v8::Array::new(self.v8, items.len() as i32);
    for (i, item) in items.iter().enumerate() {
      let local = item.open(self.v8);
      array.set_index(self.v8, i as u32, local);
    }
    Value::from_local(self.v8, array.into())
  }

  pub fn create_function(&mut self, f: NativeFn) -> Value {
    let external = v8::External::new(self.v8, f as usize as *mut c_void);
    let builder = v8::FunctionBuilder::new(native_fn_trampoline).data(external.into());
    let function = v8::FunctionBuilder::<v8::Function>::build(builder, self.v8).unwrap();
    Value::from_local(self.v8, function.into())
  }

  /// An `Error` object carrying `message`, as a value (not thrown).
  pub fn create_error(&mut self, message: &str) -> Value {
    let message = v8::String::new(self.v8, message).unwrap();
    let local = v8::Exception::error(self.v8, message);
    Value::from_local(self.v8, local)
  }

  // Value constructors }

  // Typed arrays {

  /// A `Uint8Array` copying `data` into the engine heap.
  pub fn create_uint8_array(&mut self, data: &[u8]) -> Value {
    self.create_uint8_array_external(data.to_vec())
  }

  /// A `Uint8Array` whose storage is the given buffer, transferred without
  /// copying. The engine's backing store owns the buffer from here on, so
  /// the storage cannot outlive its producer by construction.
  pub fn create_uint8_array_external(&mut self, data: Vec<u8>) -> Value {
    let len = data.len();
    let store = v8::ArrayBuffer::new_backing_store_from_vec(data).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(self.v8, &store);
    let array = v8::Uint8Array::new(self.v8, buffer, 0, len).unwrap();
    Value::from_local(self.v8, array.into())
  }

  /// An `ArrayBuffer` over the given bytes, transferred without copying.
  pub fn create_array_buffer_external(&mut self, data: Vec<u8>) -> Value {
    let store = v8::ArrayBuffer::new_backing_store_from_vec(data).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(self.v8, &store);
    Value::from_local(self.v8, buffer.into())
  }

  /// A `Float32Array` copying `data`.
  pub fn create_float32_array(&mut self, data: &[f32]) -> Value {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for sample in data {
      bytes.extend_from_slice(&sample.to_ne_bytes());
    }
    let len = data.len();
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(self.v8, &store);
    let array = v8::Float32Array::new(self.v8, buffer, 0, len).unwrap();
    Value::from_local(self.v8, array.into())
  }

  /// A `Uint32Array` copying `data`.
  pub fn create_uint32_array(&mut self, data: &[u32]) -> Value {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for item in data {
      bytes.extend_from_slice(&item.to_ne_bytes());
    }
    let len = data.len();
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(self.v8, &store);
    let array = v8::Uint32Array::new(self.v8, buffer, 0, len).unwrap();
    Value::from_local(self.v8, array.into())
  }

  /// Copies the bytes out of a typed-array view or an `ArrayBuffer`.
  pub fn typed_array_bytes(&mut self, value: &Value) -> Option<Vec<u8>> {
    let local = value.open(self.v8);
    if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(local) {
      let mut buffer = vec![0u8; view.byte_length()];
      view.copy_contents(&mut buffer);
      return Some(buffer);
    }
    if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(local) {
      let store = buffer.get_backing_store();
      let len = store.byte_length();
      let mut bytes = vec![0u8; len];
      if let Some(data) = store.data() {
        let src = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) };
        bytes.copy_from_slice(src);
      }
      return Some(bytes);
    }
    None
  }

  /// Copies a script-side `Float32Array` (or any byte source) out as floats.
  pub fn read_float32_array(&mut self, value: &Value) -> Option<Vec<f32>> {
    let bytes = self.typed_array_bytes(value)?;
    let mut floats = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
      floats.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(floats)
  }

  // Typed arrays }

  // Property access {

  /// The context's global object.
  pub fn global(&mut self) -> Value {
    let context = self.v8.get_current_context();
    let global = context.global(self.v8);
    Value::from_local(self.v8, global.into())
  }

  pub fn get(&mut self, object: &Value, key: &str) -> Option<Value> {
    let local = object.open(self.v8);
    let object = v8::Local::<v8::Object>::try_from(local).ok()?;
    let key = v8::String::new(self.v8, key).unwrap();
    let value = object.get(self.v8, key.into())?;
    Some(Value::from_local(self.v8, value))
  }

  pub fn set(&mut self, object: &Value, key: &str, value: &Value) {
    let local = object.open(self.v8);
    if let Ok(object) = v8::Local::<v8::Object>::try_from(local) {
      let key = v8::String::new(self.v8, key).unwrap();
      let value = value.open(self.v8);
      object.set(self.v8, key.into(), value);
    }
  }

  pub fn get_index(&mut self, object: &Value, index: u32) -> Option<Value> {
    let local = object.open(self.v8);
    let object = v8::Local::<v8::Object>::try_from(local).ok()?;
    let value = object.get_index(self.v8, index)?;
    Some(Value::from_local(self.v8, value))
  }

  pub fn set_index(&mut self, object: &Value, index: u32, value: &Value) {
    let local = object.open(self.v8);
    if let Ok(object) = v8::Local::<v8::Object>::try_from(local) {
      let value = value.open(self.v8);
      object.set_index(self.v8, index, value);
    }
  }

  pub fn array_length(&mut self, value: &Value) -> Option<u32> {
    let local = value.open(self.v8);
    v8::Local::<v8::Array>::try_from(local)
      .ok()
      .map(|a| a.length())
  }

  // Property access }

  // Calls and evaluation {

  /// Calls `func` with the given receiver and arguments. A thrown
  /// exception is caught and returned, never left pending.
  pub fn call(
    &mut self,
    func: &Value,
    this: Option<&Value>,
    args: &[Value],
  ) -> Result<Value, JsError> {
    let local = func.open(self.v8);
    let function = match v8::Local::<v8::Function>::try_from(local) {
      Ok(function) => function,
      Err(_) => return Err(JsError::message("value is not callable")),
    };
    let recv: v8::Local<v8::Value> = match this {
      Some(this) => this.open(self.v8),
      None => v8::undefined(self.v8).into(),
    };
    let arg_locals: Vec<v8::Local<v8::Value>> =
      args.iter().map(|arg| arg.open(self.v8)).collect();

    let tc_scope = &mut v8::TryCatch::new(self.v8);
    match function.call(tc_scope, recv, &arg_locals) {
      Some(value) => Ok(Value::from_local(tc_scope, value)),
      None => {
        debug_assert!(tc_scope.has_caught());
        let exception = tc_scope.exception().unwrap();
        Err(JsError::from_v8_exception(tc_scope, exception, None))
      }
    }
  }

  /// Evaluates classic (non-module) JavaScript code.
  pub fn eval_script(&mut self, filename: &str, source: &str) -> Result<Value, JsError> {
    let origin = hook::create_origin(self.v8, filename, false);
    let source = v8::String::new(self.v8, source).unwrap();

    let tc_scope = &mut v8::TryCatch::new(self.v8);

    let script = match v8::Script::compile(tc_scope, source, Some(&origin)) {
      Some(script) => script,
      None => {
        debug_assert!(tc_scope.has_caught());
        let exception = tc_scope.exception().unwrap();
        return Err(JsError::from_v8_exception(tc_scope, exception, None));
      }
    };

    match script.run(tc_scope) {
      Some(value) => Ok(Value::from_local(tc_scope, value)),
      None => {
        debug_assert!(tc_scope.has_caught());
        let exception = tc_scope.exception().unwrap();
        Err(JsError::from_v8_exception(tc_scope, exception, None))
      }
    }
  }

  // Calls and evaluation }

  // Conversions and type tests {

  pub fn to_bool(&mut self, value: &Value) -> bool {
    let local = value.open(self.v8);
    local.boolean_value(self.v8)
  }

  pub fn to_number(&mut self, value: &Value) -> Option<f64> {
    let local = value.open(self.v8);
    local.number_value(self.v8)
  }

  pub fn to_i32(&mut self, value: &Value) -> Option<i32> {
    let local = value.open(self.v8);
    local.int32_value(self.v8)
  }

  pub fn to_string_lossy(&mut self, value: &Value) -> String {
    let local = value.open(self.v8);
    local.to_rust_string_lossy(self.v8)
  }

  pub fn is_undefined(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_undefined()
  }

  pub fn is_null(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_null()
  }

  pub fn is_boolean(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_boolean()
  }

  pub fn is_number(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_number()
  }

  pub fn is_string(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_string()
  }

  pub fn is_object(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_object()
  }

  pub fn is_array(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_array()
  }

  pub fn is_function(&mut self, value: &Value) -> bool {
    value.open(self.v8).is_function()
  }

  /// Parses a JSON document into a value.
  pub fn json_parse(&mut self, source: &str) -> Option<Value> {
    let source = v8::String::new(self.v8, source).unwrap();
    let tc_scope = &mut v8::TryCatch::new(self.v8);
    let value = v8::json::parse(tc_scope, source)?;
    Some(Value::from_local(tc_scope, value))
  }

  /// Stringifies a value as JSON; `None` for values JSON cannot express.
  pub fn json_stringify(&mut self, value: &Value) -> Option<String> {
    let local = value.open(self.v8);
    let result = v8::json::stringify(self.v8, local)?;
    Some(result.to_rust_string_lossy(self.v8))
  }

  // Conversions and type tests }

  // Lifetime management {

  /// Roots `value` against GC. See [`Protected`].
  pub fn protect(&mut self, value: &Value) -> Protected {
    let state = Engine::state(self.v8);
    let roots = state.borrow().roots.clone();
    roots.set(roots.get() + 1);
    Protected {
      value: value.clone(),
      roots,
    }
  }

  // Lifetime management }

  // Private data {

  /// Attaches a native pointer to an object created with
  /// [`Scope::create_host_object`].
  pub fn set_private_data(&mut self, object: &Value, data: *mut c_void) -> bool {
    let local = object.open(self.v8);
    if let Ok(object) = v8::Local::<v8::Object>::try_from(local) {
      if object.internal_field_count() > 0 {
        let external = v8::External::new(self.v8, data);
        return object.set_internal_field(0, external.into());
      }
    }
    false
  }

  /// Fetches the native pointer previously attached to `object`.
  pub fn get_private_data(&mut self, object: &Value) -> Option<*mut c_void> {
    let local = object.open(self.v8);
    let object = v8::Local::<v8::Object>::try_from(local).ok()?;
    if object.internal_field_count() == 0 {
      return None;
    }
    let field = object.get_internal_field(self.v8, 0)?;
    let external = v8::Local::<v8::External>::try_from(field).ok()?;
    Some(external.value())
  }

  // Private data }

  // Exceptions {

  /// Throws `message` as an `Error` into the current execution.
  pub fn throw_error(&mut self, message: &str) {
    let message = v8::String::new(self.v8, message).unwrap();
    let exception = v8::Exception::error(self.v8, message);
    self.v8.throw_exception(exception);
  }

  pub fn throw_type_error(&mut self, message: &str) {
    let message = v8::String::new(self.v8, message).unwrap();
    let exception = v8::Exception::type_error(self.v8, message);
    self.v8.throw_exception(exception);
  }

  // Exceptions }

  /// Host state parked in the engine (see [`Engine::set_host_slot`]).
  pub fn host_state<T: 'static>(&mut self) -> Rc<T> {
    let state = Engine::state(self.v8);
    let slot = state
      .borrow()
      .host_slot
      .clone()
      .expect("host slot not installed");
    slot.downcast::<T>().expect("host slot type mismatch")
  }
}

/// Downcast helper so callers can name the concrete host type once.
pub fn host_state_of<T: 'static>(slot: &Rc<dyn Any>) -> Rc<T> {
  slot.clone().downcast::<T>().expect("host slot type mismatch")
}
