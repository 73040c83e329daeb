//! Native bindings.
//!
//! Low-level natives live on one internal global object
//! (`__MystralGlobal`); the builtin JS layer in `src/js/runtime/` shapes
//! them into the web surface scripts see (console, timers, fetch,
//! document, audio graph).

pub mod audio;
pub mod fetch;
pub mod fsevents;
pub mod require;
pub mod timers;

use crate::js::engine::{CallArgs, Engine, NativeFn, Scope, Value};
use crate::js::JsRuntimeState;
use crate::prelude::*;

use std::cell::RefCell;
use std::ffi::c_void;

static RUNTIME_SCRIPTS: &[(&str, &str)] = &[
  ("mystral:runtime/10__web.js", include_str!("./runtime/10__web.js")),
  ("mystral:runtime/20__dom.js", include_str!("./runtime/20__dom.js")),
  (
    "mystral:runtime/30__audio.js",
    include_str!("./runtime/30__audio.js"),
  ),
];

/// Creates a function from `f` and installs it on `object` as `name`.
pub(crate) fn set_function_to(scope: &mut Scope, object: &Value, name: &str, f: NativeFn) {
  let function = scope.create_function(f);
  scope.set(object, name, &function);
}

/// Wraps a registry id into a host object via private data, pairing the
/// script wrapper with its native resource.
pub(crate) fn wrap_handle(scope: &mut Scope, id: u64) -> Value {
  let object = scope.create_host_object();
  scope.set_private_data(&object, id as *mut c_void);
  object
}

pub(crate) fn unwrap_handle(scope: &mut Scope, value: &Value) -> Option<u64> {
  scope.get_private_data(value).map(|ptr| ptr as u64)
}

/// Installs the internal global object plus the builtin JS layer.
pub fn install(engine: &mut Engine) {
  engine.with_scope(|scope| {
    let global = scope.global();
    let internal = scope.create_object();
    scope.set(&global, "__MystralGlobal", &internal);

    set_function_to(scope, &internal, "print", print);
    set_function_to(scope, &internal, "performanceNow", performance_now);
    set_function_to(scope, &internal, "processInfo", process_info);
    set_function_to(scope, &internal, "processExit", process_exit);
    set_function_to(scope, &internal, "canvasSize", canvas_size);
    set_function_to(scope, &internal, "canvasSetClearColor", canvas_set_clear_color);
    set_function_to(scope, &internal, "gpuInfo", gpu_info);
    set_function_to(scope, &internal, "readEmbeddedFile", read_embedded_file);
    set_function_to(scope, &internal, "utf8Decode", utf8_decode);

    set_function_to(scope, &internal, "createTimer", timers::create_timer);
    set_function_to(scope, &internal, "clearTimer", timers::clear_timer);
    set_function_to(scope, &internal, "createRaf", timers::create_raf);
    set_function_to(scope, &internal, "cancelRaf", timers::cancel_raf);

    set_function_to(scope, &internal, "fetchStart", fetch::fetch_start);

    set_function_to(scope, &internal, "watchPath", fsevents::watch_path);
    set_function_to(scope, &internal, "unwatchPath", fsevents::unwatch_path);

    set_function_to(scope, &internal, "requireFrom", require::require_from);
    set_function_to(scope, &internal, "resolveFrom", require::resolve_from);
    set_function_to(scope, &internal, "requirePath", require::require_path);

    set_function_to(scope, &internal, "audioNewContext", audio::new_context);
    set_function_to(scope, &internal, "audioContextInfo", audio::context_info);
    set_function_to(scope, &internal, "audioContextResume", audio::context_resume);
    set_function_to(scope, &internal, "audioContextSuspend", audio::context_suspend);
    set_function_to(scope, &internal, "audioContextClose", audio::context_close);
    set_function_to(scope, &internal, "audioCreateBuffer", audio::create_buffer);
    set_function_to(scope, &internal, "audioDecode", audio::decode);
    set_function_to(scope, &internal, "audioBufferInfo", audio::buffer_info);
    set_function_to(scope, &internal, "audioCopyToChannel", audio::copy_to_channel);
    set_function_to(scope, &internal, "audioGetChannelData", audio::get_channel_data);
    set_function_to(scope, &internal, "audioNewSource", audio::new_source);
    set_function_to(scope, &internal, "audioSourceConfig", audio::source_config);
    set_function_to(scope, &internal, "audioSourceSetBuffer", audio::source_set_buffer);
    set_function_to(scope, &internal, "audioSourceSetGains", audio::source_set_gains);
    set_function_to(scope, &internal, "audioSourceStart", audio::source_start);
    set_function_to(scope, &internal, "audioSourceStop", audio::source_stop);
    set_function_to(scope, &internal, "audioGainCreate", audio::gain_create);
    set_function_to(scope, &internal, "audioGainSet", audio::gain_set);
  });

  for (name, source) in RUNTIME_SCRIPTS {
    if let Err(e) = engine.eval_script(name, source) {
      error!("Failed to evaluate builtin script {name}: {e:?}");
      eprintln!("Failed to evaluate builtin script {name}: {e:?}");
      std::process::exit(1);
    }
  }
}

// Argument helpers {

pub(crate) fn arg_string(scope: &mut Scope, args: &CallArgs, index: usize) -> Result<String, String> {
  let value = args
    .get(index)
    .ok_or_else(|| format!("missing argument {index}"))?;
  Ok(scope.to_string_lossy(value))
}

pub(crate) fn arg_f64(scope: &mut Scope, args: &CallArgs, index: usize) -> Result<f64, String> {
  let value = args
    .get(index)
    .ok_or_else(|| format!("missing argument {index}"))?;
  scope
    .to_number(value)
    .ok_or_else(|| format!("argument {index} is not a number"))
}

pub(crate) fn arg_function(scope: &mut Scope, args: &CallArgs, index: usize) -> Result<Value, String> {
  let value = args
    .get(index)
    .ok_or_else(|| format!("missing argument {index}"))?;
  if !scope.is_function(value) {
    return Err(format!("argument {index} is not a function"));
  }
  Ok(value.clone())
}

pub(crate) fn runtime_state(scope: &mut Scope) -> std::rc::Rc<RefCell<JsRuntimeState>> {
  scope.host_state::<RefCell<JsRuntimeState>>()
}

// Argument helpers }

// Console backend: (level, text) forwarded to host log, stdout/stderr and
// any attached debug client.
fn print(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let level = arg_string(scope, args, 0)?;
  let text = arg_string(scope, args, 1)?;

  let state = runtime_state(scope);
  let state = state.borrow();

  match level.as_str() {
    "error" => {
      error!("console: {text}");
      eprintln!("{text}");
    }
    "warn" => {
      warn!("console: {text}");
      eprintln!("{text}");
    }
    _ => {
      debug!("console: {text}");
      if !state.opts.quiet {
        println!("{text}");
      }
    }
  }

  if let Some(events) = &state.dbg_events {
    let _ = events.send(crate::dbg::DbgEvent::Console {
      level: level.clone(),
      text: text.clone(),
    });
  }
  drop(state);

  Ok(scope.undefined())
}

fn performance_now(scope: &mut Scope, _args: &CallArgs) -> Result<Value, String> {
  let state = runtime_state(scope);
  let elapsed = state.borrow().startup_moment.elapsed().as_secs_f64() * 1000.0;
  Ok(scope.number(elapsed))
}

fn process_info(scope: &mut Scope, _args: &CallArgs) -> Result<Value, String> {
  let state = runtime_state(scope);
  let time_origin = state.borrow().time_origin as f64;

  let info = scope.create_object();

  let argv: Vec<Value> = std::env::args().map(|a| scope.string(&a)).collect();
  let argv = scope.create_array(&argv);
  scope.set(&info, "argv", &argv);

  let env = scope.create_object();
  for (key, value) in std::env::vars() {
    let value = scope.string(&value);
    scope.set(&env, &key, &value);
  }
  scope.set(&info, "env", &env);

  let time_origin = scope.number(time_origin);
  scope.set(&info, "timeOrigin", &time_origin);

  let platform = scope.string(std::env::consts::OS);
  scope.set(&info, "platform", &platform);

  Ok(info)
}

/// Records the exit code and raises the quit flag; the loop exits at the
/// end of the current frame step, after present.
fn process_exit(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let code = arg_f64(scope, args, 0).unwrap_or(0.0) as i32;
  let state = runtime_state(scope);
  state.borrow_mut().exit_code = Some(code);
  Ok(scope.undefined())
}

fn canvas_size(scope: &mut Scope, _args: &CallArgs) -> Result<Value, String> {
  let state = runtime_state(scope);
  let (width, height) = {
    let state = state.borrow();
    (state.canvas_width, state.canvas_height)
  };
  let values = [scope.number(width as f64), scope.number(height as f64)];
  Ok(scope.create_array(&values))
}

// The canvas webgpu-context seam: scripts pick the color the presented
// target is cleared to. Real render passes come from the external WebGPU
// bindings layer.
fn canvas_set_clear_color(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let r = arg_f64(scope, args, 0)?;
  let g = arg_f64(scope, args, 1)?;
  let b = arg_f64(scope, args, 2)?;
  let a = arg_f64(scope, args, 3).unwrap_or(1.0);

  let state = runtime_state(scope);
  state.borrow_mut().clear_color = [r, g, b, a];
  Ok(scope.undefined())
}

fn gpu_info(scope: &mut Scope, _args: &CallArgs) -> Result<Value, String> {
  let state = runtime_state(scope);
  let indirect_first_instance = state.borrow().gpu_indirect_first_instance;

  let info = scope.create_object();
  let flag = scope.boolean(indirect_first_instance);
  scope.set(&info, "indirectFirstInstance", &flag);
  Ok(info)
}

/// Lossy UTF-8 decode of a typed array, for `Response.text()`.
fn utf8_decode(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let value = args.get(0).cloned().ok_or("missing bytes argument")?;
  let bytes = scope
    .typed_array_bytes(&value)
    .ok_or("utf8Decode: typed array required")?;
  let text = String::from_utf8_lossy(&bytes).to_string();
  Ok(scope.string(&text))
}

fn read_embedded_file(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let path = arg_string(scope, args, 0)?;
  let state = runtime_state(scope);
  let bundle = state.borrow().resolver.bundle().cloned();

  let bundle = bundle.ok_or("no embedded bundle present")?;
  let bytes = bundle.read_file(&path).map_err(|e| e.to_string())?;
  Ok(scope.create_uint8_array_external(bytes))
}
