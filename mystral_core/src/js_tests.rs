use crate::cli::RunOptions;
use crate::io::IoDriver;
use crate::js::module::Resolver;
use crate::js::JsRuntime;

use assert_fs::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

fn test_runtime() -> JsRuntime {
  let io = Rc::new(RefCell::new(IoDriver::new()));
  let resolver = Rc::new(Resolver::new(None));
  let time_origin = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap()
    .as_millis();
  JsRuntime::new(
    RunOptions {
      quiet: true,
      ..Default::default()
    },
    resolver,
    io,
    Instant::now(),
    time_origin,
  )
}

fn eval_number(runtime: &mut JsRuntime, source: &str) -> f64 {
  runtime
    .engine
    .with_scope(|scope| {
      let value = scope.eval_script("<test>", source).unwrap();
      scope.to_number(&value).unwrap()
    })
}

#[test]
fn eval_script_basics() {
  let mut runtime = test_runtime();
  assert_eq!(eval_number(&mut runtime, "1 + 2"), 3.0);

  let text = runtime.engine.with_scope(|scope| {
    let value = scope.eval_script("<test>", "'a' + 'b'").unwrap();
    scope.to_string_lossy(&value)
  });
  assert_eq!(text, "ab");
}

#[test]
fn eval_script_reports_exceptions() {
  let mut runtime = test_runtime();
  let err = runtime
    .engine
    .with_scope(|scope| scope.eval_script("<test>", "throw new Error('boom')"))
    .unwrap_err();
  assert!(err.to_string().contains("boom"), "{err}");
}

#[test]
fn web_globals_are_installed() {
  let mut runtime = test_runtime();
  for global in [
    "console",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
    "requestAnimationFrame",
    "cancelAnimationFrame",
    "queueMicrotask",
    "fetch",
    "performance",
    "process",
    "document",
    "window",
    "canvas",
    "navigator",
    "AudioContext",
  ] {
    let ok = eval_number(
      &mut runtime,
      &format!("typeof globalThis[{global:?}] === 'undefined' ? 0 : 1"),
    );
    assert_eq!(ok, 1.0, "missing global {global}");
  }
}

#[test]
fn protect_unprotect_is_balanced() {
  let mut runtime = test_runtime();
  assert_eq!(runtime.engine.protected_count(), 0);

  let protected = runtime.engine.with_scope(|scope| {
    let value = scope.eval_script("<test>", "() => {}").unwrap();
    scope.protect(&value)
  });
  assert_eq!(runtime.engine.protected_count(), 1);

  protected.release();
  assert_eq!(runtime.engine.protected_count(), 0);
}

#[test]
fn timer_callback_balance() {
  let mut runtime = test_runtime();

  // Schedule one-shot + interval + a cleared timer.
  runtime
    .engine
    .with_scope(|scope| {
      scope
        .eval_script(
          "<test>",
          "globalThis.__fired = [];\n\
           setTimeout(() => __fired.push('a'), 0);\n\
           globalThis.__interval = setInterval(() => __fired.push('i'), 0);\n\
           globalThis.__dead = setTimeout(() => __fired.push('dead'), 0);\n\
           clearTimeout(globalThis.__dead);",
        )
        .unwrap()
    });
  // Cleared timer released immediately; two callbacks remain protected.
  assert_eq!(runtime.engine.protected_count(), 2);

  std::thread::sleep(std::time::Duration::from_millis(2));
  runtime.fire_due_timers();

  // One-shot released on fire; the interval stays protected.
  assert_eq!(runtime.engine.protected_count(), 1);
  assert_eq!(eval_number(&mut runtime, "__fired.join(',') === 'a,i' ? 1 : 0"), 1.0);

  runtime
    .engine
    .with_scope(|scope| scope.eval_script("<test>", "clearInterval(__interval)").unwrap());
  assert_eq!(runtime.engine.protected_count(), 0);
}

#[test]
fn timers_fire_in_due_then_registration_order() {
  let mut runtime = test_runtime();
  runtime
    .engine
    .with_scope(|scope| {
      scope
        .eval_script(
          "<test>",
          "globalThis.__order = [];\n\
           setTimeout(() => __order.push('late'), 5);\n\
           setTimeout(() => __order.push('a'), 0);\n\
           setTimeout(() => __order.push('b'), 0);\n\
           __order.push('sync');",
        )
        .unwrap()
    });

  std::thread::sleep(std::time::Duration::from_millis(10));
  runtime.fire_due_timers();

  assert_eq!(
    eval_number(
      &mut runtime,
      "__order.join(',') === 'sync,a,b,late' ? 1 : 0"
    ),
    1.0
  );
}

#[test]
fn microtasks_run_before_timers() {
  let mut runtime = test_runtime();
  runtime
    .engine
    .with_scope(|scope| {
      scope
        .eval_script(
          "<test>",
          "globalThis.__seq = [];\n\
           Promise.resolve().then(() => __seq.push('M'));\n\
           setTimeout(() => __seq.push('T'), 0);\n\
           __seq.push('S');",
        )
        .unwrap()
    });

  // The frame drains microtasks before the next timer dispatch.
  runtime.engine.run_microtasks();
  std::thread::sleep(std::time::Duration::from_millis(2));
  runtime.fire_due_timers();

  assert_eq!(
    eval_number(&mut runtime, "__seq.join(',') === 'S,M,T' ? 1 : 0"),
    1.0
  );
}

#[test]
fn raf_batch_and_cancellation() {
  let mut runtime = test_runtime();
  runtime
    .engine
    .with_scope(|scope| {
      scope
        .eval_script(
          "<test>",
          "globalThis.__frames = [];\n\
           requestAnimationFrame((t) => __frames.push(['one', t >= 0]));\n\
           const dead = requestAnimationFrame(() => __frames.push(['dead']));\n\
           cancelAnimationFrame(dead);\n\
           requestAnimationFrame(() => {\n\
             // Registered during the frame: joins the next frame.\n\
             requestAnimationFrame(() => __frames.push(['next']));\n\
             __frames.push(['two']);\n\
           });",
        )
        .unwrap()
    });
  assert_eq!(runtime.engine.protected_count(), 2);

  runtime.run_raf();
  assert_eq!(
    eval_number(&mut runtime, "__frames.length === 2 ? 1 : 0"),
    1.0
  );
  assert_eq!(
    eval_number(
      &mut runtime,
      "__frames[0][0] === 'one' && __frames[0][1] && __frames[1][0] === 'two' ? 1 : 0"
    ),
    1.0
  );

  runtime.run_raf();
  assert_eq!(
    eval_number(&mut runtime, "__frames[2][0] === 'next' ? 1 : 0"),
    1.0
  );
  assert_eq!(runtime.engine.protected_count(), 0);
}

#[test]
fn cjs_module_cache_is_idempotent() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp
    .child("dep.js")
    .write_str("module.exports = { calls: (module.exports.calls ?? 0) + 1, tag: {} };")
    .unwrap();
  temp.child("main.js").write_str("//").unwrap();
  let main = temp.child("main.js").path().to_string_lossy().to_string();

  let mut runtime = test_runtime();
  let identical = runtime.engine.with_scope(|scope| {
    let source = format!(
      "const a = __MystralGlobal.requireFrom('./dep.js', {main:?});\n\
       const b = __MystralGlobal.requireFrom('./dep.js', {main:?});\n\
       a === b ? 1 : 0"
    );
    let value = scope.eval_script("<test>", &source).unwrap();
    scope.to_number(&value).unwrap()
  });
  assert_eq!(identical, 1.0);

  // clear_for_reload invalidates the cache: a fresh object comes back.
  let first = runtime.engine.with_scope(|scope| {
    let source = format!("__MystralGlobal.requireFrom('./dep.js', {main:?}).tag");
    scope.eval_script("<keep>", &source).unwrap()
  });
  runtime.clear_for_reload();
  let changed = runtime.engine.with_scope(|scope| {
    let source = format!(
      "globalThis.__fresh = __MystralGlobal.requireFrom('./dep.js', {main:?}).tag;"
    );
    scope.eval_script("<test>", &source).unwrap();
    let global = scope.global();
    let fresh = scope.get(&global, "__fresh").unwrap();
    fresh == first
  });
  assert!(!changed, "reload must produce a fresh module object");

  temp.close().unwrap();
}

#[test]
fn cjs_cycles_see_partial_exports() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp
    .child("a.js")
    .write_str(
      "exports.name = 'a';\n\
       const b = require('./b.js');\n\
       exports.sawB = b.name;",
    )
    .unwrap();
  temp
    .child("b.js")
    .write_str(
      "exports.name = 'b';\n\
       const a = require('./a.js');\n\
       exports.sawPartialA = a.name;",
    )
    .unwrap();
  temp.child("main.js").write_str("//").unwrap();
  let main = temp.child("main.js").path().to_string_lossy().to_string();

  let mut runtime = test_runtime();
  let ok = eval_number(
    &mut runtime,
    &format!(
      "const a = __MystralGlobal.requireFrom('./a.js', {main:?});\n\
       a.name === 'a' && a.sawB === 'b' ? 1 : 0"
    ),
  );
  assert_eq!(ok, 1.0);

  temp.close().unwrap();
}

#[test]
fn json_modules_parse_once() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp
    .child("config.json")
    .write_str(r#"{ "size": 42, "name": "mystral" }"#)
    .unwrap();
  temp.child("main.js").write_str("//").unwrap();
  let main = temp.child("main.js").path().to_string_lossy().to_string();

  let mut runtime = test_runtime();
  let ok = eval_number(
    &mut runtime,
    &format!(
      "const cfg = __MystralGlobal.requireFrom('./config.json', {main:?});\n\
       cfg.size === 42 && cfg.name === 'mystral' ? 1 : 0"
    ),
  );
  assert_eq!(ok, 1.0);

  temp.close().unwrap();
}

fn pump_fetch(runtime: &mut JsRuntime, io: &Rc<RefCell<IoDriver>>) {
  for _ in 0..200 {
    let files = io.borrow().files.completions().drain();
    let http = io.borrow().http.completions().drain();
    let had_work = !files.is_empty() || !http.is_empty();
    runtime.drain_files(files);
    runtime.drain_http(http);
    runtime.tick();
    if had_work {
      return;
    }
    std::thread::sleep(std::time::Duration::from_millis(2));
  }
  panic!("fetch completion never arrived");
}

#[test]
fn fetch_missing_file_is_a_404() {
  let mut runtime = test_runtime();
  let io = runtime.state.borrow().io.clone();

  runtime
    .engine
    .with_scope(|scope| {
      scope
        .eval_script(
          "<test>",
          "fetch('file:///definitely/not/there')\n\
           .then((r) => { globalThis.__status = r.status; globalThis.__ok = r.ok; });",
        )
        .unwrap()
    });

  pump_fetch(&mut runtime, &io);

  assert_eq!(eval_number(&mut runtime, "__status"), 404.0);
  assert_eq!(eval_number(&mut runtime, "__ok ? 1 : 0"), 0.0);
}

#[test]
fn fetch_file_round_trips_bytes_and_text() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("data.txt").write_str("héllo bytes").unwrap();
  let url = format!("file://{}", temp.child("data.txt").path().display());

  let mut runtime = test_runtime();
  let io = runtime.state.borrow().io.clone();

  runtime
    .engine
    .with_scope(|scope| {
      scope
        .eval_script(
          "<test>",
          &format!(
            "fetch({url:?}).then(async (r) => {{\n\
               globalThis.__status = r.status;\n\
               globalThis.__text = await r.text();\n\
               globalThis.__len = (await r.arrayBuffer()).byteLength;\n\
             }});"
          ),
        )
        .unwrap()
    });

  pump_fetch(&mut runtime, &io);
  // The awaits resolve through microtasks on later ticks.
  for _ in 0..5 {
    runtime.tick();
  }

  assert_eq!(eval_number(&mut runtime, "__status"), 200.0);
  assert_eq!(
    eval_number(&mut runtime, "__text === 'héllo bytes' ? 1 : 0"),
    1.0
  );
  assert_eq!(
    eval_number(&mut runtime, "__len"),
    "héllo bytes".len() as f64
  );

  temp.close().unwrap();
}

#[test]
fn esm_entry_with_static_imports() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp
    .child("lib.mjs")
    .write_str("export const answer = 40;\nexport function plus(n) { return answer + n; }")
    .unwrap();
  temp
    .child("main.mjs")
    .write_str(
      "import { plus } from './lib.mjs';\n\
       globalThis.__result = plus(2);",
    )
    .unwrap();
  let main = temp.child("main.mjs").path().to_string_lossy().to_string();

  let mut runtime = test_runtime();
  runtime.execute_entry(&main).unwrap();

  assert_eq!(eval_number(&mut runtime, "__result"), 42.0);

  temp.close().unwrap();
}

#[test]
fn process_exit_sets_the_quit_flag() {
  let mut runtime = test_runtime();
  runtime
    .engine
    .with_scope(|scope| scope.eval_script("<test>", "process.exit(3)").unwrap());
  assert_eq!(runtime.exit_code(), Some(3));
}

#[test]
fn audio_graph_surface() {
  let mut runtime = test_runtime();
  // No output device in CI: the context degrades to suspended but the
  // graph API stays usable.
  let ok = eval_number(
    &mut runtime,
    "const ctx = new AudioContext();\n\
     const buffer = ctx.createBuffer(1, 8, 8000);\n\
     buffer.copyToChannel(new Float32Array([0.5, 0.5]), 0);\n\
     const gain = ctx.createGain();\n\
     gain.gain.value = 0.25;\n\
     const source = ctx.createBufferSource();\n\
     source.buffer = buffer;\n\
     source.connect(gain).connect(ctx.destination);\n\
     source.start(0);\n\
     buffer.numberOfChannels === 1 && buffer.length === 8 ? 1 : 0",
  );
  assert_eq!(ok, 1.0);
}
