//! JavaScript runtime host.
//!
//! [`JsRuntime`] owns the script engine and the host-side state every
//! binding reaches through the engine's host slot: the timer set, the RAF
//! queue, the pending-callback tables for I/O completions, and the module
//! caches. The frame loop ([`crate::evloop`]) calls into the frame-slot
//! methods here in its fixed per-frame order.

pub mod binding;
pub mod engine;
pub mod err;
pub mod exception;
pub mod module;
pub mod transpiler;

use crate::cli::RunOptions;
use crate::dbg::DbgEvent;
use crate::io::queue::{FileCompletion, HttpCompletion, TaskId};
use crate::io::watch::{WatchHit, WatchId};
use crate::io::IoDriver;
use crate::js::binding::audio::AudioRegistry;
use crate::js::engine::{Engine, Protected, Value};
use crate::js::module::{cjs, ModuleFormat, Resolver, SourceLoader};
use crate::prelude::*;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// One scheduled timer. The protected callback is released exactly once:
/// on one-shot fire, on clear, or on reload.
pub struct TimerEntry {
  pub id: TimerId,
  /// `Some` for intervals.
  pub period: Option<Duration>,
  pub callback: Protected,
  pub args: Vec<Value>,
}

/// Timers ordered by (due time, insertion sequence).
pub struct TimerSet {
  entries: BTreeMap<(Instant, u64), TimerEntry>,
  index: HashMap<TimerId, (Instant, u64)>,
  /// Ids cleared while their entry was popped for firing.
  cleared_in_flight: HashSet<TimerId>,
  next_id: u64,
  next_seq: u64,
}

impl TimerSet {
  pub fn new() -> Self {
    TimerSet {
      entries: BTreeMap::new(),
      index: HashMap::new(),
      cleared_in_flight: HashSet::new(),
      next_id: 1,
      next_seq: 0,
    }
  }

  pub fn schedule(
    &mut self,
    now: Instant,
    delay: Duration,
    period: Option<Duration>,
    callback: Protected,
    args: Vec<Value>,
  ) -> TimerId {
    let id = self.next_id;
    self.next_id += 1;
    self.insert_at(now + delay, TimerEntry {
      id,
      period,
      callback,
      args,
    });
    id
  }

  fn insert_at(&mut self, due: Instant, entry: TimerEntry) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.index.insert(entry.id, (due, seq));
    self.entries.insert((due, seq), entry);
  }

  /// Clearing an unknown id is a no-op.
  pub fn clear(&mut self, id: TimerId) {
    match self.index.remove(&id) {
      Some(key) => {
        // Dropping the entry releases its protected callback.
        self.entries.remove(&key);
      }
      None => {
        // Possibly popped for firing right now; make sure it is not
        // re-armed and fires at most once more.
        self.cleared_in_flight.insert(id);
      }
    }
  }

  /// Pops every entry due at `now`, in (due, seq) order.
  pub fn pop_due(&mut self, now: Instant) -> Vec<(Instant, TimerEntry)> {
    let mut due = Vec::new();
    while let Some((key, _)) = self.entries.first_key_value() {
      if key.0 > now {
        break;
      }
      let (key, entry) = self.entries.pop_first().unwrap();
      self.index.remove(&entry.id);
      due.push((key.0, entry));
    }
    due
  }

  /// Consumes a pending in-flight clear for `id`.
  pub fn take_cleared(&mut self, id: TimerId) -> bool {
    self.cleared_in_flight.remove(&id)
  }

  /// Re-arms an interval at `prev_due + period`; a stalled frame falls
  /// behind instead of bursting.
  pub fn reschedule(&mut self, prev_due: Instant, now: Instant, entry: TimerEntry) {
    let period = entry.period.unwrap_or(Duration::ZERO);
    let mut due = prev_due + period;
    if due <= now {
      due = now;
    }
    self.insert_at(due, entry);
  }

  pub fn purge_cleared(&mut self) {
    self.cleared_in_flight.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn next_due(&self) -> Option<Instant> {
    self.entries.first_key_value().map(|(key, _)| key.0)
  }

  /// Drops everything, releasing every protected callback.
  pub fn clear_all(&mut self) {
    self.entries.clear();
    self.index.clear();
    self.cleared_in_flight.clear();
  }
}

impl Default for TimerSet {
  fn default() -> Self {
    Self::new()
  }
}

/// The requestAnimationFrame queue. Swapped at the start of each frame;
/// same-frame registrations join the next frame's queue. Cancellation
/// drops the callback even when it was already swapped out for this frame.
pub struct RafQueue {
  queue: Vec<(u64, Protected)>,
  cancelled: HashSet<u64>,
  next_id: u64,
}

impl RafQueue {
  pub fn new() -> Self {
    RafQueue {
      queue: Vec::new(),
      cancelled: HashSet::new(),
      next_id: 1,
    }
  }

  pub fn schedule(&mut self, callback: Protected) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    self.queue.push((id, callback));
    id
  }

  pub fn cancel(&mut self, id: u64) {
    match self.queue.iter().position(|(i, _)| *i == id) {
      Some(index) => {
        self.queue.remove(index);
      }
      None => {
        self.cancelled.insert(id);
      }
    }
  }

  pub fn swap(&mut self) -> Vec<(u64, Protected)> {
    std::mem::take(&mut self.queue)
  }

  pub fn take_cancelled(&mut self, id: u64) -> bool {
    self.cancelled.remove(&id)
  }

  pub fn clear_cancelled(&mut self) {
    self.cancelled.clear();
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn clear_all(&mut self) {
    self.queue.clear();
    self.cancelled.clear();
  }
}

impl Default for RafQueue {
  fn default() -> Self {
    Self::new()
  }
}

/// A field on a host-emitted DOM-style event.
pub enum EventField {
  Num(f64),
  Str(String),
}

/// What a pending fetch completion should be shaped as.
pub enum FetchTarget {
  /// Response data arrives from the HTTP worker as-is.
  Http,
  /// Bytes (or an error) arrive from the file reader; status mapping
  /// 200/404/500 happens at dispatch.
  File { url: String },
}

pub struct FetchPending {
  pub callback: Protected,
  pub target: FetchTarget,
}

/// Host state shared with the bindings through the engine's host slot.
pub struct JsRuntimeState {
  pub startup_moment: Instant,
  /// Unix millis at process start.
  pub time_origin: u128,
  pub opts: RunOptions,

  pub resolver: Rc<Resolver>,
  pub cjs_cache: HashMap<String, Value>,

  pub timers: TimerSet,
  pub raf: RafQueue,
  pub pending_fetch: HashMap<TaskId, FetchPending>,
  pub watch_callbacks: HashMap<WatchId, Protected>,
  pub audio: AudioRegistry,
  /// `onended` callbacks keyed by source id.
  pub audio_ended: HashMap<u64, Protected>,

  pub io: Rc<RefCell<IoDriver>>,

  pub canvas_width: u32,
  pub canvas_height: u32,
  /// Clear color for the presented target, set through the canvas context
  /// seam (the external WebGPU bindings layer drives real passes).
  pub clear_color: [f64; 4],
  pub gpu_indirect_first_instance: bool,

  /// Set by `process.exit(code)`; evaluated at the end of the frame step.
  pub exit_code: Option<i32>,
  /// Debug channel event sink, when a client is attached.
  pub dbg_events: Option<std::sync::mpsc::Sender<DbgEvent>>,
}

/// The script runtime: engine plus host state.
pub struct JsRuntime {
  pub engine: Engine,
  pub state: Rc<RefCell<JsRuntimeState>>,
}

impl JsRuntime {
  pub fn new(
    opts: RunOptions,
    resolver: Rc<Resolver>,
    io: Rc<RefCell<IoDriver>>,
    startup_moment: Instant,
    time_origin: u128,
  ) -> Self {
    let mut engine = Engine::new();
    engine.set_source_hook(Rc::new(SourceLoader {
      resolver: resolver.clone(),
    }));

    let canvas_width = opts.width;
    let canvas_height = opts.height;

    let state = Rc::new(RefCell::new(JsRuntimeState {
      startup_moment,
      time_origin,
      opts,
      resolver,
      cjs_cache: HashMap::new(),
      timers: TimerSet::new(),
      raf: RafQueue::new(),
      pending_fetch: HashMap::new(),
      watch_callbacks: HashMap::new(),
      audio: AudioRegistry::new(),
      audio_ended: HashMap::new(),
      io,
      canvas_width,
      canvas_height,
      clear_color: [0.0, 0.0, 0.0, 1.0],
      gpu_indirect_first_instance: false,
      exit_code: None,
      dbg_events: None,
    }));

    engine.set_host_slot(state.clone());
    binding::install(&mut engine);

    JsRuntime { engine, state }
  }

  /// Monotonic milliseconds since process start.
  pub fn now_ms(&self) -> f64 {
    self.state.borrow().startup_moment.elapsed().as_secs_f64() * 1000.0
  }

  /// Resolves and evaluates the entry script by its detected format.
  pub fn execute_entry(&mut self, specifier: &str) -> AnyResult<()> {
    let resolver = self.state.borrow().resolver.clone();

    // Plain file names are paths, not bare packages.
    let specifier = if specifier.starts_with('/')
      || specifier.starts_with("./")
      || specifier.starts_with("../")
      || specifier.starts_with("asset://")
    {
      specifier.to_string()
    } else {
      format!("./{specifier}")
    };

    let path = resolver.resolve(None, &specifier)?;
    debug!("Resolved entry module: {:?}", path);

    match resolver.format_of(&path) {
      ModuleFormat::Esm => {
        self
          .engine
          .eval_module(&path, None)
          .map_err(|e| TheErr::Message(e.to_string()))?;
      }
      ModuleFormat::Cjs | ModuleFormat::Json => {
        let result = self
          .engine
          .with_scope(|scope| cjs::load_module(scope, &path));
        if let Err(e) = result {
          anyhow::bail!(TheErr::Message(e));
        }
      }
    }

    self.engine.run_microtasks();
    if let Some(e) = self.engine.check_exceptions() {
      anyhow::bail!(TheErr::Message(e.to_string()));
    }
    Ok(())
  }

  // Callback plumbing {

  /// Invokes a protected callback, then drains microtasks and reports any
  /// uncaught exception to stderr. The frame continues.
  fn invoke(&mut self, callback: &Value, args: &[Value]) {
    let result = self
      .engine
      .with_scope(|scope| scope.call(callback, None, args));
    if let Err(e) = result {
      error!("Uncaught exception in callback: {e}");
      eprintln!("Uncaught {e}");
    }

    self.engine.run_microtasks();
    if let Some(e) = self.engine.check_exceptions() {
      error!("Uncaught exception: {e}");
      eprintln!("Uncaught {e}");
    }
  }

  /// Fires every timer due now, in (due, seq) order; intervals re-arm at
  /// previous-due + period.
  pub fn fire_due_timers(&mut self) {
    let now = Instant::now();
    let due = self.state.borrow_mut().timers.pop_due(now);

    for (prev_due, entry) in due {
      if self.state.borrow_mut().timers.take_cleared(entry.id) {
        // Cleared since the pop; drop without firing (the protected
        // callback releases here).
        continue;
      }

      let callback = entry.callback.value().clone();
      self.invoke(&callback, &entry.args);

      let mut state = self.state.borrow_mut();
      if entry.period.is_some() {
        if state.timers.take_cleared(entry.id) {
          // clearInterval ran inside the callback.
          continue;
        }
        state.timers.reschedule(prev_due, now, entry);
      }
      // One-shots drop here, releasing the protected callback.
    }

    self.state.borrow_mut().timers.purge_cleared();
  }

  /// Swaps the RAF queue and invokes this frame's callbacks with the
  /// current monotonic time.
  pub fn run_raf(&mut self) {
    let frame_time = self.now_ms();
    let batch = self.state.borrow_mut().raf.swap();
    if batch.is_empty() {
      self.state.borrow_mut().raf.clear_cancelled();
      return;
    }

    let time_value = self.engine.with_scope(|scope| scope.number(frame_time));

    for (id, callback) in batch {
      if self.state.borrow_mut().raf.take_cancelled(id) {
        continue;
      }
      let callback_value = callback.value().clone();
      self.invoke(&callback_value, &[time_value.clone()]);
      // `callback` drops here: one release per registration.
    }

    self.state.borrow_mut().raf.clear_cancelled();
  }

  /// Dispatches HTTP fetch completions in enqueue order.
  pub fn drain_http(&mut self, completions: Vec<HttpCompletion>) {
    for completion in completions {
      let pending = self
        .state
        .borrow_mut()
        .pending_fetch
        .remove(&completion.task);
      let Some(pending) = pending else {
        continue;
      };

      let response = completion.response;
      let data = self.engine.with_scope(|scope| {
        binding::fetch::build_response_object(scope, &response)
      });
      let callback = pending.callback.value().clone();
      self.invoke(&callback, &[data]);
      // `pending` drops here, releasing the callback handle.
    }
  }

  /// Dispatches file-backed fetch completions (file:// and asset://).
  pub fn drain_files(&mut self, completions: Vec<FileCompletion>) {
    for completion in completions {
      let pending = self
        .state
        .borrow_mut()
        .pending_fetch
        .remove(&completion.task);
      let Some(pending) = pending else {
        continue;
      };
      let FetchTarget::File { url } = &pending.target else {
        continue;
      };

      let data = self.engine.with_scope(|scope| {
        binding::fetch::build_file_response_object(scope, url, &completion.result)
      });
      let callback = pending.callback.value().clone();
      self.invoke(&callback, &[data]);
    }
  }

  /// Dispatches file watch events.
  pub fn drain_watches(&mut self, hits: Vec<WatchHit>) {
    for hit in hits {
      let callback = {
        let state = self.state.borrow();
        state
          .watch_callbacks
          .get(&hit.watch)
          .map(|p| p.value().clone())
      };
      let Some(callback) = callback else {
        continue;
      };

      let event = self.engine.with_scope(|scope| {
        let object = scope.create_object();
        let path = scope.string(&hit.path.to_string_lossy());
        scope.set(&object, "path", &path);
        let kind = scope.string(match hit.kind {
          crate::io::queue::WatchKind::Modified => "modified",
          crate::io::queue::WatchKind::Renamed => "renamed",
          crate::io::queue::WatchKind::Deleted => "deleted",
        });
        scope.set(&object, "kind", &kind);
        object
      });
      self.invoke(&callback, &[event]);
    }
  }

  /// Fires `onended` for sources the mixer finished, on the main thread.
  pub fn drain_audio_ended(&mut self) {
    let ended: Vec<u64> = {
      let state = self.state.borrow();
      state
        .audio
        .contexts
        .values()
        .flat_map(|ctx| ctx.take_ended())
        .collect()
    };

    for source in ended {
      let pending = self.state.borrow_mut().audio_ended.remove(&source);
      if let Some(pending) = pending {
        let callback = pending.value().clone();
        self.invoke(&callback, &[]);
      }
    }
  }

  /// Runs queued dynamic imports, drains microtasks, surfaces exceptions.
  pub fn tick(&mut self) {
    self.engine.tick_dynamic_imports();
    self.engine.run_microtasks();
    if let Some(e) = self.engine.check_exceptions() {
      error!("Uncaught exception: {e}");
      eprintln!("Uncaught {e}");
    }
  }

  // Callback plumbing }

  /// Fires a DOM-style event on `window` through the JS glue.
  pub fn emit_event(&mut self, kind: &str, fields: &[(&str, EventField)]) {
    let result = self.engine.with_scope(|scope| {
      let global = scope.global();
      let internal = scope.get(&global, "__MystralGlobal")?;
      let emit = scope.get(&internal, "emitEvent")?;
      let kind = scope.string(kind);
      let detail = scope.create_object();
      for (key, value) in fields {
        let value = match value {
          EventField::Num(n) => scope.number(*n),
          EventField::Str(s) => scope.string(s),
        };
        scope.set(&detail, key, &value);
      }
      scope.call(&emit, None, &[kind, detail]).ok()
    });
    if result.is_none() {
      trace!("emitEvent glue missing for {kind:?}");
    }
  }

  /// Classic-mode evaluation for the debug channel; the result is
  /// stringified (JSON where possible).
  pub fn eval_expression(&mut self, source: &str) -> Result<String, String> {
    let result = self.engine.with_scope(|scope| {
      scope.eval_script("<debug>", source).map(|value| {
        if scope.is_undefined(&value) {
          "undefined".to_string()
        } else {
          scope
            .json_stringify(&value)
            .unwrap_or_else(|| scope.to_string_lossy(&value))
        }
      })
    });
    self.engine.run_microtasks();
    result.map_err(|e| e.to_string())
  }

  /// True when script-driven work could still happen: timers, RAF,
  /// pending fetches, watches, or scheduled audio completions.
  pub fn has_pending_work(&self) -> bool {
    let state = self.state.borrow();
    !state.timers.is_empty()
      || !state.raf.is_empty()
      || !state.pending_fetch.is_empty()
      || !state.watch_callbacks.is_empty()
      || !state.audio_ended.is_empty()
  }

  pub fn exit_code(&self) -> Option<i32> {
    self.state.borrow().exit_code
  }

  /// Script reload: clears timers, RAF, pending completions and the module
  /// caches, releasing every protected handle. Watch registrations stay.
  pub fn clear_for_reload(&mut self) {
    {
      let mut state = self.state.borrow_mut();
      state.timers.clear_all();
      state.raf.clear_all();
      state.pending_fetch.clear();
      state.audio_ended.clear();
      state.cjs_cache.clear();
    }
    self.engine.clear_modules();
  }

  /// Releases everything the runtime holds, ahead of engine teardown.
  pub fn shutdown(&mut self) {
    {
      let mut state = self.state.borrow_mut();
      state.timers.clear_all();
      state.raf.clear_all();
      state.pending_fetch.clear();
      state.watch_callbacks.clear();
      state.audio_ended.clear();
      state.cjs_cache.clear();
      state.audio.close_all();
    }
    self.engine.clear_modules();
  }
}
