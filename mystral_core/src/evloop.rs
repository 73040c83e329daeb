//! Event loop (the frame loop host).
//!
//! Owns the per-frame cycle in its fixed order: platform events → I/O
//! step → completion drains (HTTP, file, watch) → due timers → RAF →
//! microtasks → present → debug channel → exit checks. Script and GPU
//! work are main-thread only; workers communicate exclusively through the
//! completion queues drained here.

use crate::cli::RunOptions;
use crate::dbg::{DbgCommand, DbgEvent, DbgServer};
use crate::gpu::{screenshot, GpuContext};
use crate::io::watch::{WatchHit, WatchId};
use crate::io::IoDriver;
use crate::js::{EventField, JsRuntime};
use crate::js::module::Resolver;
use crate::platform::{HeadlessHost, PlatformEvent, PlatformHost};
use crate::prelude::*;

use serde_json::json;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Consecutive fully-idle frames before a windowless run exits on its own.
const IDLE_EXIT_FRAMES: u32 = 3;

// Frame pacing cap for windowless targets (windowed presents block on
// vsync instead).
const HEADLESS_FRAME_BUDGET: Duration = Duration::from_millis(16);

/// The runtime host main loop.
pub struct EventLoop {
  pub startup_moment: Instant,
  pub opts: RunOptions,

  pub io: Rc<RefCell<IoDriver>>,
  pub js: JsRuntime,
  pub gpu: Option<GpuContext>,
  gpu_reinit_attempted: bool,
  pub platform: Box<dyn PlatformHost>,
  /// Presenting into a real window (vsync paces the loop, no auto-exit).
  windowed: bool,

  dbg: Option<DbgServer>,
  dbg_waits: Vec<(u64, serde_json::Value, u64)>,
  dbg_screenshots: Vec<(u64, serde_json::Value, Option<String>)>,

  entry_path: Option<String>,
  reload_watch: Option<WatchId>,
  reload_pending: bool,

  frame_count: u64,
  idle_frames: u32,
  screenshot_done: bool,
  platform_quit: bool,
  quit: bool,
  exit_code: i32,
}

impl EventLoop {
  /// Loop for the CLI: no platform window; rendering goes to an offscreen
  /// target (both `--headless` and `--no-sdl` once no platform layer is
  /// attached).
  pub fn new(opts: RunOptions) -> AnyResult<Self> {
    let platform = Box::new(HeadlessHost::new(opts.width, opts.height));
    Self::with_platform(opts, platform)
  }

  /// Loop for embedders that bring a platform layer (and possibly a real
  /// window) of their own.
  pub fn with_platform(opts: RunOptions, platform: Box<dyn PlatformHost>) -> AnyResult<Self> {
    let startup_moment = Instant::now();
    let time_origin = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_millis();

    let io = Rc::new(RefCell::new(IoDriver::new()));
    let resolver = Rc::new(Resolver::new(crate::bundle::current()));

    // GPU context: windowed when the platform produced a window (and
    // headless was not forced), otherwise the offscreen target. A missing
    // GPU degrades to a render-less run (timers, I/O and audio still work).
    let window = if opts.effective_headless() || opts.no_sdl {
      None
    } else {
      platform.window()
    };
    let gpu = match window {
      Some(window) => match GpuContext::windowed(window) {
        Ok(gpu) => Some(gpu),
        Err(e) => {
          error!("GPU init failed: {e}");
          eprintln!("GPU init failed: {e}");
          None
        }
      },
      None => match GpuContext::headless(opts.width, opts.height) {
        Ok(gpu) => Some(gpu),
        Err(e) => {
          warn!("Headless GPU unavailable, rendering disabled: {e}");
          None
        }
      },
    };
    let windowed = window.is_some() && gpu.is_some();

    let mut js = JsRuntime::new(
      opts.clone(),
      resolver,
      io.clone(),
      startup_moment,
      time_origin,
    );

    {
      let mut state = js.state.borrow_mut();
      let (width, height) = platform.drawable_size();
      state.canvas_width = width;
      state.canvas_height = height;
      if let Some(gpu) = &gpu {
        state.gpu_indirect_first_instance = gpu.indirect_first_instance;
      }
    }

    let dbg = match opts.debug_port {
      Some(port) => match DbgServer::start(port) {
        Ok(server) => {
          js.state.borrow_mut().dbg_events = Some(server.event_sender());
          Some(server)
        }
        Err(e) => {
          error!("Debug channel failed to start: {e}");
          eprintln!("Debug channel failed to start: {e}");
          None
        }
      },
      None => None,
    };

    Ok(EventLoop {
      startup_moment,
      opts,
      io,
      js,
      gpu,
      gpu_reinit_attempted: false,
      platform,
      windowed,
      dbg,
      dbg_waits: Vec::new(),
      dbg_screenshots: Vec::new(),
      entry_path: None,
      reload_watch: None,
      reload_pending: false,
      frame_count: 0,
      idle_frames: 0,
      screenshot_done: false,
      platform_quit: false,
      quit: false,
      exit_code: 0,
    })
  }

  /// Resolves and evaluates the entry script, and arms the reload watch in
  /// `--watch` mode. Entry-eval failures are fatal (exit code 1).
  pub fn initialize(&mut self, entry: &str) -> AnyResult<()> {
    if self.opts.screenshot.is_some() && self.gpu.is_none() {
      anyhow::bail!(TheErr::Gpu(
        "screenshot requested but no GPU target is available".into()
      ));
    }

    self.js.execute_entry(entry)?;

    let resolver = self.js.state.borrow().resolver.clone();
    let spec = if entry.starts_with('/')
      || entry.starts_with("./")
      || entry.starts_with("../")
      || entry.starts_with("asset://")
    {
      entry.to_string()
    } else {
      format!("./{entry}")
    };
    if let Ok(path) = resolver.resolve(None, &spec) {
      self.entry_path = Some(path.clone());

      if self.opts.watch && !resolver.is_bundle_path(&path) {
        match self.io.borrow_mut().watcher.watch(&PathBuf::from(&path)) {
          Ok(id) => {
            debug!("Watching entry {:?} for reload", path);
            self.reload_watch = Some(id);
          }
          Err(e) => {
            warn!("--watch unavailable: {e}");
          }
        }
      }
    }

    Ok(())
  }

  /// Runs frames until an exit condition holds; returns the exit code.
  pub fn run(&mut self) -> i32 {
    while !self.quit {
      let frame_started = Instant::now();
      self.step();
      if self.quit {
        break;
      }
      self.pace(frame_started);
    }

    self.shutdown();
    self.exit_code
  }

  // Sleep the remainder of the frame budget on windowless targets, waking
  // early for the next due timer.
  fn pace(&self, frame_started: Instant) {
    if self.windowed {
      // Present blocks on vsync.
      return;
    }

    let elapsed = frame_started.elapsed();
    let mut budget = HEADLESS_FRAME_BUDGET.saturating_sub(elapsed);
    if let Some(next_due) = self.js.state.borrow().timers.next_due() {
      let until_due = next_due.saturating_duration_since(Instant::now());
      budget = budget.min(until_due);
    }
    if !budget.is_zero() {
      std::thread::sleep(budget);
    }
  }

  /// One frame step, in the fixed order.
  pub fn step(&mut self) {
    self.frame_count += 1;
    trace!("Frame {} begin", self.frame_count);

    // 1. Platform events.
    for event in self.platform.poll_events() {
      match event {
        PlatformEvent::Quit => {
          self.platform_quit = true;
        }
        PlatformEvent::Resized { width, height } => {
          if let Some(gpu) = &mut self.gpu {
            gpu.resize(width, height);
          }
          {
            let mut state = self.js.state.borrow_mut();
            state.canvas_width = width;
            state.canvas_height = height;
          }
          self.js.emit_event(
            "resize",
            &[
              ("width", EventField::Num(width as f64)),
              ("height", EventField::Num(height as f64)),
            ],
          );
        }
        PlatformEvent::KeyDown { key } => {
          self.js.emit_event("keydown", &[("key", EventField::Str(key))]);
        }
        PlatformEvent::KeyUp { key } => {
          self.js.emit_event("keyup", &[("key", EventField::Str(key))]);
        }
      }
    }

    // 2. Event-loop step (non-blocking).
    let io_pending = self.io.borrow().step();

    // 3. Completion drains, fixed order: HTTP, file, watch, audio.
    let http = self.io.borrow().http.completions().drain();
    self.js.drain_http(http);

    let files = self.io.borrow().files.completions().drain();
    self.js.drain_files(files);

    let hits = self.io.borrow_mut().watcher.drain();
    let script_hits = self.split_reload_hits(hits);
    self.js.drain_watches(script_hits);

    self.js.drain_audio_ended();

    // 4. Due timers, (due, seq) order.
    self.js.fire_due_timers();

    // 5. RAF batch with the current monotonic time.
    self.js.run_raf();

    // 6. Microtasks and pending dynamic imports.
    self.js.tick();

    // 7. Acquire, render, present.
    self.render_frame();

    // Debug channel commands run between frames.
    self.process_dbg();

    // 8. Reload and exit checks.
    if self.reload_pending {
      self.reload();
    }
    self.evaluate_exit(io_pending);
  }

  // Separates the internal reload watch from script-owned watches.
  fn split_reload_hits(&mut self, hits: Vec<WatchHit>) -> Vec<WatchHit> {
    let Some(reload_id) = self.reload_watch else {
      return hits;
    };
    let mut script_hits = Vec::with_capacity(hits.len());
    for hit in hits {
      if hit.watch == reload_id {
        debug!("Entry changed on disk: {:?}", hit.path);
        self.reload_pending = true;
      } else {
        script_hits.push(hit);
      }
    }
    script_hits
  }

  fn capture_requested(&self) -> bool {
    let cli_capture = self.opts.screenshot.is_some()
      && !self.screenshot_done
      && self.frame_count >= self.opts.frames.unwrap_or(1);
    cli_capture || !self.dbg_screenshots.is_empty()
  }

  fn render_frame(&mut self) {
    if self.gpu.is_none() {
      return;
    }

    let capture = self.capture_requested();
    let clear_color = self.js.state.borrow().clear_color;

    let outcome = {
      let gpu = self.gpu.as_mut().unwrap();
      gpu
        .frame(clear_color, capture)
        .map(|outcome| (outcome, gpu.width, gpu.height))
    };

    match outcome {
      Ok((outcome, width, height)) => {
        self.gpu_reinit_attempted = false;
        if let Some(rgba) = outcome.capture {
          self.finish_captures(width, height, rgba);
        }
      }
      Err(e) => {
        if !self.gpu_reinit_attempted {
          warn!("GPU target lost, attempting reinit: {e}");
          self.gpu_reinit_attempted = true;
          if let Some(gpu) = &mut self.gpu {
            gpu.try_reinit();
          }
        } else {
          // Device loss is not recoverable past one attempt.
          error!("GPU device lost: {e}");
          eprintln!("GPU device lost: {e}");
          self.exit_code = 1;
          self.quit = true;
        }
      }
    }

    if let Some(dbg) = &self.dbg {
      dbg.broadcast(&DbgEvent::FrameRendered {
        frame: self.frame_count,
      });
    }

    // waitForFrame bookkeeping.
    if !self.dbg_waits.is_empty() {
      let mut done = Vec::new();
      for wait in self.dbg_waits.iter_mut() {
        wait.2 = wait.2.saturating_sub(1);
        if wait.2 == 0 {
          done.push((wait.0, wait.1.clone()));
        }
      }
      self.dbg_waits.retain(|w| w.2 > 0);
      if let Some(dbg) = &self.dbg {
        for (connection, id) in done {
          dbg.reply(connection, id, Ok(json!(self.frame_count)));
        }
      }
    }
  }

  // Routes a finished capture to the CLI screenshot file and any waiting
  // debug clients.
  fn finish_captures(&mut self, width: u32, height: u32, rgba: Vec<u8>) {
    if let Some(path) = self.opts.screenshot.clone() {
      if !self.screenshot_done && self.frame_count >= self.opts.frames.unwrap_or(1) {
        match screenshot::write_png(&path, width, height, &rgba) {
          Ok(()) => {
            debug!("Screenshot written to {:?}", path);
            self.screenshot_done = true;
          }
          Err(e) => {
            error!("Screenshot failed: {e}");
            eprintln!("Screenshot failed: {e}");
            self.exit_code = 1;
            self.quit = true;
          }
        }
      }
    }

    let requests = std::mem::take(&mut self.dbg_screenshots);
    if requests.is_empty() {
      return;
    }
    let Some(dbg) = &self.dbg else { return };
    for (connection, id, path) in requests {
      let path = path.map(PathBuf::from).unwrap_or_else(|| {
        std::env::temp_dir().join(format!("mystral-shot-{}.png", self.frame_count))
      });
      let reply = screenshot::write_png(&path, width, height, &rgba)
        .map(|_| json!({ "path": path.to_string_lossy() }))
        .map_err(|e| e.to_string());
      dbg.reply(connection, id, reply);
    }
  }

  fn process_dbg(&mut self) {
    let Some(dbg) = self.dbg.take() else {
      return;
    };

    dbg.pump_events();
    for request in dbg.poll_requests() {
      match request.command {
        DbgCommand::GetFrameCount => {
          dbg.reply(request.connection, request.id, Ok(json!(self.frame_count)));
        }
        DbgCommand::Evaluate { expression } => {
          let result = self.js.eval_expression(&expression).map(|s| json!(s));
          dbg.reply(request.connection, request.id, result);
        }
        DbgCommand::KeyboardPress { key } => {
          self
            .js
            .emit_event("keydown", &[("key", EventField::Str(key.clone()))]);
          self
            .js
            .emit_event("keyup", &[("key", EventField::Str(key))]);
          dbg.reply(request.connection, request.id, Ok(json!(true)));
        }
        DbgCommand::WaitForFrame { count } => {
          self
            .dbg_waits
            .push((request.connection, request.id, count.max(1)));
        }
        DbgCommand::Screenshot { path } => {
          self
            .dbg_screenshots
            .push((request.connection, request.id, path));
        }
      }
    }

    self.dbg = Some(dbg);
  }

  /// Hot reload: clear timers/RAF/pending handles and module caches, then
  /// re-evaluate the entry.
  fn reload(&mut self) {
    self.reload_pending = false;
    let Some(entry) = self.entry_path.clone() else {
      return;
    };

    debug!("Reloading {:?}", entry);
    self.js.clear_for_reload();

    if let Err(e) = self.js.execute_entry(&entry) {
      error!("Reload failed: {e}");
      eprintln!("Reload failed: {e}");
    }
  }

  fn evaluate_exit(&mut self, io_pending: bool) {
    // process.exit takes effect after present.
    if let Some(code) = self.js.exit_code() {
      self.exit_code = code;
      self.quit = true;
    }

    if self.platform_quit {
      self.quit = true;
    }

    if self.quit {
      return;
    }

    // Windowless auto-exit: frame budget reached, screenshot finished, or
    // a fully idle loop.
    if !self.windowed {
      if self.opts.screenshot.is_some() {
        if self.screenshot_done {
          self.quit = true;
          return;
        }
      } else if let Some(frames) = self.opts.frames {
        if self.frame_count >= frames {
          self.quit = true;
          return;
        }
      }

      let busy = self.js.has_pending_work()
        || io_pending
        || self.js.engine.has_pending_imports()
        || !self.dbg_waits.is_empty()
        || self.dbg.as_ref().map(|d| d.has_clients()).unwrap_or(false);
      if busy {
        self.idle_frames = 0;
      } else {
        self.idle_frames += 1;
        if self.idle_frames >= IDLE_EXIT_FRAMES {
          debug!("Idle for {IDLE_EXIT_FRAMES} frames, exiting");
          self.quit = true;
        }
      }
    }
  }

  /// Orderly shutdown: release script handles, stop workers, notify debug
  /// clients.
  pub fn shutdown(&mut self) {
    if let Some(dbg) = &self.dbg {
      dbg.broadcast(&DbgEvent::Exit {
        code: self.exit_code,
      });
    }
    self.js.shutdown();
    self.io.borrow_mut().shutdown();
  }

  pub fn frame_count(&self) -> u64 {
    self.frame_count
  }

  pub fn exit_code(&self) -> i32 {
    self.exit_code
  }
}
