//! Async I/O layer.
//!
//! One worker runtime backs HTTP and file reads; the platform notifier
//! thread backs file watches. Workers never execute script code, they only
//! enqueue completions; the main thread drains queues between frames and
//! dispatches the callbacks it retained (see [`crate::js`]).

pub mod fsio;
pub mod http;
pub mod queue;
pub mod watch;

use crate::prelude::*;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the worker runtime and the three I/O subsystems.
///
/// Initialization is idempotent in effect: a failed runtime build is
/// reported once and every subsystem falls back to its synchronous path.
pub struct IoDriver {
  runtime: Option<tokio::runtime::Runtime>,
  pub http: http::HttpClient,
  pub files: fsio::FileReader,
  pub watcher: watch::FileWatcher,
  cancellation: CancellationToken,
  tracker: TaskTracker,
  shut_down: bool,
}

impl IoDriver {
  pub fn new() -> Self {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .thread_name("mystral-io")
      .enable_all()
      .build()
    {
      Ok(runtime) => Some(runtime),
      Err(e) => {
        error!("Failed to start I/O workers, falling back to sync I/O: {e:?}");
        None
      }
    };

    let handle = runtime.as_ref().map(|rt| rt.handle().clone());
    let tracker = TaskTracker::new();

    IoDriver {
      http: http::HttpClient::new(handle.clone(), tracker.clone()),
      files: fsio::FileReader::new(handle, tracker.clone()),
      watcher: watch::FileWatcher::new(),
      runtime,
      cancellation: CancellationToken::new(),
      tracker,
      shut_down: false,
    }
  }

  /// One non-blocking poll step. Ready completions are already queued by
  /// the workers; this just reports whether active handles remain.
  pub fn step(&self) -> bool {
    self.pending()
  }

  /// Whether in-flight tasks or live watches exist.
  pub fn pending(&self) -> bool {
    self.tracker.len() > 0 || self.watcher.watch_count() > 0
  }

  /// Idempotent shutdown; waits for in-flight tasks to finish.
  pub fn shutdown(&mut self) {
    if self.shut_down {
      return;
    }
    self.shut_down = true;

    self.cancellation.cancel();
    self.tracker.close();
    if let Some(runtime) = self.runtime.take() {
      let tracker = self.tracker.clone();
      runtime.block_on(async move {
        tracker.wait().await;
      });
      runtime.shutdown_background();
    }
  }
}

impl Default for IoDriver {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for IoDriver {
  fn drop(&mut self) {
    self.shutdown();
  }
}
