//! Async file reads.

use crate::io::queue::{CompletionQueue, FileCompletion, TaskId};
use crate::prelude::*;

use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

/// Reads files on the worker pool; falls back to synchronous reads when no
/// worker runtime exists.
pub struct FileReader {
  handle: Option<Handle>,
  tracker: TaskTracker,
  queue: CompletionQueue<FileCompletion>,
}

impl FileReader {
  pub fn new(handle: Option<Handle>, tracker: TaskTracker) -> Self {
    FileReader {
      handle,
      tracker,
      queue: CompletionQueue::new(),
    }
  }

  pub fn completions(&self) -> CompletionQueue<FileCompletion> {
    self.queue.clone()
  }

  /// Starts reading `path`; bytes (or the error string) complete under
  /// `task`.
  pub fn read(&self, task: TaskId, path: PathBuf) {
    let queue = self.queue.clone();
    match &self.handle {
      Some(handle) => {
        let fut = async move {
          let result = tokio::fs::read(&path)
            .await
            .map_err(|e| (e.kind(), e.to_string()));
          queue.push(FileCompletion { task, result });
        };
        handle.spawn(self.tracker.track_future(fut));
      }
      None => {
        trace!("File worker unavailable, blocking read {:?}", path);
        let result = std::fs::read(&path).map_err(|e| (e.kind(), e.to_string()));
        queue.push(FileCompletion { task, result });
      }
    }
  }
}
