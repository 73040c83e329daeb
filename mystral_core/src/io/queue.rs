//! Completion queues.
//!
//! Worker threads publish results here; the main thread drains them between
//! frames and fires the callbacks it kept for each task id. The mutex is
//! held only long enough to swap the backing vector.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Task id pairing a completion with the callback retained on the main
/// thread. Starts from 1.
pub type TaskId = u64;

pub fn next_task_id() -> TaskId {
  static NEXT: AtomicU64 = AtomicU64::new(1);
  NEXT.fetch_add(1, Ordering::Relaxed)
}

/// MPSC queue of completion records.
pub struct CompletionQueue<T> {
  inner: Arc<Mutex<Vec<T>>>,
}

impl<T> CompletionQueue<T> {
  pub fn new() -> Self {
    CompletionQueue {
      inner: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn push(&self, item: T) {
    self.inner.lock().push(item);
  }

  /// Swaps the queue out and returns everything enqueued so far, in order.
  pub fn drain(&self) -> Vec<T> {
    std::mem::take(&mut *self.inner.lock())
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().is_empty()
  }
}

impl<T> Clone for CompletionQueue<T> {
  fn clone(&self) -> Self {
    CompletionQueue {
      inner: self.inner.clone(),
    }
  }
}

impl<T> Default for CompletionQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// HTTP response payload as observed by script.
#[derive(Debug, Clone)]
pub struct HttpResponseData {
  pub ok: bool,
  pub status: u16,
  pub url: String,
  /// Lowercased keys, last value wins on duplicates.
  pub headers: Vec<(String, String)>,
  pub bytes: Vec<u8>,
  pub error: Option<String>,
}

impl HttpResponseData {
  pub fn from_error(url: &str, error: String) -> Self {
    HttpResponseData {
      ok: false,
      status: 0,
      url: url.to_string(),
      headers: Vec::new(),
      bytes: Vec::new(),
      error: Some(error),
    }
  }
}

#[derive(Debug)]
pub struct HttpCompletion {
  pub task: TaskId,
  pub response: HttpResponseData,
}

#[derive(Debug)]
pub struct FileCompletion {
  pub task: TaskId,
  /// Bytes, or the error kind (drives fetch status mapping) plus text.
  pub result: Result<Vec<u8>, (std::io::ErrorKind, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
  Modified,
  Renamed,
  Deleted,
}

/// Raw filesystem notification, matched to watch registrations on the main
/// thread.
#[derive(Debug, Clone)]
pub struct WatchEvent {
  pub path: PathBuf,
  pub kind: WatchKind,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn drain_preserves_order() {
    let queue: CompletionQueue<u32> = CompletionQueue::new();
    for i in 0..16 {
      queue.push(i);
    }
    assert_eq!(queue.drain(), (0..16).collect::<Vec<_>>());
    assert!(queue.is_empty());
  }

  #[test]
  fn task_ids_are_unique() {
    let a = next_task_id();
    let b = next_task_id();
    assert!(b > a);
  }
}
