//! File watching.

use crate::io::queue::{CompletionQueue, WatchEvent, WatchKind};
use crate::prelude::*;

use notify::Watcher;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub type WatchId = u64;

fn next_watch_id() -> WatchId {
  static NEXT: AtomicU64 = AtomicU64::new(1);
  NEXT.fetch_add(1, Ordering::Relaxed)
}

fn map_kind(kind: &notify::EventKind) -> Option<WatchKind> {
  use notify::event::ModifyKind;
  use notify::EventKind;
  match kind {
    EventKind::Modify(ModifyKind::Name(_)) => Some(WatchKind::Renamed),
    EventKind::Modify(_) => Some(WatchKind::Modified),
    // Editors replace files with remove+create; surface the create as a
    // modification of the watched path.
    EventKind::Create(_) => Some(WatchKind::Modified),
    EventKind::Remove(_) => Some(WatchKind::Deleted),
    _ => None,
  }
}

/// A matched watch notification, ready for callback dispatch.
#[derive(Debug, Clone)]
pub struct WatchHit {
  pub watch: WatchId,
  pub path: PathBuf,
  pub kind: WatchKind,
}

/// Watches filesystem paths. The platform notifier runs its own thread and
/// publishes raw events; [`FileWatcher::drain`] matches them to live
/// registrations on the main thread.
pub struct FileWatcher {
  watcher: Option<notify::RecommendedWatcher>,
  queue: CompletionQueue<WatchEvent>,
  registry: Vec<(WatchId, PathBuf)>,
}

impl FileWatcher {
  pub fn new() -> Self {
    let queue: CompletionQueue<WatchEvent> = CompletionQueue::new();
    let events = queue.clone();

    let watcher = notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
      if let Ok(event) = result {
        if let Some(kind) = map_kind(&event.kind) {
          for path in event.paths.iter() {
            events.push(WatchEvent {
              path: path.clone(),
              kind,
            });
          }
        }
      }
    });

    let watcher = match watcher {
      Ok(watcher) => Some(watcher),
      Err(e) => {
        warn!("File watcher unavailable: {:?}", e);
        None
      }
    };

    FileWatcher {
      watcher,
      queue,
      registry: Vec::new(),
    }
  }

  /// Registers a watch on `path`.
  pub fn watch(&mut self, path: &Path) -> AnyResult<WatchId> {
    let watcher = self
      .watcher
      .as_mut()
      .ok_or_else(|| TheErr::Io("file watcher unavailable".into()))?;
    watcher.watch(path, notify::RecursiveMode::NonRecursive)?;
    let id = next_watch_id();
    self.registry.push((id, path.to_path_buf()));
    Ok(id)
  }

  /// Stops a watch; no further events are delivered for `id`.
  pub fn unwatch(&mut self, id: WatchId) {
    let Some(index) = self.registry.iter().position(|(i, _)| *i == id) else {
      return;
    };
    let (_, path) = self.registry.remove(index);

    // Only drop the OS watch when no other registration shares the path.
    let still_used = self.registry.iter().any(|(_, p)| *p == path);
    if !still_used {
      if let Some(watcher) = self.watcher.as_mut() {
        let _ = watcher.unwatch(&path);
      }
    }
  }

  pub fn watch_count(&self) -> usize {
    self.registry.len()
  }

  /// Drains raw events and matches them against live registrations.
  /// Deletion events are reported once per path per drain even when the
  /// platform re-reports them.
  pub fn drain(&mut self) -> Vec<WatchHit> {
    let events = self.queue.drain();
    if events.is_empty() {
      return Vec::new();
    }

    let mut hits = Vec::new();
    let mut deleted_seen: HashSet<(WatchId, PathBuf)> = HashSet::new();

    for event in events {
      for (id, watched) in self.registry.iter() {
        let matched = event.path == *watched || event.path.starts_with(watched);
        if !matched {
          continue;
        }
        if event.kind == WatchKind::Deleted {
          if !deleted_seen.insert((*id, event.path.clone())) {
            continue;
          }
        }
        hits.push(WatchHit {
          watch: *id,
          path: event.path.clone(),
          kind: event.kind,
        });
      }
    }
    hits
  }
}

impl Default for FileWatcher {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_mapping() {
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind, RenameMode};
    use notify::EventKind;

    assert_eq!(
      map_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
      Some(WatchKind::Modified)
    );
    assert_eq!(
      map_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Any))),
      Some(WatchKind::Renamed)
    );
    assert_eq!(
      map_kind(&EventKind::Remove(RemoveKind::File)),
      Some(WatchKind::Deleted)
    );
    assert_eq!(
      map_kind(&EventKind::Create(CreateKind::File)),
      Some(WatchKind::Modified)
    );
    assert_eq!(map_kind(&EventKind::Access(notify::event::AccessKind::Any)), None);
  }
}
