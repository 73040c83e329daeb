//! Platform layer seam.
//!
//! Window and surface acquisition is an external collaborator: an embedder
//! supplies a [`NativeWindow`] (raw handles plus drawable size) and pumps
//! its own events into the loop through [`PlatformHost`]. The CLI's
//! headless modes run on [`HeadlessHost`], which owns no window at all.

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// A native window produced by the external platform layer.
pub struct NativeWindow {
  pub raw_display_handle: RawDisplayHandle,
  pub raw_window_handle: RawWindowHandle,
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
  Quit,
  Resized { width: u32, height: u32 },
  KeyDown { key: String },
  KeyUp { key: String },
}

/// One frame's worth of platform interaction.
pub trait PlatformHost {
  /// Drains pending input/window events; non-blocking.
  fn poll_events(&mut self) -> Vec<PlatformEvent>;

  /// The native window to present into, when one exists.
  fn window(&self) -> Option<&NativeWindow>;

  /// Current drawable size in pixels.
  fn drawable_size(&self) -> (u32, u32);
}

/// No window, no input; drawable size is the configured target size.
/// Injected events (debug channel key presses) pass through the queue.
pub struct HeadlessHost {
  width: u32,
  height: u32,
  injected: Vec<PlatformEvent>,
}

impl HeadlessHost {
  pub fn new(width: u32, height: u32) -> Self {
    HeadlessHost {
      width,
      height,
      injected: Vec::new(),
    }
  }

  pub fn inject(&mut self, event: PlatformEvent) {
    self.injected.push(event);
  }
}

impl PlatformHost for HeadlessHost {
  fn poll_events(&mut self) -> Vec<PlatformEvent> {
    std::mem::take(&mut self.injected)
  }

  fn window(&self) -> Option<&NativeWindow> {
    None
  }

  fn drawable_size(&self) -> (u32, u32) {
    (self.width, self.height)
  }
}
