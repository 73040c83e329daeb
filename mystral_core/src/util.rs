//! Path utils.

use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};

/// Absolutize a path and render it with the platform separator.
pub fn absolute(path: &Path) -> PathBuf {
  path
    .absolutize()
    .map(|p| p.to_path_buf())
    .unwrap_or_else(|_| path.to_path_buf())
}

/// Normalize a bundle-relative path: forward slashes, no `.` segments,
/// `..` segments resolved where possible.
pub fn normalize_bundle_path(path: &str) -> String {
  let mut parts: Vec<&str> = Vec::new();
  for seg in path.split(['/', '\\']) {
    match seg {
      "" | "." => {}
      ".." => {
        parts.pop();
      }
      other => parts.push(other),
    }
  }
  parts.join("/")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_bundle_path1() {
    assert_eq!(normalize_bundle_path("./a/b.js"), "a/b.js");
    assert_eq!(normalize_bundle_path("a\\b\\c.png"), "a/b/c.png");
    assert_eq!(normalize_bundle_path("a/./b/../c"), "a/c");
    assert_eq!(normalize_bundle_path("/a//b"), "a/b");
  }
}
