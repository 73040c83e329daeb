//! Module resolution.
//!
//! Node-style rules, checked in order against a specifier and a referrer:
//!
//! 1. Relative (`./`, `../`) and absolute specifiers resolve as file, then
//!    as directory (`package.json` main / `index.*`).
//! 2. Bare specifiers walk ancestor `node_modules` directories and consult
//!    the package manifest (`exports` with conditions and `*` subpath
//!    patterns, then `main`). `#`-prefixed specifiers go through the
//!    nearest manifest's `imports`.
//! 3. `asset://…` and specifiers found in the embedded bundle directory
//!    resolve to bundle entries; a referrer living in the bundle keeps
//!    relative resolution in bundle space.
//!
//! Extension search order: exact, `.ts`, `.tsx`, `.mjs`, `.cjs`, `.js`,
//! `.json`; directories try `index.*` in the same order. Resolution is a
//! pure function of the filesystem/bundle snapshot.

use crate::bundle::Bundle;
use crate::js::module::manifest::{ImportTarget, ManifestType, PackageManifest};
use crate::js::module::ModuleFormat;
use crate::prelude::*;
use crate::util::normalize_bundle_path;

use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

static FILE_EXTENSIONS: &[&str] = &["ts", "tsx", "mjs", "cjs", "js", "json"];

fn has_windows_drive(specifier: &str) -> bool {
  let bytes = specifier.as_bytes();
  bytes.len() >= 3
    && bytes[0].is_ascii_alphabetic()
    && bytes[1] == b':'
    && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Resolves and loads module paths from disk and from the embedded bundle.
///
/// Disk paths are absolute platform paths; bundle paths are normalized
/// relative keys into the bundle directory.
pub struct Resolver {
  bundle: Option<Arc<Bundle>>,
}

impl Resolver {
  pub fn new(bundle: Option<Arc<Bundle>>) -> Self {
    Resolver { bundle }
  }

  pub fn bundle(&self) -> Option<&Arc<Bundle>> {
    self.bundle.as_ref()
  }

  /// Whether `path` refers into the embedded bundle (with or without one of
  /// the probeable extensions).
  pub fn is_bundle_path(&self, path: &str) -> bool {
    match &self.bundle {
      Some(bundle) => bundle.contains(path),
      None => false,
    }
  }

  /// Resolve `specifier` against an optional referrer module path.
  pub fn resolve(&self, base: Option<&str>, specifier: &str) -> AnyResult<String> {
    // `asset://` always addresses the bundle.
    if let Some(rest) = specifier.strip_prefix("asset://") {
      return self.resolve_in_bundle(&normalize_bundle_path(rest), specifier);
    }

    let is_relative = specifier.starts_with("./") || specifier.starts_with("../");

    // A referrer inside the bundle keeps relative resolution in bundle
    // space.
    if is_relative {
      if let Some(base) = base {
        if self.is_bundle_path(base) {
          let parent = match base.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
          };
          let joined = normalize_bundle_path(&format!("{parent}/{specifier}"));
          return self.resolve_in_bundle(&joined, specifier);
        }
      }
    }

    // Absolute paths.
    if specifier.starts_with('/') || has_windows_drive(specifier) {
      let path = Path::new(specifier).absolutize()?.to_path_buf();
      return self.resolve_as_path(&path, specifier);
    }

    // Relative paths, anchored at the referrer's directory.
    if is_relative {
      let base_dir = match base {
        Some(base) => Path::new(base)
          .parent()
          .map(|p| p.to_path_buf())
          .unwrap_or_else(|| PathBuf::from(".")),
        None => std::env::current_dir()?,
      };
      let path = base_dir.join(specifier).absolutize()?.to_path_buf();
      return match self.resolve_as_path(&path, specifier) {
        Ok(path) => Ok(path),
        Err(e) => {
          // Bundle entries shadow missing disk files.
          if self.bundle.is_some() {
            let key = normalize_bundle_path(specifier);
            if let Ok(path) = self.resolve_in_bundle(&key, specifier) {
              return Ok(path);
            }
          }
          Err(e)
        }
      };
    }

    // `#imports` of the nearest package manifest.
    if specifier.starts_with('#') {
      return self.resolve_hash_import(base, specifier);
    }

    // Direct hit in the bundle directory.
    if self.bundle.is_some() {
      let key = normalize_bundle_path(specifier);
      if let Ok(path) = self.resolve_in_bundle(&key, specifier) {
        return Ok(path);
      }
    }

    // Bare specifier: ancestor node_modules walk.
    self.resolve_bare(base, specifier)
  }

  /// Detects the module format of a resolved path.
  ///
  /// Explicit extension wins, then the nearest manifest's type
  /// declaration, then the built-in default (CommonJS).
  pub fn format_of(&self, path: &str) -> ModuleFormat {
    let extension = Path::new(path)
      .extension()
      .and_then(|e| e.to_str())
      .unwrap_or("");
    match extension {
      "mjs" => ModuleFormat::Esm,
      "cjs" => ModuleFormat::Cjs,
      "json" => ModuleFormat::Json,
      _ => match self.nearest_manifest_type(path) {
        ManifestType::Module => ModuleFormat::Esm,
        _ => ModuleFormat::Cjs,
      },
    }
  }

  fn nearest_manifest_type(&self, path: &str) -> ManifestType {
    if self.is_bundle_path(path) {
      // Walk bundle-space ancestors for an embedded package.json.
      let bundle = self.bundle.as_ref().unwrap();
      let mut dir = match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
      };
      loop {
        let manifest = if dir.is_empty() {
          "package.json".to_string()
        } else {
          format!("{dir}/package.json")
        };
        if bundle.contains(&manifest) {
          if let Ok(bytes) = bundle.read_file(&manifest) {
            if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) {
              return match json.get("type").and_then(|t| t.as_str()) {
                Some("module") => ManifestType::Module,
                Some("commonjs") => ManifestType::CommonJs,
                _ => ManifestType::None,
              };
            }
          }
        }
        match dir.rsplit_once('/') {
          Some((parent, _)) => dir = parent.to_string(),
          None if !dir.is_empty() => dir = String::new(),
          None => return ManifestType::None,
        }
      }
    }

    PackageManifest::nearest(Path::new(path))
      .map(|m| m.module_type)
      .unwrap_or(ManifestType::None)
  }

  /// Loads the raw text of a resolved module path, bundle first.
  pub fn load_text(&self, path: &str) -> AnyResult<String> {
    let bytes = self.load_bytes(path)?;
    String::from_utf8(bytes)
      .map_err(|_| TheErr::ModuleLoad(path.into(), "not valid UTF-8".into()).into())
  }

  /// Loads the raw bytes of a resolved path, bundle first.
  pub fn load_bytes(&self, path: &str) -> AnyResult<Vec<u8>> {
    if let Some(bundle) = &self.bundle {
      if bundle.contains(path) {
        return bundle.read_file(path);
      }
    }
    std::fs::read(path).map_err(|e| TheErr::ModuleLoad(path.into(), e.to_string()).into())
  }

  // Resolution helpers {

  fn resolve_in_bundle(&self, key: &str, specifier: &str) -> AnyResult<String> {
    let bundle = self
      .bundle
      .as_ref()
      .ok_or_else(|| TheErr::ModuleResolution(format!("{specifier:?} (no bundle present)")))?;

    if bundle.contains(key) {
      return Ok(key.to_string());
    }
    for ext in FILE_EXTENSIONS {
      let candidate = format!("{key}.{ext}");
      if bundle.contains(&candidate) {
        return Ok(candidate);
      }
    }
    for ext in FILE_EXTENSIONS {
      let candidate = format!("{key}/index.{ext}");
      if bundle.contains(&candidate) {
        return Ok(candidate);
      }
    }
    anyhow::bail!(TheErr::ModuleResolution(specifier.to_string()))
  }

  fn transform(&self, path: PathBuf) -> String {
    path.to_string_lossy().to_string()
  }

  fn resolve_as_path(&self, path: &Path, specifier: &str) -> AnyResult<String> {
    self
      .resolve_as_file(path)
      .or_else(|| self.resolve_as_directory(path))
      .ok_or_else(|| TheErr::ModuleResolution(specifier.to_string()).into())
  }

  fn resolve_as_file(&self, path: &Path) -> Option<String> {
    if path.is_file() {
      return Some(self.transform(path.to_path_buf()));
    }
    // Exact miss: append extensions in search order.
    let raw = path.to_string_lossy();
    for ext in FILE_EXTENSIONS {
      let candidate = PathBuf::from(format!("{raw}.{ext}"));
      if candidate.is_file() {
        return Some(self.transform(candidate));
      }
    }
    None
  }

  fn resolve_as_directory(&self, path: &Path) -> Option<String> {
    if !path.is_dir() {
      return None;
    }
    // Directory main from its own manifest, then index files.
    if let Ok(Some(manifest)) = PackageManifest::load(path) {
      if let Some(main) = &manifest.main {
        if let Some(resolved) = self
          .resolve_as_file(&path.join(main))
          .or_else(|| self.resolve_as_directory(&path.join(main)))
        {
          return Some(resolved);
        }
      }
    }
    for ext in FILE_EXTENSIONS {
      let candidate = path.join(format!("index.{ext}"));
      if candidate.is_file() {
        return Some(self.transform(candidate));
      }
    }
    None
  }

  fn base_dir(&self, base: Option<&str>) -> AnyResult<PathBuf> {
    match base {
      Some(base) => Ok(
        Path::new(base)
          .parent()
          .map(|p| p.to_path_buf())
          .unwrap_or_else(|| PathBuf::from(".")),
      ),
      None => Ok(std::env::current_dir()?),
    }
  }

  fn resolve_hash_import(&self, base: Option<&str>, specifier: &str) -> AnyResult<String> {
    let base_dir = self.base_dir(base)?;
    let manifest = PackageManifest::nearest(&base_dir)
      .ok_or_else(|| TheErr::ModuleResolution(specifier.to_string()))?;

    match manifest.resolve_imports(specifier)? {
      Some(ImportTarget::Path(path)) => self.resolve_as_path(&path, specifier),
      Some(ImportTarget::Bare(bare)) => {
        let anchor = manifest.dir.join("package.json");
        self.resolve_bare(Some(&self.transform(anchor)), &bare)
      }
      None => anyhow::bail!(TheErr::ModuleResolution(specifier.to_string())),
    }
  }

  fn resolve_bare(&self, base: Option<&str>, specifier: &str) -> AnyResult<String> {
    let (name, subpath) = split_bare_specifier(specifier)
      .ok_or_else(|| TheErr::ModuleResolution(specifier.to_string()))?;

    let mut dir = Some(self.base_dir(base)?);
    while let Some(current) = dir {
      let package_dir = current.join("node_modules").join(&name);
      if package_dir.is_dir() {
        return self.resolve_package(&package_dir, &subpath, specifier);
      }
      dir = current.parent().map(|p| p.to_path_buf());
    }

    anyhow::bail!(TheErr::ModuleResolution(specifier.to_string()))
  }

  fn resolve_package(
    &self,
    package_dir: &Path,
    subpath: &str,
    specifier: &str,
  ) -> AnyResult<String> {
    let manifest = PackageManifest::load(package_dir)?;

    if let Some(manifest) = &manifest {
      if manifest.has_exports() {
        // With `exports` present the map is authoritative.
        return match manifest.resolve_exports(subpath)? {
          Some(target) if target.is_file() => Ok(self.transform(target)),
          Some(target) => self.resolve_as_path(&target, specifier),
          None => anyhow::bail!(TheErr::ModuleResolution(specifier.to_string())),
        };
      }
      if subpath == "." {
        if let Some(main) = &manifest.main {
          return self.resolve_as_path(&package_dir.join(main), specifier);
        }
      }
    }

    if subpath == "." {
      self.resolve_as_path(package_dir, specifier)
    } else {
      self.resolve_as_path(&package_dir.join(&subpath[2..]), specifier)
    }
  }

  // Resolution helpers }
}

// Splits a bare specifier into a package name (scoped or not) and a `"."`
// or `"./…"` subpath.
fn split_bare_specifier(specifier: &str) -> Option<(String, String)> {
  if specifier.is_empty() || specifier.starts_with('.') || specifier.starts_with('/') {
    return None;
  }
  if specifier.starts_with('@') {
    let mut segments = specifier.splitn(3, '/');
    let scope = segments.next()?;
    let name = segments.next()?;
    let rest = segments.next();
    let package = format!("{scope}/{name}");
    let subpath = match rest {
      Some(rest) => format!("./{rest}"),
      None => ".".to_string(),
    };
    Some((package, subpath))
  } else {
    let mut segments = specifier.splitn(2, '/');
    let package = segments.next()?.to_string();
    let subpath = match segments.next() {
      Some(rest) => format!("./{rest}"),
      None => ".".to_string(),
    };
    Some((package, subpath))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_bare_specifier1() {
    assert_eq!(
      split_bare_specifier("lodash"),
      Some(("lodash".to_string(), ".".to_string()))
    );
    assert_eq!(
      split_bare_specifier("lodash/map"),
      Some(("lodash".to_string(), "./map".to_string()))
    );
    assert_eq!(
      split_bare_specifier("@scope/pkg"),
      Some(("@scope/pkg".to_string(), ".".to_string()))
    );
    assert_eq!(
      split_bare_specifier("@scope/pkg/deep/mod"),
      Some(("@scope/pkg".to_string(), "./deep/mod".to_string()))
    );
    assert_eq!(split_bare_specifier("./relative"), None);
  }
}
