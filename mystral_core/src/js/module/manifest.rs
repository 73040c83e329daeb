//! Package manifests (`package.json`).

use crate::prelude::*;

use serde_json::Value as Json;
use std::path::{Path, PathBuf};

/// Conditions honored when resolving conditional `exports`/`imports`,
/// checked in this order.
static CONDITIONS: &[&str] = &["import", "require", "default"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
  None,
  CommonJs,
  Module,
}

/// The subset of `package.json` the resolver consumes.
#[derive(Debug)]
pub struct PackageManifest {
  pub dir: PathBuf,
  pub main: Option<String>,
  pub module_type: ManifestType,
  exports: Option<Json>,
  imports: Option<Json>,
}

/// The two shapes an `imports` mapping can produce.
#[derive(Debug, PartialEq, Eq)]
pub enum ImportTarget {
  /// `./relative` target, already joined onto the package directory.
  Path(PathBuf),
  /// A bare specifier to re-resolve from the package directory.
  Bare(String),
}

impl PackageManifest {
  /// Loads `dir/package.json`. `Ok(None)` when absent; malformed JSON is a
  /// hard error (surfaced to script as a resolution failure).
  pub fn load(dir: &Path) -> AnyResult<Option<PackageManifest>> {
    let path = dir.join("package.json");
    let source = match std::fs::read_to_string(&path) {
      Ok(source) => source,
      Err(_) => return Ok(None),
    };
    let json: Json = serde_json::from_str(&source)
      .map_err(|e| TheErr::ModuleResolution(format!("invalid manifest {path:?}: {e}")))?;

    let module_type = match json.get("type").and_then(Json::as_str) {
      Some("module") => ManifestType::Module,
      Some("commonjs") => ManifestType::CommonJs,
      _ => ManifestType::None,
    };

    Ok(Some(PackageManifest {
      dir: dir.to_path_buf(),
      main: json
        .get("main")
        .and_then(Json::as_str)
        .map(|s| s.to_string()),
      module_type,
      exports: json.get("exports").cloned(),
      imports: json.get("imports").cloned(),
    }))
  }

  /// Walks up from `from` (a file or directory) to the nearest manifest.
  /// Stops at `node_modules` boundaries like node does.
  pub fn nearest(from: &Path) -> Option<PackageManifest> {
    let mut dir = if from.is_dir() {
      from.to_path_buf()
    } else {
      from.parent()?.to_path_buf()
    };
    loop {
      if dir.file_name().map(|n| n == "node_modules").unwrap_or(false) {
        return None;
      }
      if let Ok(Some(manifest)) = PackageManifest::load(&dir) {
        return Some(manifest);
      }
      dir = dir.parent()?.to_path_buf();
    }
  }

  pub fn has_exports(&self) -> bool {
    self.exports.is_some()
  }

  /// Resolves `subpath` (`"."` or `"./x"`) through the `exports` field.
  /// `Ok(None)` when the manifest does not map the subpath.
  pub fn resolve_exports(&self, subpath: &str) -> AnyResult<Option<PathBuf>> {
    let exports = match &self.exports {
      Some(exports) => exports,
      None => return Ok(None),
    };

    // Sugar: a bare string / array / condition object stands for { ".": … }.
    let as_subpath_map = match exports {
      Json::Object(map) => map.keys().all(|k| k.starts_with('.')),
      _ => false,
    };

    let target = if as_subpath_map {
      let map = exports.as_object().unwrap();
      if let Some(value) = map.get(subpath) {
        resolve_target(value, None)
      } else {
        // Subpath patterns: pick the match with the longest literal prefix.
        let mut best: Option<(usize, String, &Json)> = None;
        for (key, value) in map.iter() {
          if let Some((prefix, suffix)) = key.split_once('*') {
            if subpath.starts_with(prefix)
              && subpath.len() >= prefix.len() + suffix.len()
              && subpath.ends_with(suffix)
            {
              let star = &subpath[prefix.len()..subpath.len() - suffix.len()];
              if best.as_ref().map(|(n, _, _)| prefix.len() > *n).unwrap_or(true) {
                best = Some((prefix.len(), star.to_string(), value));
              }
            }
          }
        }
        match best {
          Some((_, star, value)) => resolve_target(value, Some(&star)),
          None => None,
        }
      }
    } else if subpath == "." {
      resolve_target(exports, None)
    } else {
      None
    };

    match target {
      Some(target) if target.starts_with("./") => Ok(Some(self.dir.join(&target[2..]))),
      Some(target) => Err(
        TheErr::ModuleResolution(format!(
          "invalid exports target {target:?} in {:?}",
          self.dir.join("package.json")
        ))
        .into(),
      ),
      None => Ok(None),
    }
  }

  /// Resolves a `#`-prefixed specifier through the `imports` field.
  pub fn resolve_imports(&self, specifier: &str) -> AnyResult<Option<ImportTarget>> {
    let imports = match &self.imports {
      Some(Json::Object(map)) => map,
      _ => return Ok(None),
    };

    let target = if let Some(value) = imports.get(specifier) {
      resolve_target(value, None)
    } else {
      let mut best: Option<(usize, String, &Json)> = None;
      for (key, value) in imports.iter() {
        if let Some((prefix, suffix)) = key.split_once('*') {
          if specifier.starts_with(prefix)
            && specifier.len() >= prefix.len() + suffix.len()
            && specifier.ends_with(suffix)
          {
            let star = &specifier[prefix.len()..specifier.len() - suffix.len()];
            if best.as_ref().map(|(n, _, _)| prefix.len() > *n).unwrap_or(true) {
              best = Some((prefix.len(), star.to_string(), value));
            }
          }
        }
      }
      match best {
        Some((_, star, value)) => resolve_target(value, Some(&star)),
        None => None,
      }
    };

    match target {
      Some(target) if target.starts_with("./") => {
        Ok(Some(ImportTarget::Path(self.dir.join(&target[2..]))))
      }
      Some(target) => Ok(Some(ImportTarget::Bare(target))),
      None => Ok(None),
    }
  }
}

// Collapses a conditional / array / string target into a concrete string,
// substituting the `*` capture when present.
fn resolve_target(value: &Json, star: Option<&str>) -> Option<String> {
  match value {
    Json::String(s) => Some(match star {
      Some(star) => s.replace('*', star),
      None => s.clone(),
    }),
    Json::Array(items) => items.iter().find_map(|item| resolve_target(item, star)),
    // Condition priority is ours, not the map's key order.
    Json::Object(map) => CONDITIONS
      .iter()
      .find_map(|condition| map.get(*condition).and_then(|v| resolve_target(v, star))),
    _ => None,
  }
}
