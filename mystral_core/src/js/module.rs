//! Module system.
//!
//! Resolution lives in [`resolver`], `package.json` handling in
//! [`manifest`], CommonJS loading in [`cjs`]. ES modules are compiled by
//! the engine through the [`SourceLoader`] hook; CommonJS and JSON modules
//! are evaluated host-side in classic-script mode.

pub mod cjs;
pub mod manifest;
pub mod resolver;

#[cfg(test)]
mod resolver_tests;

pub use resolver::Resolver;

use crate::js::engine::SourceHook;
use crate::js::transpiler::TypeScript;
use crate::prelude::*;

use std::path::Path;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
  Esm,
  Cjs,
  Json,
}

/// Loads module text, transpiling TypeScript sources to plain JavaScript.
pub fn load_transpiled(resolver: &Resolver, path: &str) -> AnyResult<String> {
  let source = resolver.load_text(path)?;
  let extension = Path::new(path)
    .extension()
    .and_then(|e| e.to_str())
    .unwrap_or("");
  if extension == "ts" || extension == "tsx" {
    TypeScript::compile(Some(path), &source)
      .map_err(|e| TheErr::ModuleLoad(path.into(), e.to_string()).into())
  } else {
    Ok(source)
  }
}

/// The ESM source hook installed into the engine.
///
/// JSON modules are wrapped as a default export; CommonJS files reached by
/// `import` evaluate through `require` and re-export their exports object
/// as the default binding.
pub struct SourceLoader {
  pub resolver: Rc<Resolver>,
}

impl SourceHook for SourceLoader {
  fn resolve(&self, base: Option<&str>, specifier: &str) -> AnyResult<String> {
    self.resolver.resolve(base, specifier)
  }

  fn load(&self, path: &str) -> AnyResult<String> {
    match self.resolver.format_of(path) {
      ModuleFormat::Json => {
        let text = self.resolver.load_text(path)?;
        let literal = serde_json::to_string(&text)
          .map_err(|e| TheErr::ModuleLoad(path.into(), e.to_string()))?;
        Ok(format!("export default JSON.parse({literal});"))
      }
      ModuleFormat::Cjs => {
        let literal = serde_json::to_string(path)
          .map_err(|e| TheErr::ModuleLoad(path.into(), e.to_string()))?;
        Ok(format!(
          "const __exports = globalThis.__MystralGlobal.requirePath({literal});\n\
           export default __exports;"
        ))
      }
      ModuleFormat::Esm => load_transpiled(&self.resolver, path),
    }
  }
}
