use crate::bundle::{Bundle, BundleWriter};
use crate::js::module::resolver::Resolver;
use crate::js::module::ModuleFormat;

use assert_fs::prelude::*;
use std::sync::Arc;

fn disk_resolver() -> Resolver {
  Resolver::new(None)
}

#[test]
fn relative_with_extension_probing() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("src/main.js").write_str("//").unwrap();
  temp.child("src/dep.ts").write_str("//").unwrap();
  temp.child("src/dep.js").write_str("//").unwrap();

  let resolver = disk_resolver();
  let base = temp.child("src/main.js").path().to_string_lossy().to_string();

  // `.ts` outranks `.js` in the search order.
  let resolved = resolver.resolve(Some(&base), "./dep").unwrap();
  assert!(resolved.ends_with("dep.ts"), "{resolved}");

  // Exact match always wins.
  let resolved = resolver.resolve(Some(&base), "./dep.js").unwrap();
  assert!(resolved.ends_with("dep.js"), "{resolved}");

  temp.close().unwrap();
}

#[test]
fn directory_index() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("src/main.js").write_str("//").unwrap();
  temp.child("src/widgets/index.js").write_str("//").unwrap();

  let resolver = disk_resolver();
  let base = temp.child("src/main.js").path().to_string_lossy().to_string();

  let resolved = resolver.resolve(Some(&base), "./widgets").unwrap();
  assert!(resolved.ends_with("index.js"), "{resolved}");

  temp.close().unwrap();
}

#[test]
fn bare_specifier_main() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("app/main.js").write_str("//").unwrap();
  temp
    .child("node_modules/tween/package.json")
    .write_str(r#"{ "main": "lib/tween.js" }"#)
    .unwrap();
  temp
    .child("node_modules/tween/lib/tween.js")
    .write_str("//")
    .unwrap();

  let resolver = disk_resolver();
  let base = temp.child("app/main.js").path().to_string_lossy().to_string();

  let resolved = resolver.resolve(Some(&base), "tween").unwrap();
  assert!(resolved.ends_with("tween.js"), "{resolved}");
  assert!(resolved.contains("node_modules"), "{resolved}");

  temp.close().unwrap();
}

#[test]
fn bare_specifier_exports_conditions() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("main.js").write_str("//").unwrap();
  temp
    .child("node_modules/vecmath/package.json")
    .write_str(
      r#"{
        "exports": {
          ".": { "import": "./dist/index.mjs", "default": "./dist/index.cjs" },
          "./simd": "./dist/simd.js",
          "./ops/*": "./dist/ops/*.js"
        }
      }"#,
    )
    .unwrap();
  temp
    .child("node_modules/vecmath/dist/index.mjs")
    .write_str("//")
    .unwrap();
  temp
    .child("node_modules/vecmath/dist/index.cjs")
    .write_str("//")
    .unwrap();
  temp
    .child("node_modules/vecmath/dist/simd.js")
    .write_str("//")
    .unwrap();
  temp
    .child("node_modules/vecmath/dist/ops/cross.js")
    .write_str("//")
    .unwrap();

  let resolver = disk_resolver();
  let base = temp.child("main.js").path().to_string_lossy().to_string();

  let resolved = resolver.resolve(Some(&base), "vecmath").unwrap();
  assert!(resolved.ends_with("index.mjs"), "{resolved}");

  let resolved = resolver.resolve(Some(&base), "vecmath/simd").unwrap();
  assert!(resolved.ends_with("simd.js"), "{resolved}");

  // `*` subpath pattern.
  let resolved = resolver.resolve(Some(&base), "vecmath/ops/cross").unwrap();
  assert!(resolved.ends_with("ops/cross.js"), "{resolved}");

  // Unmapped subpaths are not reachable once `exports` exists.
  assert!(resolver.resolve(Some(&base), "vecmath/private").is_err());

  temp.close().unwrap();
}

#[test]
fn hash_imports() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp
    .child("package.json")
    .write_str(r#"{ "imports": { "#utils/*": "./src/utils/*.js" } }"#)
    .unwrap();
  temp.child("src/main.js").write_str("//").unwrap();
  temp.child("src/utils/clamp.js").write_str("//").unwrap();

  let resolver = disk_resolver();
  let base = temp.child("src/main.js").path().to_string_lossy().to_string();

  let resolved = resolver.resolve(Some(&base), "#utils/clamp").unwrap();
  assert!(resolved.ends_with("clamp.js"), "{resolved}");

  temp.close().unwrap();
}

#[test]
fn resolver_is_deterministic() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("a/main.js").write_str("//").unwrap();
  temp.child("a/dep.js").write_str("//").unwrap();

  let resolver = disk_resolver();
  let base = temp.child("a/main.js").path().to_string_lossy().to_string();

  let first = resolver.resolve(Some(&base), "./dep").unwrap();
  for _ in 0..8 {
    assert_eq!(resolver.resolve(Some(&base), "./dep").unwrap(), first);
  }

  temp.close().unwrap();
}

#[test]
fn format_detection() {
  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("plain/mod.js").write_str("//").unwrap();
  temp
    .child("esm/package.json")
    .write_str(r#"{ "type": "module" }"#)
    .unwrap();
  temp.child("esm/mod.js").write_str("//").unwrap();

  let resolver = disk_resolver();

  let plain = temp.child("plain/mod.js").path().to_string_lossy().to_string();
  let esm = temp.child("esm/mod.js").path().to_string_lossy().to_string();

  // Explicit extension wins; manifest type next; default CommonJS.
  assert_eq!(resolver.format_of("x/y.mjs"), ModuleFormat::Esm);
  assert_eq!(resolver.format_of("x/y.cjs"), ModuleFormat::Cjs);
  assert_eq!(resolver.format_of("x/y.json"), ModuleFormat::Json);
  assert_eq!(resolver.format_of(&plain), ModuleFormat::Cjs);
  assert_eq!(resolver.format_of(&esm), ModuleFormat::Esm);

  temp.close().unwrap();
}

fn bundled_resolver(temp: &assert_fs::TempDir) -> Resolver {
  let mut writer = BundleWriter::new("src/main.js");
  writer.add_file("src/main.js", b"//".to_vec());
  writer.add_file("src/dep.js", b"// bundled".to_vec());
  writer.add_file("assets/data.json", b"{}".to_vec());

  let image = temp.child("app");
  std::fs::write(image.path(), b"PROGRAM").unwrap();
  writer.append_to(image.path()).unwrap();

  let bundle = Bundle::from_file(image.path()).unwrap().unwrap();
  Resolver::new(Some(Arc::new(bundle)))
}

#[test]
fn bundle_relative_resolution() {
  let temp = assert_fs::TempDir::new().unwrap();
  let resolver = bundled_resolver(&temp);

  let resolved = resolver.resolve(Some("src/main.js"), "./dep").unwrap();
  assert_eq!(resolved, "src/dep.js");
  assert_eq!(resolver.load_text("src/dep.js").unwrap(), "// bundled");

  temp.close().unwrap();
}

#[test]
fn asset_scheme_resolution() {
  let temp = assert_fs::TempDir::new().unwrap();
  let resolver = bundled_resolver(&temp);

  let resolved = resolver.resolve(None, "asset://assets/data.json").unwrap();
  assert_eq!(resolved, "assets/data.json");

  assert!(resolver.resolve(None, "asset://missing.bin").is_err());

  temp.close().unwrap();
}

#[test]
fn bundle_is_preferred_over_disk() {
  let temp = assert_fs::TempDir::new().unwrap();
  let resolver = bundled_resolver(&temp);

  // A disk file with the same relative name must lose to the bundle entry.
  temp.child("src/dep.js").write_str("// disk").unwrap();

  let resolved = resolver.resolve(Some("src/main.js"), "./dep").unwrap();
  assert_eq!(resolved, "src/dep.js");
  assert_eq!(resolver.load_text(&resolved).unwrap(), "// bundled");

  temp.close().unwrap();
}
