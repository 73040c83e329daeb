use crate::bundle::*;

use std::io::Write;

fn fake_program() -> Vec<u8> {
  // Arbitrary "program image" prefix; contents never interpreted.
  let mut image = vec![0x7fu8, b'E', b'L', b'F'];
  image.extend_from_slice(&[0xAB; 256]);
  image
}

fn write_image(dir: &tempfile::TempDir, writer: &BundleWriter) -> std::path::PathBuf {
  let path = dir.path().join("app");
  let mut file = std::fs::File::create(&path).unwrap();
  file.write_all(&fake_program()).unwrap();
  file.write_all(&writer.encode()).unwrap();
  path
}

#[test]
fn round_trip() {
  let dir = tempfile::tempdir().unwrap();

  let mut writer = BundleWriter::new("main.js");
  writer.add_file("main.js", b"console.log('hi');".to_vec());
  writer.add_file("assets/data.json", b"{\"k\":1}".to_vec());
  let path = write_image(&dir, &writer);

  let bundle = Bundle::from_file(&path).unwrap().unwrap();
  assert_eq!(bundle.entry(), "main.js");
  assert!(bundle.contains("main.js"));
  assert!(bundle.contains("assets/data.json"));
  assert_eq!(bundle.read_file("main.js").unwrap(), b"console.log('hi');");
  assert_eq!(bundle.read_file("assets/data.json").unwrap(), b"{\"k\":1}");
}

#[test]
fn path_normalization() {
  let dir = tempfile::tempdir().unwrap();

  let mut writer = BundleWriter::new("./src/main.js");
  writer.add_file("./assets\\img.png", vec![1, 2, 3]);
  let path = write_image(&dir, &writer);

  let bundle = Bundle::from_file(&path).unwrap().unwrap();
  assert_eq!(bundle.entry(), "src/main.js");
  assert!(bundle.contains("assets/img.png"));
  assert!(bundle.contains("./assets/img.png"));
  assert_eq!(bundle.read_file("assets/./img.png").unwrap(), vec![1, 2, 3]);
}

#[test]
fn no_bundle() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("plain");
  std::fs::write(&path, fake_program()).unwrap();

  assert!(Bundle::from_file(&path).unwrap().is_none());
}

#[test]
fn malformed_footer_is_ignored() {
  let dir = tempfile::tempdir().unwrap();

  let mut writer = BundleWriter::new("main.js");
  writer.add_file("main.js", b"x".to_vec());
  let path = write_image(&dir, &writer);

  // Corrupt the trailing footer offset.
  let mut data = std::fs::read(&path).unwrap();
  let len = data.len();
  data[len - 8..].copy_from_slice(&u64::MAX.to_le_bytes());
  std::fs::write(&path, &data).unwrap();

  assert!(Bundle::from_file(&path).unwrap().is_none());
}

#[test]
fn truncated_directory_is_ignored() {
  let dir = tempfile::tempdir().unwrap();

  let mut writer = BundleWriter::new("main.js");
  writer.add_file("main.js", b"abcdef".to_vec());
  let encoded = writer.encode();

  // Valid magic and version, directory chopped off right after them.
  let path = dir.path().join("app");
  let mut file = std::fs::File::create(&path).unwrap();
  file.write_all(&fake_program()).unwrap();
  file.write_all(&encoded[..12]).unwrap();
  file.write_all(&12u64.to_le_bytes()).unwrap();
  drop(file);

  assert!(Bundle::from_file(&path).unwrap().is_none());
}

#[test]
fn empty_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("empty");
  std::fs::write(&path, b"").unwrap();
  assert!(Bundle::from_file(&path).unwrap().is_none());
}

#[test]
fn compile_round_trip() {
  use assert_fs::prelude::*;

  let temp = assert_fs::TempDir::new().unwrap();
  temp.child("main.js").write_str("console.log('hi');").unwrap();
  temp
    .child("assets/data.json")
    .write_str(r#"{"k":1}"#)
    .unwrap();

  let output = temp.path().join("app");
  let opts = crate::cli::CompileOptions {
    entry: temp.path().join("main.js"),
    include: vec![temp.path().join("assets")],
    output: Some(output.clone()),
    root: Some(temp.path().to_path_buf()),
  };

  let written = compile_executable(&opts).unwrap();
  assert_eq!(written, output);

  let bundle = Bundle::from_file(&output).unwrap().unwrap();
  assert_eq!(bundle.entry(), "main.js");
  assert_eq!(bundle.read_file("main.js").unwrap(), b"console.log('hi');");
  assert_eq!(bundle.read_file("assets/data.json").unwrap(), br#"{"k":1}"#);

  temp.close().unwrap();
}
