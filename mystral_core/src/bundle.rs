//! Embedded file bundle.
//!
//! A compiled executable may carry a trailing region with a directory of
//! files and an entry-script pointer, making the binary self-contained.
//! Layout, little-endian, appended after the program image:
//!
//! ```text
//! MAGIC (8 bytes)
//! VERSION (u32)
//! ENTRY_LEN (u32), ENTRY_BYTES (UTF-8)
//! COUNT (u32)
//! repeat COUNT times:
//!   PATH_LEN (u32), PATH_BYTES (UTF-8)
//!   OFFSET (u64), SIZE (u64)      -- offset from the blob base
//! [ concatenated file blobs ]
//! FOOTER_OFFSET (u64)             -- distance from MAGIC to this field
//! ```
//!
//! Detection reads the trailing `FOOTER_OFFSET`, seeks back to where MAGIC
//! must start and validates it. Anything malformed means "no bundle": the
//! runtime falls back to disk resolution.

use crate::prelude::*;
use crate::util::normalize_bundle_path;

use once_cell::sync::OnceCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

pub const BUNDLE_MAGIC: &[u8; 8] = b"MYSTRLB\x00";
pub const BUNDLE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleEntry {
  /// Offset from the blob base.
  pub offset: u64,
  pub size: u64,
}

/// A parsed bundle directory over some executable file. File contents stay
/// on disk and are read on demand.
#[derive(Debug)]
pub struct Bundle {
  image: std::path::PathBuf,
  /// Absolute file offset of the blob section.
  blob_base: u64,
  entry: String,
  directory: HashMap<String, BundleEntry>,
}

fn read_u32(data: &[u8], pos: &mut usize) -> AnyResult<u32> {
  let end = pos
    .checked_add(4)
    .filter(|end| *end <= data.len())
    .ok_or_else(|| TheErr::Bundle("truncated directory".into()))?;
  let value = u32::from_le_bytes(data[*pos..end].try_into().unwrap());
  *pos = end;
  Ok(value)
}

fn read_u64(data: &[u8], pos: &mut usize) -> AnyResult<u64> {
  let end = pos
    .checked_add(8)
    .filter(|end| *end <= data.len())
    .ok_or_else(|| TheErr::Bundle("truncated directory".into()))?;
  let value = u64::from_le_bytes(data[*pos..end].try_into().unwrap());
  *pos = end;
  Ok(value)
}

fn read_string(data: &[u8], pos: &mut usize) -> AnyResult<String> {
  let len = read_u32(data, pos)? as usize;
  let end = pos
    .checked_add(len)
    .filter(|end| *end <= data.len())
    .ok_or_else(|| TheErr::Bundle("truncated path".into()))?;
  let value = std::str::from_utf8(&data[*pos..end])
    .map_err(|_| TheErr::Bundle("non-utf8 path".into()))?
    .to_string();
  *pos = end;
  Ok(value)
}

impl Bundle {
  /// Scans `image` for a trailing bundle. `Ok(None)` when the file has no
  /// (valid) bundle; hard I/O errors only for unreadable files.
  pub fn from_file(image: &Path) -> AnyResult<Option<Bundle>> {
    let mut file = File::open(image)?;
    let file_len = file.seek(SeekFrom::End(0))?;

    match Self::parse(&mut file, file_len) {
      Ok(Some((blob_base, entry, directory))) => Ok(Some(Bundle {
        image: image.to_path_buf(),
        blob_base,
        entry,
        directory,
      })),
      Ok(None) => Ok(None),
      Err(e) => {
        // Malformed trailer: the bundle is ignored, not fatal.
        warn!("Ignoring malformed bundle in {:?}: {}", image, e);
        Ok(None)
      }
    }
  }

  #[allow(clippy::type_complexity)]
  fn parse(
    file: &mut File,
    file_len: u64,
  ) -> AnyResult<Option<(u64, String, HashMap<String, BundleEntry>)>> {
    let footer_len = 8u64;
    let magic_len = BUNDLE_MAGIC.len() as u64;
    if file_len < footer_len + magic_len {
      return Ok(None);
    }

    // Reverse scan: the trailing u64 is the distance from MAGIC to itself.
    file.seek(SeekFrom::End(-(footer_len as i64)))?;
    let mut footer = [0u8; 8];
    file.read_exact(&mut footer)?;
    let footer_offset = u64::from_le_bytes(footer);

    let footer_pos = file_len - footer_len;
    let magic_pos = match footer_pos.checked_sub(footer_offset) {
      Some(pos) => pos,
      None => return Ok(None),
    };

    file.seek(SeekFrom::Start(magic_pos))?;
    let mut magic = [0u8; 8];
    if file.read_exact(&mut magic).is_err() || &magic != BUNDLE_MAGIC {
      return Ok(None);
    }

    // Header + directory live between MAGIC and the blob base; read the
    // whole region (it is small) and parse from memory.
    let region_len = (footer_pos - magic_pos - magic_len) as usize;
    let mut region = vec![0u8; region_len];
    file.read_exact(&mut region)?;

    let mut pos = 0usize;
    let version = read_u32(&region, &mut pos)?;
    if version != BUNDLE_VERSION {
      anyhow::bail!(TheErr::Bundle(format!("unsupported version {version}")));
    }

    let entry = read_string(&region, &mut pos)?;
    let count = read_u32(&region, &mut pos)?;

    let mut directory = HashMap::new();
    for _ in 0..count {
      let path = read_string(&region, &mut pos)?;
      let offset = read_u64(&region, &mut pos)?;
      let size = read_u64(&region, &mut pos)?;
      directory.insert(normalize_bundle_path(&path), BundleEntry { offset, size });
    }

    let blob_base = magic_pos + magic_len + pos as u64;

    // Sanity: every entry must fit inside the blob section.
    let blob_len = footer_pos.saturating_sub(blob_base);
    for (path, entry) in directory.iter() {
      if entry.offset.saturating_add(entry.size) > blob_len {
        anyhow::bail!(TheErr::Bundle(format!("entry {path:?} out of range")));
      }
    }

    Ok(Some((blob_base, entry, directory)))
  }

  /// The recorded entry script path (normalized).
  pub fn entry(&self) -> &str {
    &self.entry
  }

  pub fn contains(&self, path: &str) -> bool {
    self.directory.contains_key(&normalize_bundle_path(path))
  }

  pub fn get(&self, path: &str) -> Option<BundleEntry> {
    self.directory.get(&normalize_bundle_path(path)).copied()
  }

  pub fn paths(&self) -> impl Iterator<Item = &String> {
    self.directory.keys()
  }

  /// Reads one embedded file.
  pub fn read_file(&self, path: &str) -> AnyResult<Vec<u8>> {
    let entry = self
      .get(path)
      .ok_or_else(|| TheErr::Bundle(format!("no such entry {path:?}")))?;
    let mut file = File::open(&self.image)?;
    file.seek(SeekFrom::Start(self.blob_base + entry.offset))?;
    let mut data = vec![0u8; entry.size as usize];
    file.read_exact(&mut data)?;
    Ok(data)
  }
}

/// Collects files and appends the bundle region onto an executable image.
pub struct BundleWriter {
  entry: String,
  files: Vec<(String, Vec<u8>)>,
}

impl BundleWriter {
  pub fn new(entry: &str) -> Self {
    BundleWriter {
      entry: normalize_bundle_path(entry),
      files: Vec::new(),
    }
  }

  pub fn add_file(&mut self, path: &str, data: Vec<u8>) {
    self.files.push((normalize_bundle_path(path), data));
  }

  /// Serializes the appended region (everything after the program bytes).
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(BUNDLE_MAGIC);
    out.extend_from_slice(&BUNDLE_VERSION.to_le_bytes());
    out.extend_from_slice(&(self.entry.len() as u32).to_le_bytes());
    out.extend_from_slice(self.entry.as_bytes());
    out.extend_from_slice(&(self.files.len() as u32).to_le_bytes());

    let mut offset = 0u64;
    for (path, data) in self.files.iter() {
      out.extend_from_slice(&(path.len() as u32).to_le_bytes());
      out.extend_from_slice(path.as_bytes());
      out.extend_from_slice(&offset.to_le_bytes());
      out.extend_from_slice(&(data.len() as u64).to_le_bytes());
      offset += data.len() as u64;
    }
    for (_, data) in self.files.iter() {
      out.extend_from_slice(data);
    }

    // Distance from MAGIC to the footer field.
    let footer_offset = out.len() as u64;
    out.extend_from_slice(&footer_offset.to_le_bytes());
    out
  }

  /// Appends the bundle onto `image` in place.
  pub fn append_to(&self, image: &Path) -> AnyResult<()> {
    let mut file = std::fs::OpenOptions::new().append(true).open(image)?;
    file.write_all(&self.encode())?;
    file.flush()?;
    Ok(())
  }
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> AnyResult<()> {
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if path.is_dir() {
      collect_files(&path, out)?;
    } else if path.is_file() {
      out.push(path);
    }
  }
  Ok(())
}

/// `compile`: copy the running executable and append an embedded bundle
/// holding the entry script plus every file under the include directories.
/// Returns the output path.
pub fn compile_executable(opts: &crate::cli::CompileOptions) -> AnyResult<std::path::PathBuf> {
  use crate::util::absolute;

  let entry = absolute(&opts.entry);
  if !entry.is_file() {
    anyhow::bail!(TheErr::Cli(format!("entry script not found: {:?}", opts.entry)));
  }

  let root = match &opts.root {
    Some(root) => absolute(root),
    None => entry.parent().unwrap_or(Path::new(".")).to_path_buf(),
  };

  let relative_key = |path: &Path| -> AnyResult<String> {
    let rel = path.strip_prefix(&root).map_err(|_| {
      TheErr::Cli(format!(
        "{path:?} is outside the bundle root {root:?}; pass --root"
      ))
    })?;
    Ok(normalize_bundle_path(&rel.to_string_lossy()))
  };

  let mut writer = BundleWriter::new(&relative_key(&entry)?);
  writer.add_file(&relative_key(&entry)?, std::fs::read(&entry)?);

  for include in opts.include.iter() {
    let include = absolute(include);
    if !include.is_dir() {
      anyhow::bail!(TheErr::Cli(format!("include is not a directory: {include:?}")));
    }
    let mut files = Vec::new();
    collect_files(&include, &mut files)?;
    files.sort();
    for file in files {
      writer.add_file(&relative_key(&file)?, std::fs::read(&file)?);
    }
  }

  let output = match &opts.output {
    Some(output) => output.clone(),
    None => {
      let stem = entry
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "app".to_string());
      std::path::PathBuf::from(stem)
    }
  };

  let exe = std::env::current_exe()?;
  std::fs::copy(&exe, &output)?;
  writer.append_to(&output)?;

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(&output)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&output, permissions)?;
  }

  Ok(output)
}

/// The bundle embedded in the currently running executable, scanned once.
pub fn current() -> Option<Arc<Bundle>> {
  static CURRENT: OnceCell<Option<Arc<Bundle>>> = OnceCell::new();
  CURRENT
    .get_or_init(|| {
      let exe = std::env::current_exe().ok()?;
      match Bundle::from_file(&exe) {
        Ok(Some(bundle)) => Some(Arc::new(bundle)),
        _ => None,
      }
    })
    .clone()
}
