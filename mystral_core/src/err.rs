//! Errors and results.

/// [`anyhow::Error`]
pub type AnyErr = anyhow::Error;

/// [`anyhow::Result`] with `T` if ok, [`AnyErr`] if error.
pub type AnyResult<T> = anyhow::Result<T>;

/// [`std::io::Result`] with `T` if ok.
pub type IoResult<T> = std::io::Result<T>;

/// All error kinds surfaced by the runtime.
///
/// Script exceptions are not represented here, they stay inside the script
/// engine and are reported through [`crate::js::err::JsError`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TheErr {
  #[error("Module not found: {0:?}")]
  ModuleResolution(String),

  #[error("Failed to load module {0:?}: {1}")]
  ModuleLoad(String, String),

  #[error("I/O error: {0}")]
  Io(String),

  #[error("GPU error: {0}")]
  Gpu(String),

  #[error("Audio error: {0}")]
  Audio(String),

  #[error("Malformed bundle: {0}")]
  Bundle(String),

  #[error("{0}")]
  Cli(String),

  #[error("{0}")]
  Message(String),
}
