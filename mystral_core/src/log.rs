//! Logging utils.

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr.
///
/// The `MYSTRAL_LOG` environment variable controls the filter, defaults to
/// `error`. `MYSTRAL_DEBUG=1` forces verbose logs.
pub fn init() {
  let filter = if std::env::var("MYSTRAL_DEBUG").map(|v| v == "1").unwrap_or(false) {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_env("MYSTRAL_LOG").unwrap_or_else(|_| EnvFilter::new("error"))
  };

  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}
