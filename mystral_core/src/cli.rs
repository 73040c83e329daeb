//! Command line options.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
  name = "mystral",
  version,
  about = "Mystral CLI — a JavaScript/TypeScript runtime for WebGPU games",
  after_help = "Run flags: --width --height --title --headless --no-sdl \
--screenshot --frames --quiet --watch --debug-port\n\
Compile flags: --include --output --root"
)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Run a script.
  Run(RunOptions),
  /// Compile a self-contained executable with an embedded file bundle.
  Compile(CompileOptions),
}

#[derive(Debug, Clone, Args)]
pub struct RunOptions {
  /// Script file to run. Defaults to the embedded bundle entry.
  pub script: Option<String>,

  /// Window (or offscreen target) width in pixels.
  #[arg(long, default_value_t = 800)]
  pub width: u32,

  /// Window (or offscreen target) height in pixels.
  #[arg(long, default_value_t = 600)]
  pub height: u32,

  /// Window title.
  #[arg(long, default_value = "Mystral")]
  pub title: String,

  /// Run without a visible window.
  #[arg(long)]
  pub headless: bool,

  /// Run without any window at all; render into an offscreen texture.
  #[arg(long = "no-sdl")]
  pub no_sdl: bool,

  /// Write a screenshot to FILE and exit once --frames have rendered.
  #[arg(long, value_name = "FILE")]
  pub screenshot: Option<PathBuf>,

  /// Stop after N frames (headless modes).
  #[arg(long, value_name = "N")]
  pub frames: Option<u64>,

  /// Silence console.log forwarding to stdout.
  #[arg(long)]
  pub quiet: bool,

  /// Reload the entry script when it changes on disk.
  #[arg(long)]
  pub watch: bool,

  /// Serve the debug channel on this port.
  #[arg(long, value_name = "P")]
  pub debug_port: Option<u16>,
}

impl Default for RunOptions {
  fn default() -> Self {
    RunOptions {
      script: None,
      width: 800,
      height: 600,
      title: "Mystral".to_string(),
      headless: false,
      no_sdl: false,
      screenshot: None,
      frames: None,
      quiet: false,
      watch: false,
      debug_port: None,
    }
  }
}

impl RunOptions {
  /// `--headless`, or the `MYSTRAL_HEADLESS=1` environment equivalent.
  pub fn effective_headless(&self) -> bool {
    self.headless
      || std::env::var("MYSTRAL_HEADLESS")
        .map(|v| v == "1")
        .unwrap_or(false)
  }

  /// Whether any window is involved at all.
  pub fn windowless(&self) -> bool {
    self.no_sdl || self.effective_headless()
  }
}

#[derive(Debug, Clone, Args)]
pub struct CompileOptions {
  /// Entry script for the compiled executable.
  pub entry: PathBuf,

  /// Extra directories to include in the bundle (recursively).
  #[arg(long, value_name = "DIR")]
  pub include: Vec<PathBuf>,

  /// Output executable path.
  #[arg(short, long, value_name = "FILE")]
  pub output: Option<PathBuf>,

  /// Directory bundle paths are recorded relative to. Defaults to the
  /// entry's directory.
  #[arg(long, value_name = "DIR")]
  pub root: Option<PathBuf>,
}

#[cfg(test)]
mod cli_tests;
