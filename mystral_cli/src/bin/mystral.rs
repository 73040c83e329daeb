//! The `mystral` binary.

use clap::Parser;
use mystral_core::cli::{Cli, Command, CompileOptions, RunOptions};
use mystral_core::evloop::EventLoop;

fn main() {
  mystral_core::log::init();

  let cli = match Cli::try_parse() {
    Ok(cli) => cli,
    Err(e) => {
      // --help/--version print to stdout and exit 0; argument errors are
      // CLI errors and exit 1.
      let code = if e.use_stderr() { 1 } else { 0 };
      let _ = e.print();
      std::process::exit(code);
    }
  };
  let code = match cli.command {
    Some(Command::Run(opts)) => run(opts),
    Some(Command::Compile(opts)) => compile(opts),
    // A compiled bundle executable runs itself when invoked bare.
    None => match mystral_core::bundle::current() {
      Some(_) => run(RunOptions::default()),
      None => {
        eprintln!("No command specified; see `mystral --help`");
        1
      }
    },
  };
  std::process::exit(code);
}

fn run(opts: RunOptions) -> i32 {
  let entry = opts.script.clone().or_else(|| {
    mystral_core::bundle::current().map(|bundle| format!("asset://{}", bundle.entry()))
  });
  let Some(entry) = entry else {
    eprintln!("No script file specified");
    return 1;
  };

  let mut evloop = match EventLoop::new(opts) {
    Ok(evloop) => evloop,
    Err(e) => {
      eprintln!("{e}");
      return 1;
    }
  };

  if let Err(e) = evloop.initialize(&entry) {
    eprintln!("{e}");
    return 1;
  }

  evloop.run()
}

fn compile(opts: CompileOptions) -> i32 {
  match mystral_core::bundle::compile_executable(&opts) {
    Ok(output) => {
      println!("Compiled {:?} -> {:?}", opts.entry, output);
      0
    }
    Err(e) => {
      eprintln!("{e}");
      1
    }
  }
}
