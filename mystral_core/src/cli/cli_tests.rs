use crate::cli::*;

use clap::CommandFactory;
use clap::Parser;

#[test]
fn parse_run_flags() {
  let cli = Cli::try_parse_from([
    "mystral",
    "run",
    "game.js",
    "--width",
    "1024",
    "--height",
    "768",
    "--title",
    "Demo",
    "--headless",
    "--screenshot",
    "out.png",
    "--frames",
    "10",
    "--quiet",
  ])
  .unwrap();

  let Some(Command::Run(opts)) = cli.command else {
    panic!("expected run command");
  };
  assert_eq!(opts.script.as_deref(), Some("game.js"));
  assert_eq!(opts.width, 1024);
  assert_eq!(opts.height, 768);
  assert_eq!(opts.title, "Demo");
  assert!(opts.headless);
  assert!(!opts.no_sdl);
  assert_eq!(opts.screenshot.as_deref(), Some(std::path::Path::new("out.png")));
  assert_eq!(opts.frames, Some(10));
  assert!(opts.quiet);
}

#[test]
fn run_script_is_optional() {
  let cli = Cli::try_parse_from(["mystral", "run"]).unwrap();
  let Some(Command::Run(opts)) = cli.command else {
    panic!("expected run command");
  };
  assert!(opts.script.is_none());
  assert_eq!(opts.width, 800);
  assert_eq!(opts.height, 600);
}

#[test]
fn parse_compile_flags() {
  let cli = Cli::try_parse_from([
    "mystral", "compile", "main.js", "--include", "assets", "-o", "app", "--root", ".",
  ])
  .unwrap();

  let Some(Command::Compile(opts)) = cli.command else {
    panic!("expected compile command");
  };
  assert_eq!(opts.entry, std::path::PathBuf::from("main.js"));
  assert_eq!(opts.include, vec![std::path::PathBuf::from("assets")]);
  assert_eq!(opts.output.as_deref(), Some(std::path::Path::new("app")));
}

#[test]
fn help_mentions_the_stable_flags() {
  let mut command = Cli::command();
  let help = command.render_long_help().to_string();
  assert!(help.contains("Mystral CLI"));
  for token in [
    "--width",
    "--height",
    "--title",
    "--headless",
    "--screenshot",
    "--frames",
    "--quiet",
  ] {
    assert!(help.contains(token), "help should mention {token}");
  }
}

#[test]
fn unknown_flags_are_rejected() {
  assert!(Cli::try_parse_from(["mystral", "run", "--nope"]).is_err());
}
