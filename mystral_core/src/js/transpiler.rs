//! TypeScript transpiler.
//!
//! Turns `.ts`/`.tsx` module sources into plain JavaScript before they
//! reach the engine or the CommonJS wrapper. Compiled in behind the
//! `typescript` feature; without it, loading a TypeScript source fails
//! with a descriptive error. Parse diagnostics surface as
//! [`TheErr::ModuleLoad`] with their source position, so `require`/`import`
//! throw something a script author can act on.

use crate::prelude::*;

pub struct TypeScript;

#[cfg(feature = "typescript")]
impl TypeScript {
  /// Compiles TypeScript source text into plain JavaScript.
  pub fn compile(filename: Option<&str>, source: &str) -> AnyResult<String> {
    use swc_common::sync::Lrc;
    use swc_common::{FileName, Globals, Mark, SourceMap, GLOBALS};
    use swc_ecma_ast::EsVersion;
    use swc_ecma_codegen::text_writer::JsWriter;
    use swc_ecma_codegen::Emitter;
    use swc_ecma_parser::lexer::Lexer;
    use swc_ecma_parser::{Parser, StringInput, Syntax, TsSyntax};
    use swc_ecma_transforms_base::fixer::fixer;
    use swc_ecma_transforms_base::hygiene::hygiene;
    use swc_ecma_transforms_base::resolver;
    use swc_ecma_transforms_typescript::strip;

    let display_name = filename.unwrap_or("<anonymous>").to_string();

    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(
      match filename {
        Some(filename) => FileName::Custom(filename.into()),
        None => FileName::Anon,
      }
      .into(),
      source.into(),
    );

    // JSX parsing only for `.tsx`; in plain `.ts` the `<T>` cast syntax
    // stays valid.
    let tsx = display_name.ends_with(".tsx");

    let lexer = Lexer::new(
      Syntax::Typescript(TsSyntax {
        tsx,
        decorators: true,
        ..Default::default()
      }),
      EsVersion::EsNext,
      StringInput::from(&*fm),
      None,
    );

    let mut parser = Parser::new_from(lexer);

    let describe = |e: &swc_ecma_parser::error::Error| -> String {
      let loc = cm.lookup_char_pos(e.span().lo());
      format!("{} at {}:{}", e.kind().msg(), loc.line, loc.col_display + 1)
    };

    let program = match parser.parse_program() {
      Ok(program) => program,
      Err(e) => {
        anyhow::bail!(TheErr::ModuleLoad(display_name, describe(&e)));
      }
    };

    // The parser recovers from some errors to keep going; a module that
    // produced any diagnostic still must not load.
    if let Some(e) = parser.take_errors().first() {
      anyhow::bail!(TheErr::ModuleLoad(display_name, describe(e)));
    }

    let globals = Globals::default();
    let mut buffer = vec![];

    GLOBALS.set(&globals, || -> AnyResult<()> {
      let unresolved_mark = Mark::new();
      let top_level_mark = Mark::new();

      // Strip types with the same marks the resolver bound, then restore
      // hygiene and fix up the emitted tree.
      let program = program
        .apply(&mut resolver(unresolved_mark, top_level_mark, true))
        .apply(&mut strip(unresolved_mark, top_level_mark))
        .apply(&mut hygiene())
        .apply(&mut fixer(None));

      let mut emitter = Emitter {
        cfg: swc_ecma_codegen::Config::default().with_target(EsVersion::EsNext),
        cm: cm.clone(),
        comments: None,
        wr: JsWriter::new(cm.clone(), "\n", &mut buffer, None),
      };
      emitter
        .emit_program(&program)
        .map_err(|e| TheErr::ModuleLoad(display_name.clone(), e.to_string()))?;
      Ok(())
    })?;

    Ok(String::from_utf8_lossy(&buffer).to_string())
  }
}

#[cfg(not(feature = "typescript"))]
impl TypeScript {
  pub fn compile(filename: Option<&str>, _source: &str) -> AnyResult<String> {
    anyhow::bail!(TheErr::ModuleLoad(
      filename.unwrap_or("<anonymous>").to_string(),
      "TypeScript sources need the `typescript` feature; rebuild with it enabled".to_string(),
    ))
  }
}
