//! Crate root: wires together the compilation pipeline.
//!
//! The stages are intentionally small and composable so they can be evolved
//! independently:
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and returns a function AST with locals.
//! - `codegen` lowers the parsed function into Intel-syntax x86-64 assembly.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod error;
pub mod parser;
pub mod tokenizer;

mod codegen;

pub use error::{CompileError, CompileResult};

/// Compile a source string into x86-64 assembly.
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  log::debug!("tokenizing {} bytes of source", source.len());
  let tokens = tokenizer::tokenize(source)?;

  log::debug!("parsing {} tokens", tokens.len());
  let program = parser::parse(tokens, source)?;

  log::debug!(
    "generating code: {} locals, {}-byte frame",
    program.locals.len(),
    program.stack_size
  );
  Ok(codegen::generate(&program))
}
