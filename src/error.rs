//! Shared error utilities used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose – these routines format
//! messages in a style reminiscent of chibicc, pointing at the offending
//! byte with a caret.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  #[snafu(display("{source_line}\n{marker} {message}"))]
  WithLocation {
    source_line: String,
    marker: String,
    message: String,
  },
}

impl CompileError {
  /// Construct an error anchored at a specific byte offset in the source.
  /// The rendered form repeats the source line and places a caret under the
  /// offending byte, one leading space per byte of offset.
  pub fn at(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let safe_loc = loc.min(source.len());
    let marker = format!("{}^", " ".repeat(safe_loc));
    Self::WithLocation {
      source_line: source.to_string(),
      marker,
      message: message.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn caret_lands_on_the_offending_byte() {
    let err = CompileError::at("a = $;", 4, "invalid token: '$'");
    assert_eq!(err.to_string(), "a = $;\n    ^ invalid token: '$'");
  }

  #[test]
  fn offset_past_the_end_is_clamped() {
    let err = CompileError::at("ab", 99, "unexpected end of input");
    assert_eq!(err.to_string(), "ab\n  ^ unexpected end of input");
  }
}
