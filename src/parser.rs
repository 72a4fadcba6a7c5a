//! Recursive-descent parser producing a function body and expression AST.
//!
//! The parser mirrors the classic chibicc structure: we maintain a
//! precedence-climbing set of helpers and expose a thin statement layer so
//! sequencing and control flow live outside the expression tree. Variables
//! need no declaration; the first mention of a name appends a slot to the
//! function's locals table and later mentions resolve to the same slot.

use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind, describe_token, token_text};

/// Binary operators recognised by the language. `>` and `>=` never appear:
/// relational parsing swaps the operands into `Lt`/`Le` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// Expression tree produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
  Num {
    value: i64,
  },
  /// Reference to a slot in the enclosing function's locals table.
  Var {
    local: usize,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
  },
  Assign {
    lhs: Box<AstNode>,
    rhs: Box<AstNode>,
  },
  FunCall {
    name: String,
    args: Vec<AstNode>,
  },
}

impl AstNode {
  pub fn number(value: i64) -> Self {
    Self::Num { value }
  }

  pub fn var(local: usize) -> Self {
    Self::Var { local }
  }

  pub fn binary(op: BinaryOp, lhs: AstNode, rhs: AstNode) -> Self {
    Self::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn assign(lhs: AstNode, rhs: AstNode) -> Self {
    Self::Assign {
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn call(name: String, args: Vec<AstNode>) -> Self {
    Self::FunCall { name, args }
  }
}

/// Statement layer. Control-flow children own their subtrees exclusively;
/// a block owns its children in source order.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
  ExprStmt {
    expr: AstNode,
  },
  Return {
    expr: AstNode,
  },
  If {
    cond: AstNode,
    then: Box<Stmt>,
    els: Option<Box<Stmt>>,
  },
  While {
    cond: AstNode,
    body: Box<Stmt>,
  },
  /// Any of `init`/`cond`/`inc` may be absent; an absent condition loops
  /// forever unless the body returns.
  For {
    init: Option<AstNode>,
    cond: Option<AstNode>,
    inc: Option<AstNode>,
    body: Box<Stmt>,
  },
  Block {
    body: Vec<Stmt>,
  },
}

/// A named 8-byte slot in the function frame. `offset` is zero until the
/// post-parse fixup assigns it, exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
  pub name: String,
  pub offset: i64,
}

/// The parsed compilation unit: top-level statements, the locals they bind,
/// and the frame size computed by the offset fixup.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
  pub body: Vec<Stmt>,
  pub locals: Vec<LocalVar>,
  pub stack_size: i64,
}

/// The calling convention passes at most this many arguments in registers.
pub const MAX_CALL_ARGS: usize = 6;

/// Parse the whole program: a statement sequence terminated by end of input.
/// Frame offsets are resolved before the function is returned, so code
/// generation never sees an unassigned local.
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Function> {
  let mut stream = TokenStream::new(tokens, source);

  if stream.is_eof() {
    return Err(CompileError::at(source, 0, "program is empty"));
  }

  let mut body = Vec::new();
  while !stream.is_eof() {
    body.push(parse_stmt(&mut stream)?);
  }

  let mut function = Function {
    body,
    locals: stream.locals,
    stack_size: 0,
  };
  assign_offsets(&mut function);
  Ok(function)
}

/// Resolve every local to its frame offset and total the frame size.
/// First-declared gets the smallest offset; each slot is 8 bytes.
fn assign_offsets(function: &mut Function) {
  let mut offset = 0;
  for local in &mut function.locals {
    offset += 8;
    local.offset = offset;
  }
  function.stack_size = offset;
}

fn parse_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  if stream.equal("return") {
    let expr = parse_expr(stream)?;
    stream.skip(";")?;
    return Ok(Stmt::Return { expr });
  }

  if stream.equal("if") {
    stream.skip("(")?;
    let cond = parse_expr(stream)?;
    stream.skip(")")?;
    let then = Box::new(parse_stmt(stream)?);
    // Eager consumption binds a dangling `else` to the nearest open `if`.
    let els = if stream.equal("else") {
      Some(Box::new(parse_stmt(stream)?))
    } else {
      None
    };
    return Ok(Stmt::If { cond, then, els });
  }

  if stream.equal("while") {
    stream.skip("(")?;
    let cond = parse_expr(stream)?;
    stream.skip(")")?;
    let body = Box::new(parse_stmt(stream)?);
    return Ok(Stmt::While { cond, body });
  }

  if stream.equal("for") {
    stream.skip("(")?;
    let init = if stream.equal(";") {
      None
    } else {
      let expr = parse_expr(stream)?;
      stream.skip(";")?;
      Some(expr)
    };
    let cond = if stream.equal(";") {
      None
    } else {
      let expr = parse_expr(stream)?;
      stream.skip(";")?;
      Some(expr)
    };
    let inc = if stream.equal(")") {
      None
    } else {
      let expr = parse_expr(stream)?;
      stream.skip(")")?;
      Some(expr)
    };
    let body = Box::new(parse_stmt(stream)?);
    return Ok(Stmt::For {
      init,
      cond,
      inc,
      body,
    });
  }

  if stream.equal("{") {
    let mut body = Vec::new();
    while !stream.equal("}") {
      if stream.is_eof() {
        return Err(CompileError::at(
          stream.source,
          stream.source.len(),
          "expected \"}\" before end of input",
        ));
      }
      body.push(parse_stmt(stream)?);
    }
    return Ok(Stmt::Block { body });
  }

  // A lone semicolon is the null statement.
  if stream.equal(";") {
    return Ok(Stmt::Block { body: Vec::new() });
  }

  let expr = parse_expr(stream)?;
  stream.skip(";")?;
  Ok(Stmt::ExprStmt { expr })
}

fn parse_expr(stream: &mut TokenStream) -> CompileResult<AstNode> {
  parse_assign(stream)
}

fn parse_assign(stream: &mut TokenStream) -> CompileResult<AstNode> {
  let node = parse_equality(stream)?;

  if stream.equal("=") {
    let rhs = parse_assign(stream)?;
    return Ok(AstNode::assign(node, rhs));
  }

  Ok(node)
}

fn parse_equality(stream: &mut TokenStream) -> CompileResult<AstNode> {
  let mut node = parse_relational(stream)?;

  loop {
    let op_str = match stream
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, stream.source))
    {
      Some(symbol @ "==") => symbol,
      Some(symbol @ "!=") => symbol,
      _ => break,
    };

    let op = match op_str {
      "==" => BinaryOp::Eq,
      "!=" => BinaryOp::Ne,
      _ => unreachable!(),
    };

    stream.skip(op_str)?;
    let rhs = parse_relational(stream)?;
    node = AstNode::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_relational(stream: &mut TokenStream) -> CompileResult<AstNode> {
  let mut node = parse_add(stream)?;

  loop {
    let op_str = match stream
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, stream.source))
    {
      Some(symbol @ "<") => symbol,
      Some(symbol @ "<=") => symbol,
      Some(symbol @ ">") => symbol,
      Some(symbol @ ">=") => symbol,
      _ => break,
    };

    stream.skip(op_str)?;
    let rhs = parse_add(stream)?;
    // ">" and ">=" are "<" and "<=" with the operands swapped; the tree
    // never carries a greater-than operator.
    node = match op_str {
      "<" => AstNode::binary(BinaryOp::Lt, node, rhs),
      "<=" => AstNode::binary(BinaryOp::Le, node, rhs),
      ">" => AstNode::binary(BinaryOp::Lt, rhs, node),
      ">=" => AstNode::binary(BinaryOp::Le, rhs, node),
      _ => unreachable!(),
    };
  }

  Ok(node)
}

fn parse_add(stream: &mut TokenStream) -> CompileResult<AstNode> {
  let mut node = parse_mul(stream)?;

  loop {
    let op_str = match stream
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, stream.source))
    {
      Some(symbol @ "+") => symbol,
      Some(symbol @ "-") => symbol,
      _ => break,
    };

    let op = match op_str {
      "+" => BinaryOp::Add,
      "-" => BinaryOp::Sub,
      _ => unreachable!(),
    };

    stream.skip(op_str)?;
    let rhs = parse_mul(stream)?;
    node = AstNode::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_mul(stream: &mut TokenStream) -> CompileResult<AstNode> {
  let mut node = parse_unary(stream)?;

  loop {
    let op_str = match stream
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, stream.source))
    {
      Some(symbol @ "*") => symbol,
      Some(symbol @ "/") => symbol,
      _ => break,
    };

    let op = match op_str {
      "*" => BinaryOp::Mul,
      "/" => BinaryOp::Div,
      _ => unreachable!(),
    };

    stream.skip(op_str)?;
    let rhs = parse_unary(stream)?;
    node = AstNode::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_unary(stream: &mut TokenStream) -> CompileResult<AstNode> {
  if stream.equal("+") {
    return parse_unary(stream);
  }

  if stream.equal("-") {
    // Unary minus is sugar for `0 - operand`; no dedicated node exists.
    let operand = parse_unary(stream)?;
    return Ok(AstNode::binary(
      BinaryOp::Sub,
      AstNode::number(0),
      operand,
    ));
  }

  parse_primary(stream)
}

fn parse_primary(stream: &mut TokenStream) -> CompileResult<AstNode> {
  if stream.equal("(") {
    let node = parse_expr(stream)?;
    stream.skip(")")?;
    return Ok(node);
  }

  if matches!(
    stream.peek().map(|token| token.kind),
    Some(TokenKind::Ident)
  ) {
    let (name, loc) = stream.get_ident()?;
    if stream.equal("(") {
      return parse_call_args(stream, name, loc);
    }
    let local = stream.find_or_create_local(&name);
    return Ok(AstNode::var(local));
  }

  let (value, _) = stream.get_number()?;
  Ok(AstNode::number(value))
}

/// Parse a call's argument list; the identifier and the opening paren have
/// already been consumed.
fn parse_call_args(
  stream: &mut TokenStream,
  name: String,
  loc: usize,
) -> CompileResult<AstNode> {
  let mut args = Vec::new();

  if !stream.equal(")") {
    loop {
      args.push(parse_expr(stream)?);
      if !stream.equal(",") {
        break;
      }
    }
    stream.skip(")")?;
  }

  if args.len() > MAX_CALL_ARGS {
    return Err(CompileError::at(
      stream.source,
      loc,
      format!("too many arguments to \"{name}\" (at most {MAX_CALL_ARGS} are supported)"),
    ));
  }

  Ok(AstNode::call(name, args))
}

/// Parser state: a forward-only cursor over the token vector plus the
/// locals table that grows as identifiers are first mentioned. Both exist
/// only while `parse` runs.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
  locals: Vec<LocalVar>,
}

impl<'a> TokenStream<'a> {
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
      locals: Vec::new(),
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  /// Consume the current token if it matches the provided reserved symbol.
  fn equal(&mut self, op: &str) -> bool {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Punctuator
      && token.len == op.len()
      && token_text(token, self.source) == op
    {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      let (loc, got) = match self.tokens.get(self.pos) {
        Some(token) => (token.loc, describe_token(Some(token), self.source)),
        None => (self.source.len(), "EOF".to_string()),
      };
      Err(CompileError::at(
        self.source,
        loc,
        format!("expected \"{s}\", but got \"{got}\""),
      ))
    }
  }

  /// Parse the current token as an integer literal returning its value and location.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.tokens.get(self.pos)
      && token.kind == TokenKind::Num
    {
      let value = token.value.ok_or_else(|| {
        CompileError::at(
          self.source,
          token.loc,
          "internal error: numeric token missing value",
        )
      })?;
      let loc = token.loc;
      self.pos += 1;
      return Ok((value, loc));
    }

    let (loc, got) = match self.tokens.get(self.pos) {
      Some(token) => (token.loc, describe_token(Some(token), self.source)),
      None => (self.source.len(), "EOF".to_string()),
    };
    Err(CompileError::at(
      self.source,
      loc,
      format!("expected a number, but got \"{got}\""),
    ))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<(String, usize)> {
    if let Some(token) = self.tokens.get(self.pos)
      && token.kind == TokenKind::Ident
    {
      let name = token_text(token, self.source).to_string();
      let loc = token.loc;
      self.pos += 1;
      return Ok((name, loc));
    }

    let (loc, got) = match self.tokens.get(self.pos) {
      Some(token) => (token.loc, describe_token(Some(token), self.source)),
      None => (self.source.len(), "EOF".to_string()),
    };
    Err(CompileError::at(
      self.source,
      loc,
      format!("expected an identifier, but got \"{got}\""),
    ))
  }

  /// Resolve a name to its slot index, appending a fresh slot on first
  /// mention. Lookup is first-declared-wins over the whole function.
  fn find_or_create_local(&mut self, name: &str) -> usize {
    if let Some(index) = self.locals.iter().position(|local| local.name == name) {
      return index;
    }
    self.locals.push(LocalVar {
      name: name.to_string(),
      offset: 0,
    });
    self.locals.len() - 1
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek().map(|token| token.kind), Some(TokenKind::Eof))
  }
}
