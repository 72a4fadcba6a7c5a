//! Code generation: lower the parsed AST into Intel-syntax x86-64 assembly.
//!
//! The emitter uses a simple stack machine: every expression leaves exactly
//! one value on the runtime stack, and every statement consumes what it
//! pushed before it ends. Locals live on the stack frame and are addressed
//! relative to `rbp`. Control flow is label-based; one counter numbers every
//! label pair so no two constructs ever collide.

use crate::parser::{AstNode, BinaryOp, Function, Stmt};

/// Registers that carry call arguments, in parameter order.
const ARG_REGS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// Emit the assembly program for a parsed function.
pub fn generate(func: &Function) -> String {
  let mut generator = CodeGen::new();
  generator.emit_program(func);
  generator.asm
}

/// Owns the output buffer and the label counter. The counter only ever
/// increases while the generator lives.
struct CodeGen {
  asm: String,
  labels: u32,
}

impl CodeGen {
  fn new() -> Self {
    Self {
      asm: String::new(),
      labels: 0,
    }
  }

  fn next_label(&mut self) -> u32 {
    let n = self.labels;
    self.labels += 1;
    n
  }

  fn line(&mut self, instruction: &str) {
    self.asm.push_str("    ");
    self.asm.push_str(instruction);
    self.asm.push('\n');
  }

  fn label(&mut self, name: &str) {
    self.asm.push_str(name);
    self.asm.push_str(":\n");
  }

  fn emit_program(&mut self, func: &Function) {
    self.asm.push_str(".intel_syntax noprefix\n");
    self.asm.push_str(".global main\n");
    self.label("main");
    self.line("push rbp");
    self.line("mov rbp, rsp");
    if func.stack_size > 0 {
      self.line(&format!("sub rsp, {}", func.stack_size));
    }

    for stmt in &func.body {
      self.emit_stmt(stmt, func);
    }

    // Every `return` jumps here; the last statement's residual value is
    // already in rax when control falls through instead.
    self.label(".L.return");
    self.line("mov rsp, rbp");
    self.line("pop rbp");
    self.line("ret");
  }

  fn emit_stmt(&mut self, stmt: &Stmt, func: &Function) {
    match stmt {
      Stmt::ExprStmt { expr } => {
        self.emit_expr(expr, func);
        self.line("pop rax");
      }
      Stmt::Return { expr } => {
        self.emit_expr(expr, func);
        self.line("pop rax");
        self.line("jmp .L.return");
      }
      Stmt::If { cond, then, els } => {
        let n = self.next_label();
        self.emit_expr(cond, func);
        self.line("pop rax");
        self.line("cmp rax, 0");
        match els {
          None => {
            self.line(&format!("je .L.endif.{n}"));
            self.emit_stmt(then, func);
          }
          Some(els) => {
            self.line(&format!("je .L.else.{n}"));
            self.emit_stmt(then, func);
            self.line(&format!("jmp .L.endif.{n}"));
            self.label(&format!(".L.else.{n}"));
            self.emit_stmt(els, func);
          }
        }
        self.label(&format!(".L.endif.{n}"));
      }
      Stmt::While { cond, body } => {
        let n = self.next_label();
        self.label(&format!(".L.while.{n}"));
        self.emit_expr(cond, func);
        self.line("pop rax");
        self.line("cmp rax, 0");
        self.line(&format!("je .L.endwhile.{n}"));
        self.emit_stmt(body, func);
        self.line(&format!("jmp .L.while.{n}"));
        self.label(&format!(".L.endwhile.{n}"));
      }
      Stmt::For {
        init,
        cond,
        inc,
        body,
      } => {
        let n = self.next_label();
        if let Some(init) = init {
          self.emit_expr(init, func);
          self.line("pop rax");
        }
        self.label(&format!(".L.for.{n}"));
        // An absent condition leaves the loop unguarded.
        if let Some(cond) = cond {
          self.emit_expr(cond, func);
          self.line("pop rax");
          self.line("cmp rax, 0");
          self.line(&format!("je .L.endfor.{n}"));
        }
        self.emit_stmt(body, func);
        if let Some(inc) = inc {
          self.emit_expr(inc, func);
          self.line("pop rax");
        }
        self.line(&format!("jmp .L.for.{n}"));
        self.label(&format!(".L.endfor.{n}"));
      }
      Stmt::Block { body } => {
        for stmt in body {
          self.emit_stmt(stmt, func);
        }
      }
    }
  }

  /// Emit stack-based code for a single expression node.
  fn emit_expr(&mut self, node: &AstNode, func: &Function) {
    match node {
      AstNode::Num { value } => {
        self.line(&format!("push {value}"));
      }
      AstNode::Var { .. } => {
        self.emit_addr(node, func);
        self.line("pop rax");
        self.line("mov rax, [rax]");
        self.line("push rax");
      }
      AstNode::Assign { lhs, rhs } => {
        self.emit_addr(lhs, func);
        self.emit_expr(rhs, func);
        self.line("pop rdi");
        self.line("pop rax");
        self.line("mov [rax], rdi");
        // Assignment is itself an expression; the stored value stays
        // available on the stack.
        self.line("push rdi");
      }
      AstNode::FunCall { name, args } => {
        for arg in args {
          self.emit_expr(arg, func);
        }
        // The pushes above left the arguments right-to-left on the stack;
        // popping in reverse register order restores declared order.
        for reg in ARG_REGS[..args.len()].iter().rev() {
          self.line(&format!("pop {reg}"));
        }

        // The ABI wants rsp on a 16-byte boundary at the call instruction,
        // but the pushes so far make the offset unknowable here. Test the
        // low bits at runtime and pad with one slot when misaligned.
        let n = self.next_label();
        self.line("mov rax, rsp");
        self.line("and rax, 15");
        self.line(&format!("jnz .L.call.{n}"));
        self.line("mov rax, 0");
        self.line(&format!("call {name}"));
        self.line(&format!("jmp .L.endcall.{n}"));
        self.label(&format!(".L.call.{n}"));
        self.line("sub rsp, 8");
        self.line("mov rax, 0");
        self.line(&format!("call {name}"));
        self.line("add rsp, 8");
        self.label(&format!(".L.endcall.{n}"));
        self.line("push rax");
      }
      AstNode::Binary { op, lhs, rhs } => {
        self.emit_expr(lhs, func);
        self.emit_expr(rhs, func);
        self.line("pop rdi");
        self.line("pop rax");
        match op {
          BinaryOp::Add => self.line("add rax, rdi"),
          BinaryOp::Sub => self.line("sub rax, rdi"),
          BinaryOp::Mul => self.line("imul rax, rdi"),
          BinaryOp::Div => {
            self.line("cqo");
            self.line("idiv rdi");
          }
          BinaryOp::Eq => self.compare("sete"),
          BinaryOp::Ne => self.compare("setne"),
          BinaryOp::Lt => self.compare("setl"),
          BinaryOp::Le => self.compare("setle"),
        }
        self.line("push rax");
      }
    }
  }

  /// Comparisons share the cmp/setcc/widen sequence; only the setcc varies.
  fn compare(&mut self, set: &str) {
    self.line("cmp rax, rdi");
    self.line(&format!("{set} al"));
    self.line("movzb rax, al");
  }

  /// Push the frame address of an lvalue. Reaching anything but a variable
  /// here means the parser let a malformed assignment through, which is
  /// unrecoverable.
  fn emit_addr(&mut self, node: &AstNode, func: &Function) {
    match node {
      AstNode::Var { local } => {
        let offset = func.locals[*local].offset;
        self.line(&format!("lea rax, [rbp-{offset}]"));
        self.line("push rax");
      }
      _ => panic!("not an lvalue"),
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use test_case::test_case;

  use super::*;
  use crate::parser::parse;
  use crate::tokenizer::tokenize;

  fn compile(source: &str) -> String {
    let tokens = tokenize(source).expect("source should lex");
    let function = parse(tokens, source).expect("source should parse");
    generate(&function)
  }

  /// Label definitions (lines ending in a colon) in emission order.
  fn label_defs(asm: &str) -> Vec<&str> {
    asm
      .lines()
      .filter(|line| line.ends_with(':'))
      .collect()
  }

  #[test]
  fn arithmetic_program_matches_expected_text() {
    let expected = "\
.intel_syntax noprefix
.global main
main:
    push rbp
    mov rbp, rsp
    push 1
    push 2
    push 3
    pop rdi
    pop rax
    imul rax, rdi
    push rax
    pop rdi
    pop rax
    add rax, rdi
    push rax
    push 4
    push 1
    pop rdi
    pop rax
    sub rax, rdi
    push rax
    pop rdi
    pop rax
    sub rax, rdi
    push rax
    pop rax
.L.return:
    mov rsp, rbp
    pop rbp
    ret
";
    assert_eq!(compile("1+2*3-(4-1);"), expected);
  }

  #[test]
  fn locals_get_distinct_frame_slots() {
    let asm = compile("a = 3; b = 5; return a + b;");
    assert!(asm.contains("sub rsp, 16"), "{asm}");
    assert!(asm.contains("lea rax, [rbp-8]"), "{asm}");
    assert!(asm.contains("lea rax, [rbp-16]"), "{asm}");
    assert!(asm.contains("mov rax, [rax]"), "{asm}");
  }

  #[test]
  fn same_name_reuses_the_same_slot() {
    let asm = compile("x = 1; x = x + 1;");
    assert!(!asm.contains("[rbp-16]"), "{asm}");
    assert!(asm.contains("sub rsp, 8"), "{asm}");
  }

  #[test_case("a = 0; b = 0; return a > b;", "a = 0; b = 0; return b < a;" ; "greater than")]
  #[test_case("a = 0; b = 0; return a >= b;", "a = 0; b = 0; return b <= a;" ; "greater or equal")]
  fn swapped_relationals_compile_identically(left: &str, right: &str) {
    assert_eq!(compile(left), compile(right));
  }

  #[test]
  fn division_emits_sign_extended_idiv() {
    let asm = compile("return 7 / -2;");
    assert!(asm.contains("cqo\n    idiv rdi"), "{asm}");
  }

  #[test]
  fn comparison_yields_zero_or_one() {
    let asm = compile("return 1 < 2;");
    assert!(asm.contains("setl al\n    movzb rax, al"), "{asm}");
  }

  #[test]
  fn if_without_else_branches_over_the_body() {
    let asm = compile("a = 1; if (a) a = 2;");
    assert!(asm.contains("je .L.endif.0"), "{asm}");
    assert!(!asm.contains(".L.else."), "{asm}");
    assert_eq!(asm.matches(".L.endif.0:").count(), 1);
  }

  #[test]
  fn if_else_wires_both_branches() {
    let asm = compile("a = 1; if (a) a = 2; else a = 3;");
    assert!(asm.contains("je .L.else.0"), "{asm}");
    assert!(asm.contains("jmp .L.endif.0"), "{asm}");
    assert!(asm.contains(".L.else.0:"), "{asm}");
    assert!(asm.contains(".L.endif.0:"), "{asm}");
  }

  #[test]
  fn while_loops_back_to_the_condition() {
    let asm = compile("x = 0; while (x < 5) x = x + 1; return x;");
    assert!(asm.contains(".L.while.0:"), "{asm}");
    assert!(asm.contains("je .L.endwhile.0"), "{asm}");
    assert!(asm.contains("jmp .L.while.0"), "{asm}");
    let body_start = asm.find(".L.while.0:").expect("loop label missing");
    let back_jump = asm.rfind("jmp .L.while.0").expect("back jump missing");
    assert!(back_jump > body_start);
  }

  #[test]
  fn for_without_condition_has_no_guard() {
    let asm = compile("for (;;) return 1;");
    assert!(asm.contains(".L.for.0:"), "{asm}");
    assert!(!asm.contains("je .L.endfor.0"), "{asm}");
    assert!(asm.contains("jmp .L.for.0"), "{asm}");
  }

  #[test]
  fn for_emits_init_condition_and_increment() {
    let asm = compile("for (i = 0; i < 3; i = i + 1) {}; return i;");
    assert!(asm.contains(".L.for.0:"), "{asm}");
    assert!(asm.contains("je .L.endfor.0"), "{asm}");
    assert!(asm.contains("jmp .L.for.0"), "{asm}");
    // init runs before the loop label
    let init_store = asm.find("mov [rax], rdi").expect("init store missing");
    let loop_label = asm.find(".L.for.0:").expect("loop label missing");
    assert!(init_store < loop_label);
  }

  #[test]
  fn return_funnels_through_the_shared_epilogue() {
    let asm = compile("while (1) return 42;");
    assert!(asm.contains("jmp .L.return"), "{asm}");
    assert_eq!(asm.matches(".L.return:").count(), 1);
    assert_eq!(asm.matches("ret\n").count(), 1);
  }

  #[test]
  fn call_pops_arguments_into_registers_in_reverse() {
    let asm = compile("foo(1, 2, 3);");
    let rdx = asm.find("pop rdx").expect("rdx pop missing");
    let rsi = asm.find("pop rsi").expect("rsi pop missing");
    let rdi_pos = asm.find("pop rdi").expect("rdi pop missing");
    assert!(rdx < rsi && rsi < rdi_pos, "{asm}");
  }

  #[test]
  fn call_aligns_the_stack_at_runtime() {
    let asm = compile("foo();");
    assert!(asm.contains("mov rax, rsp"), "{asm}");
    assert!(asm.contains("and rax, 15"), "{asm}");
    assert!(asm.contains("jnz .L.call.0"), "{asm}");
    assert!(asm.contains("sub rsp, 8"), "{asm}");
    assert!(asm.contains("add rsp, 8"), "{asm}");
    assert_eq!(asm.matches("call foo").count(), 2);
  }

  #[test]
  fn six_arguments_use_every_register() {
    let asm = compile("sum(1, 2, 3, 4, 5, 6);");
    for reg in ARG_REGS {
      assert!(asm.contains(&format!("pop {reg}")), "{asm}");
    }
  }

  #[test]
  fn label_numbers_never_repeat_across_constructs() {
    let asm = compile("if (1) f(); while (2) g(); for (;;) return h();");
    let defs = label_defs(&asm);
    let mut seen = std::collections::HashSet::new();
    for def in &defs {
      assert!(seen.insert(*def), "duplicate label {def} in {asm}");
    }
    // if draws 0, the call in its body 1, while 2, g() 3, for 4, h() 5
    assert!(asm.contains(".L.endif.0:"), "{asm}");
    assert!(asm.contains(".L.endcall.1:"), "{asm}");
    assert!(asm.contains(".L.while.2:"), "{asm}");
    assert!(asm.contains(".L.endcall.3:"), "{asm}");
    assert!(asm.contains(".L.for.4:"), "{asm}");
    assert!(asm.contains(".L.endcall.5:"), "{asm}");
  }

  #[test]
  fn empty_frame_skips_the_reservation() {
    let asm = compile("return 0;");
    assert!(!asm.contains("sub rsp,"), "{asm}");
  }

  #[test]
  #[should_panic(expected = "not an lvalue")]
  fn non_variable_assignment_target_is_fatal() {
    let function = Function {
      body: vec![Stmt::ExprStmt {
        expr: AstNode::assign(AstNode::number(1), AstNode::number(2)),
      }],
      locals: Vec::new(),
      stack_size: 0,
    };
    generate(&function);
  }
}
