//! Code emission for compiled machines.
//!
//! Two strategies reproduce a machine's byte-to-next-state function:
//!
//! - [`Generator::Table`] — dense transition and action-dispatch
//!   matrices plus an equality-chain dispatch loop ([`table`]).
//! - [`Generator::Goto`] — one block per state with direct jumps,
//!   rendered as a `loop`/`match` trampoline over block ids ([`goto`]).
//!
//! Emitters assemble a small statement tree ([`CodeBuilder`]) and only
//! render it to a string at the very end, so tests can assert on
//! structure without scraping concatenated text.  User action fragments
//! pass through the pseudomacro rewriter ([`rewrite`]) on their way in.

mod goto;
mod rewrite;
mod table;

use indexmap::{IndexMap, IndexSet};

use crate::dfa::Machine;
use crate::re::Regex;
use crate::CompileError;

pub(crate) use rewrite::{rewrite_fragment, MacroScope};

/// Host code fragments keyed by action name.
pub type ActionMap = IndexMap<String, String>;

/// Which emission strategy to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Generator {
    #[default]
    Table,
    Goto,
}

/// Names of the variables the emitted code declares and manipulates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarNames {
    pub p: String,
    pub p_end: String,
    pub is_eof: String,
    pub cs: String,
    pub data: String,
    pub mem: String,
    pub byte: String,
    pub buffer: String,
}

impl Default for VarNames {
    fn default() -> Self {
        Self {
            p: "p".to_string(),
            p_end: "p_end".to_string(),
            is_eof: "is_eof".to_string(),
            cs: "cs".to_string(),
            data: "data".to_string(),
            mem: "mem".to_string(),
            byte: "byte".to_string(),
            buffer: "buffer".to_string(),
        }
    }
}

/// Configuration for code emission.
#[derive(Clone, Debug, Default)]
pub struct CodeGenContext {
    pub vars: VarNames,
    pub generator: Generator,
    /// Name of a `fn(mem, p) -> u8` byte accessor.  `None` uses direct
    /// indexing.  The goto generator requires the default accessor.
    pub getbyte: Option<String>,
    /// Strip per-action origin comments from the emitted code.
    pub clean: bool,
    /// Host code inserted after variable initialization; pseudomacros
    /// are rewritten, but `@escape` is rejected here.
    pub init_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Statement tree
// ---------------------------------------------------------------------------

/// One node of the emitted-code tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Stmt {
    Line(String),
    Block {
        head: String,
        body: Vec<Stmt>,
        tail: String,
    },
}

impl Stmt {
    fn render(&self, indent: usize, out: &mut String) {
        match self {
            Stmt::Line(line) => {
                if line.is_empty() {
                    out.push('\n');
                } else {
                    for _ in 0..indent {
                        out.push_str("    ");
                    }
                    out.push_str(line);
                    out.push('\n');
                }
            }
            Stmt::Block { head, body, tail } => {
                for _ in 0..indent {
                    out.push_str("    ");
                }
                out.push_str(head);
                out.push('\n');
                for stmt in body {
                    stmt.render(indent + 1, out);
                }
                for _ in 0..indent {
                    out.push_str("    ");
                }
                out.push_str(tail);
                out.push('\n');
            }
        }
    }
}

/// An ordered sequence of statements under construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CodeBuilder {
    stmts: Vec<Stmt>,
}

impl CodeBuilder {
    pub fn line(&mut self, line: impl Into<String>) {
        self.stmts.push(Stmt::Line(line.into()));
    }

    /// Insert pre-rendered or user-supplied text line by line, keeping
    /// its internal indentation relative to the insertion point.
    pub fn raw(&mut self, text: &str) {
        for line in text.lines() {
            self.stmts.push(Stmt::Line(line.trim_end().to_string()));
        }
    }

    pub fn block(
        &mut self,
        head: impl Into<String>,
        build: impl FnOnce(&mut CodeBuilder),
        tail: impl Into<String>,
    ) {
        let mut body = CodeBuilder::default();
        build(&mut body);
        self.stmts.push(Stmt::Block {
            head: head.into(),
            body: body.stmts,
            tail: tail.into(),
        });
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for stmt in &self.stmts {
            stmt.render(0, &mut out);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Public emission API
// ---------------------------------------------------------------------------

/// Emit the complete scanner: initialization, the execution loop, and
/// the input-error reporting epilogue.
pub fn generate_code(
    ctx: &CodeGenContext,
    machine: &Machine,
    actions: &ActionMap,
) -> Result<String, CompileError> {
    let mut out = generate_init_code(ctx)?;
    out.push_str(&generate_exec_code(ctx, machine, actions)?);
    out.push_str(&generate_input_error_code(ctx, machine));
    Ok(out)
}

/// Emit variable initialization: `p`, `p_end`, `is_eof`, `cs`, and the
/// sized byte view `mem` over the input.
pub fn generate_init_code(ctx: &CodeGenContext) -> Result<String, CompileError> {
    let v = &ctx.vars;
    let mut b = CodeBuilder::default();
    b.line(format!("let {}: &[u8] = &{}[..];", v.mem, v.data));
    b.line(format!("let mut {}: usize = 1;", v.p));
    b.line(format!("let {}: usize = {}.len();", v.p_end, v.mem));
    b.line(format!("let {}: bool = true;", v.is_eof));
    b.line(format!("let mut {}: isize = 1;", v.cs));
    if let Some(init) = &ctx.init_code {
        b.raw(&rewrite_fragment(init, v, MacroScope::Init)?);
    }
    Ok(b.render())
}

/// Emit the execution loop for the configured generator.
pub fn generate_exec_code(
    ctx: &CodeGenContext,
    machine: &Machine,
    actions: &ActionMap,
) -> Result<String, CompileError> {
    check_action_set(machine, actions)?;
    let builder = match ctx.generator {
        Generator::Table => table::emit(ctx, machine, actions)?,
        Generator::Goto => goto::emit(ctx, machine, actions)?,
    };
    Ok(builder.render())
}

/// Emit the input-error epilogue: on failure, hand the machine
/// descriptor, the halting state, the offending byte (`None` at EOF),
/// the byte view and the position to the host's `report_input_error`.
pub fn generate_input_error_code(ctx: &CodeGenContext, machine: &Machine) -> String {
    let v = &ctx.vars;
    let mut b = CodeBuilder::default();
    b.block(
        format!("if {} != 0 {{", v.cs),
        |b| {
            b.line(format!(
                "let __byte: Option<u8> = if {} <= {} {{ Some({}[{} - 1]) }} else {{ None }};",
                v.p, v.p_end, v.mem, v.p
            ));
            b.line(format!(
                "report_input_error(\"dfa({} states)\", {}, __byte, {}, {});",
                machine.state_count(),
                v.cs,
                v.mem,
                v.p
            ));
        },
        "}",
    );
    b.render()
}

/// Emit a whole validator function for `re`: it returns `None` on a
/// full match, `Some(0)` on unexpected EOF, and the 1-based position of
/// the first invalid byte otherwise.
pub fn generate_buffer_validator(
    name: &str,
    re: Regex,
    goto: bool,
) -> Result<String, CompileError> {
    let machine = crate::compile(re)?;
    let ctx = CodeGenContext {
        generator: if goto { Generator::Goto } else { Generator::Table },
        ..CodeGenContext::default()
    };
    let v = &ctx.vars;
    let init = generate_init_code(&ctx)?;
    let exec = generate_exec_code(&ctx, &machine, &ActionMap::new())?;

    let mut b = CodeBuilder::default();
    b.block(
        format!("fn {}({}: &[u8]) -> Option<usize> {{", name, v.data),
        |b| {
            b.raw(&init);
            b.raw(&exec);
            b.block(
                format!("if {} == 0 {{", v.cs),
                |b| b.line("None"),
                "}",
            );
            b.block(
                format!("else if {} < 0 {{", v.cs),
                |b| b.line(format!("Some({})", v.p)),
                "}",
            );
            b.block("else {", |b| b.line("Some(0)"), "}");
        },
        "}",
    );
    Ok(b.render())
}

/// Verify the host-supplied action map against the machine: every
/// referenced action must be present, and nothing extra may be passed.
fn check_action_set(machine: &Machine, actions: &ActionMap) -> Result<(), CompileError> {
    for name in machine.action_names() {
        if !actions.contains_key(name) {
            return Err(CompileError::MissingAction(name.clone()));
        }
    }
    for name in actions.keys() {
        if !machine.action_names().contains(name) {
            return Err(CompileError::UnusedAction(name.clone()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared emitter helpers
// ---------------------------------------------------------------------------

/// Deduplicate the distinct action-name sequences of a machine's
/// transitions; the 1-based position is the dispatch id.
pub(crate) fn intern_action_lists(machine: &Machine) -> IndexSet<Vec<String>> {
    let mut lists = IndexSet::new();
    for (_, state) in machine.dfa.iter() {
        for e in &state.edges {
            if !e.actions.is_empty() {
                lists.insert(action_names(&e.actions));
            }
        }
    }
    lists
}

pub(crate) fn action_names(actions: &[crate::nfa::Action]) -> Vec<String> {
    actions.iter().map(|a| a.name.clone()).collect()
}

/// Smallest signed integer type able to hold `min..=max`.
pub(crate) fn int_type(min: i64, max: i64) -> &'static str {
    if min >= i8::MIN as i64 && max <= i8::MAX as i64 {
        "i8"
    } else if min >= i16::MIN as i64 && max <= i16::MAX as i64 {
        "i16"
    } else {
        "i32"
    }
}

/// Format a byte as it should appear in emitted code.
pub(crate) fn byte_literal(b: u8) -> String {
    match b {
        b'\'' => "b'\\''".to_string(),
        b'\\' => "b'\\\\'".to_string(),
        b if b.is_ascii_graphic() || b == b' ' => format!("b'{}'", b as char),
        b => format!("{:#04x}", b),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    #[test]
    fn test_code_builder_renders_nested_blocks() {
        let mut b = CodeBuilder::default();
        b.line("let x = 1;");
        b.block(
            "if x == 1 {",
            |b| {
                b.line("x += 1;");
                b.block("loop {", |b| b.line("break;"), "}");
            },
            "}",
        );
        assert_eq!(
            b.render(),
            "let x = 1;\nif x == 1 {\n    x += 1;\n    loop {\n        break;\n    }\n}\n"
        );
    }

    #[test]
    fn test_raw_preserves_relative_indent() {
        let mut b = CodeBuilder::default();
        b.block("fn f() {", |b| b.raw("a();\n    b();"), "}");
        assert_eq!(b.render(), "fn f() {\n    a();\n        b();\n}\n");
    }

    #[test]
    fn test_init_code_declares_configured_names() {
        let mut ctx = CodeGenContext::default();
        ctx.vars.p = "pos".to_string();
        ctx.vars.cs = "state".to_string();
        let init = generate_init_code(&ctx).unwrap();
        assert!(init.contains("let mut pos: usize = 1;"));
        assert!(init.contains("let mut state: isize = 1;"));
        assert!(init.contains("let mem: &[u8] = &data[..];"));
    }

    #[test]
    fn test_init_code_rejects_escape() {
        let ctx = CodeGenContext {
            init_code: Some("@escape".to_string()),
            ..CodeGenContext::default()
        };
        assert!(matches!(
            generate_init_code(&ctx),
            Err(CompileError::MacroMisuse(_))
        ));
    }

    #[test]
    fn test_action_set_mismatch() {
        let mut re = parse("ab").unwrap();
        re.on_enter(["present"]);
        let machine = crate::compile(re).unwrap();
        let ctx = CodeGenContext::default();

        let empty = ActionMap::new();
        assert!(matches!(
            generate_exec_code(&ctx, &machine, &empty),
            Err(CompileError::MissingAction(_))
        ));

        let mut extra = ActionMap::new();
        extra.insert("present".to_string(), "count += 1;".to_string());
        extra.insert("stray".to_string(), "".to_string());
        assert!(matches!(
            generate_exec_code(&ctx, &machine, &extra),
            Err(CompileError::UnusedAction(_))
        ));
    }

    #[test]
    fn test_int_type_selection() {
        assert_eq!(int_type(-5, 5), "i8");
        assert_eq!(int_type(-127, 127), "i8");
        assert_eq!(int_type(-128, 128), "i16");
        assert_eq!(int_type(-40_000, 40_000), "i32");
        assert_eq!(int_type(0, 200), "i16");
    }

    #[test]
    fn test_byte_literal_formats() {
        assert_eq!(byte_literal(b'a'), "b'a'");
        assert_eq!(byte_literal(b' '), "b' '");
        assert_eq!(byte_literal(b'\''), "b'\\''");
        assert_eq!(byte_literal(b'\\'), "b'\\\\'");
        assert_eq!(byte_literal(0x0a), "0x0a");
        assert_eq!(byte_literal(0xff), "0xff");
    }

    #[test]
    fn test_validator_text_shape() {
        let src = generate_buffer_validator("check_word", parse("[a-z]+").unwrap(), true).unwrap();
        assert!(src.starts_with("fn check_word(data: &[u8]) -> Option<usize> {"));
        assert!(src.contains("if cs == 0 {"));
        assert!(src.contains("Some(p)"));
        assert!(src.contains("Some(0)"));
        // The validator is self-contained: no reporter call.
        assert!(!src.contains("report_input_error"));
    }

    #[test]
    fn test_generate_code_has_all_three_phases() {
        let machine = crate::compile(parse("ab").unwrap()).unwrap();
        let ctx = CodeGenContext::default();
        let src = generate_code(&ctx, &machine, &ActionMap::new()).unwrap();
        assert!(src.contains("let mut p: usize = 1;"));
        assert!(src.contains("while p <= p_end && cs > 0 {"));
        assert!(src.contains("report_input_error"));
    }
}
