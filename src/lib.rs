//! Regex-to-DFA compilation with action-bearing code generation.
//!
//! The crate compiles byte-level regular expressions, annotated with
//! named action bindings and precondition guards, into deterministic
//! finite automata, and emits Rust source implementing the automaton as
//! either a table-driven interpreter or a direct-threaded jump network.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! pattern ──parse──> Regex ──annotate──> Regex ──desugar──> core algebra
//!         ──Thompson──> NFA ──subset──> DFA ──minimize──> Machine
//!         ──generate──> Rust source
//! ```
//!
//! - [`parse`] builds a [`Regex`] from the crate's pattern syntax;
//!   [`Regex::from_hir`] lowers a byte-mode `regex-syntax` HIR instead.
//! - `on_enter` / `on_exit` / `on_final` / `on_all` bind actions to a
//!   node's boundary events; [`Regex::precond`] attaches named guards.
//! - [`compile`] runs desugaring, Thompson construction with epsilon
//!   elimination, subset construction and minimization, producing a
//!   [`Machine`] whose states are numbered from 1.
//! - [`generate_code`] (and its [`generate_init_code`] /
//!   [`generate_exec_code`] / [`generate_input_error_code`] subphases)
//!   emits the scanner; [`generate_buffer_validator`] wraps a whole
//!   validator function around it.
//!
//! Emitted scanners walk `data[1..=p_end]` once.  At each transition
//! the bound action fragments run in a deterministic order fixed by the
//! regex tree (inside-out for exits, outside-in for enters, `all`
//! before everything else on the same edge); input ending in an accept
//! state runs that state's EOF actions before `cs` is cleared.  Action
//! fragments may use the pseudomacros of the [`ScanBuffer`] hook
//! surface (`@mark`, `@unmark`, `@markpos`, `@bufferpos`,
//! `@setbuffer`, `@relpos(x)`, `@abspos(x)`) plus `@escape` to leave
//! the scanner early.
//!
//! # Example
//!
//! ```
//! use redfa::{compile, parse};
//!
//! let mut word = parse("[a-z]+").unwrap();
//! word.on_all(["letter"]);
//! let machine = compile(word).unwrap();
//! assert!(machine.accepts(b"hello"));
//! let scan = machine.scan(b"ab", |_| true);
//! assert_eq!(scan.trace, vec!["letter".to_string(); 2]);
//! ```

use std::fmt;

pub mod buffer;
pub mod byteset;
mod codegen;
mod dfa;
mod nfa;
mod re;

pub use buffer::{ScanBuffer, VecBuffer};
pub use byteset::ByteSet;
pub use codegen::{
    generate_buffer_validator, generate_code, generate_exec_code, generate_init_code,
    generate_input_error_code, ActionMap, CodeGenContext, Generator, VarNames,
};
pub use dfa::{Machine, Scan};
pub use re::{parse, ClassItem, Node, Polarity, PrecondWhen, Regex};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An error raised during compilation or code generation.  No partial
/// machine or source text is ever returned alongside one.
#[derive(Debug)]
pub enum CompileError {
    /// Malformed pattern syntax.
    Parse { pos: usize, message: String },
    /// A `regex-syntax` HIR construct with no byte-level equivalent.
    UnsupportedHir(String),
    /// A `final` action on a regex that consumes no bytes.
    FinalOnIndefinite,
    /// The NFA cannot be determinized with the available preconditions,
    /// or action/EOF sequencing is not uniquely determined.
    Ambiguous(String),
    /// An `isec`/`diff` filter operand carries actions.
    ActionInFilter,
    /// An `isec`/`diff` operand carries precondition guards.
    PrecondInFilter,
    /// The machine carries preconditions, which the table generator
    /// cannot encode; use the goto generator.
    PrecondWithTable,
    /// A custom `getbyte` accessor with the goto generator, which reads
    /// the byte view directly.
    GetbyteWithGoto,
    /// A pseudomacro used with the wrong arity or outside an action.
    MacroMisuse(String),
    /// The machine references an action the supplied map lacks.
    MissingAction(String),
    /// The supplied map names an action the machine never fires.
    UnusedAction(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { pos, message } => {
                write!(f, "parse error at byte {}: {}", pos, message)
            }
            Self::UnsupportedHir(what) => write!(f, "unsupported pattern construct: {}", what),
            Self::FinalOnIndefinite => {
                write!(f, "`final` action on a regex without a definite last byte")
            }
            Self::Ambiguous(why) => write!(f, "cannot determinize: {}", why),
            Self::ActionInFilter => write!(
                f,
                "intersection/difference filter operands cannot carry actions"
            ),
            Self::PrecondInFilter => write!(
                f,
                "intersection/difference operands cannot carry preconditions"
            ),
            Self::PrecondWithTable => write!(
                f,
                "preconditions cannot be table-encoded; use the goto generator"
            ),
            Self::GetbyteWithGoto => {
                write!(f, "the goto generator requires the default byte accessor")
            }
            Self::MacroMisuse(why) => write!(f, "pseudomacro misuse: {}", why),
            Self::MissingAction(name) => {
                write!(f, "machine references action `{}` missing from the map", name)
            }
            Self::UnusedAction(name) => {
                write!(f, "action map entry `{}` is never fired by the machine", name)
            }
        }
    }
}

impl std::error::Error for CompileError {}

// ---------------------------------------------------------------------------
// Compilation pipeline
// ---------------------------------------------------------------------------

/// Compile an annotated regex into a [`Machine`]: desugar, build the
/// NFA, determinize, minimize.
pub fn compile(re: Regex) -> Result<Machine, CompileError> {
    let desugared = re.desugar();
    let nfa = nfa::Nfa::from_regex(&desugared)?;
    let dfa = dfa::determinize(&nfa)?;
    let dfa = dfa::minimize(&dfa);
    Ok(Machine::new(dfa))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Cross-validation against the regex crate
    // -----------------------------------------------------------------------

    /// Check our whole-input acceptance against the `regex` crate in
    /// byte mode (`(?s-u)`, anchored).
    fn assert_matches_regex_crate(pattern: &str, input: &[u8]) {
        let oracle = regex::bytes::Regex::new(&format!("^(?s-u:{})$", pattern))
            .expect("regex crate should parse pattern");
        let expected = oracle.is_match(input);
        let machine = compile(parse(pattern).unwrap()).unwrap();
        let actual = machine.accepts(input);
        assert_eq!(
            actual, expected,
            "pattern `{}` on input {:?}: ours={}, regex crate={}",
            pattern, input, actual, expected
        );
    }

    #[test]
    fn test_cross_validate_literals_and_quantifiers() {
        for pattern in ["a+b", "a?b*c+", "(ab|cd)+", "a.c", ".+"] {
            for input in [
                &b""[..],
                b"a",
                b"ab",
                b"aab",
                b"abc",
                b"abcd",
                b"abab",
                b"cdab",
                b"axc",
                b"a\nc",
                b"bc",
                b"zzz",
            ] {
                assert_matches_regex_crate(pattern, input);
            }
        }
    }

    #[test]
    fn test_cross_validate_classes() {
        for pattern in ["[a-z]+", "[^a-z]", "[a-cx-z]*y", "[\\x00-\\x1f]+"] {
            for input in [
                &b""[..],
                b"abc",
                b"ABC",
                b"a1",
                b"1",
                b"\x00\x1f",
                b"xyzy",
                b"axy",
                b"y",
            ] {
                assert_matches_regex_crate(pattern, input);
            }
        }
    }

    #[test]
    fn test_cross_validate_high_bytes() {
        for pattern in ["\\xff+", "[\\x80-\\xff]*"] {
            for input in [&b""[..], b"\xff", b"\xff\xff", b"\x80\x90\xff", b"a"] {
                assert_matches_regex_crate(pattern, input);
            }
        }
    }

    /// Desugaring preserves the language: the sugar forms agree with
    /// the oracle's reading of the same pattern.
    #[test]
    fn test_cross_validate_sugar_forms() {
        for pattern in ["(a|bc|def)x?", "a+|b+", "(ab?)+"] {
            for input in [
                &b""[..],
                b"a",
                b"ax",
                b"bc",
                b"bcx",
                b"def",
                b"defx",
                b"aa",
                b"bb",
                b"abab",
                b"aab",
                b"x",
            ] {
                assert_matches_regex_crate(pattern, input);
            }
        }
    }

    fn hir_of(pattern: &str) -> regex_syntax::hir::Hir {
        use regex_syntax::ast::parse::ParserBuilder;
        use regex_syntax::hir::translate::TranslatorBuilder;

        let full = format!("(?s-u){}", pattern);
        let ast = ParserBuilder::new()
            .build()
            .parse(&full)
            .expect("regex-syntax AST parse should succeed");
        TranslatorBuilder::new()
            .utf8(false)
            .build()
            .translate(&full, &ast)
            .expect("regex-syntax HIR translation should succeed")
    }

    #[test]
    fn test_cross_validate_from_hir() {
        for pattern in ["a{2,4}", "(ab){1,3}c", "\\d+", "[a-f]{3,}"] {
            let oracle = regex::bytes::Regex::new(&format!("^(?s-u:{})$", pattern)).unwrap();
            let machine = compile(Regex::from_hir(&hir_of(pattern)).unwrap()).unwrap();
            for input in [
                &b""[..],
                b"a",
                b"aa",
                b"aaa",
                b"aaaa",
                b"aaaaa",
                b"abc",
                b"ababc",
                b"abababc",
                b"ababababc",
                b"123",
                b"12a",
                b"abcdef",
                b"fedcba",
            ] {
                assert_eq!(
                    machine.accepts(input),
                    oracle.is_match(input),
                    "pattern `{}` on {:?}",
                    pattern,
                    input
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // End-to-end scenarios
    // -----------------------------------------------------------------------

    /// FASTA-like record stream: per-record enter/exit actions and
    /// per-byte actions on header and sequence segments.
    #[test]
    fn test_scenario_fasta_like_records() {
        let mut header = parse("[a-z]+").unwrap();
        header.on_all(["header_byte"]);
        let mut seq = parse("[ACGT]+").unwrap();
        seq.on_all(["seq_byte"]);
        let newline = parse("\\n").unwrap();
        let line = Regex::cat(vec![seq, newline.clone()]);
        let mut record = Regex::cat(vec![
            parse(">").unwrap(),
            header,
            newline,
            line.rep1(),
        ]);
        record.on_enter(["record_start"]);
        record.on_exit(["record_end"]);
        let machine = compile(record.rep1()).unwrap();

        let scan = machine.scan(b">abc\nACGT\nACGT\n>de\nGGGG\n", |_| true);
        assert_eq!(scan.error, None);

        let mut expected: Vec<&str> = Vec::new();
        expected.push("record_start");
        expected.extend(["header_byte"; 3]);
        expected.extend(["seq_byte"; 8]);
        expected.push("record_end");
        expected.push("record_start");
        expected.extend(["header_byte"; 2]);
        expected.extend(["seq_byte"; 4]);
        expected.push("record_end");
        assert_eq!(scan.trace, expected);
    }

    /// Invalid input reports the 1-based position of the first bad byte.
    #[test]
    fn test_scenario_invalid_byte_position() {
        let machine = compile(parse("a+b").unwrap()).unwrap();
        assert_eq!(machine.validate(b"aaac"), Some(4));
    }

    /// Input exhausted in a non-accept state reports 0.
    #[test]
    fn test_scenario_unexpected_eof() {
        let machine = compile(parse("a+b").unwrap()).unwrap();
        assert_eq!(machine.validate(b"aaaa"), Some(0));
    }

    /// Enter/exit ordering across adjacent annotated regexes.
    #[test]
    fn test_scenario_action_ordering() {
        let mut ab = parse("ab").unwrap();
        ab.on_enter(["A"]);
        ab.on_exit(["B"]);
        let mut cd = parse("cd").unwrap();
        cd.on_enter(["C"]);
        cd.on_exit(["D"]);
        let machine = compile(ab * cd).unwrap();
        let scan = machine.scan(b"abcd", |_| true);
        assert_eq!(scan.error, None);
        assert_eq!(scan.trace, vec!["A", "B", "C", "D"]);
    }

    /// Nested enter/exit: outer enter first, inner exit first.
    #[test]
    fn test_scenario_nested_action_ordering() {
        let mut inner = parse("ab").unwrap();
        inner.on_enter(["inner_in"]);
        inner.on_exit(["inner_out"]);
        let mut outer = Regex::cat(vec![inner, parse("x").unwrap()]);
        outer.on_enter(["outer_in"]);
        outer.on_exit(["outer_out"]);
        let machine = compile(outer).unwrap();
        let scan = machine.scan(b"abx", |_| true);
        assert_eq!(scan.error, None);
        assert_eq!(
            scan.trace,
            vec!["outer_in", "inner_in", "inner_out", "outer_out"]
        );
    }

    /// Language intersection with negation.
    #[test]
    fn test_scenario_intersection() {
        let machine = compile(parse("[a-z]+").unwrap() & !parse("foo").unwrap()).unwrap();
        assert!(!machine.accepts(b"foo"));
        assert!(machine.accepts(b"fox"));
    }

    /// A guarded branch vanishes when its precondition is false.
    #[test]
    fn test_scenario_precondition_routing() {
        let mut strict = parse("ab").unwrap();
        strict.precond("allow_b", PrecondWhen::Enter, Polarity::True);
        let machine = compile(strict | parse("ac").unwrap()).unwrap();
        // allow_b = false: input that would take the guarded branch
        // fails as if the edge did not exist; the alternative still
        // matches.
        assert_eq!(machine.scan(b"ab", |_| false).error, Some(2));
        assert_eq!(machine.scan(b"ac", |_| false).error, None);
        assert_eq!(machine.scan(b"ab", |_| true).error, None);
    }

    // -----------------------------------------------------------------------
    // Validator contract
    // -----------------------------------------------------------------------

    #[test]
    fn test_validator_prefix_property() {
        // If validate(s) == Some(k) with k > 0, the prefix before k is
        // itself valid-so-far: validate(prefix) is None or Some(0).
        let machine = compile(parse("a+b").unwrap()).unwrap();
        for input in [&b"aaac"[..], b"ba", b"axb", b"abb"] {
            if let Some(k) = machine.validate(input) {
                if k > 0 {
                    let prefix = &input[..k - 1];
                    assert!(
                        machine.validate(prefix).map_or(true, |r| r == 0),
                        "prefix of {:?} up to {} should be a valid partial input",
                        input,
                        k
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Generated code (structural checks against the machine)
    // -----------------------------------------------------------------------

    #[test]
    fn test_table_codegen_matrix_shape() {
        let machine = compile(parse("a+b").unwrap()).unwrap();
        let n = machine.state_count();
        let ctx = CodeGenContext::default();
        let src = generate_exec_code(&ctx, &machine, &ActionMap::new()).unwrap();
        assert!(src.contains(&format!("static __TRANS: [i8; {}] = [", n * 256)));
        assert!(src.contains(&format!("static __ACTS: [i8; {}] = [", n * 256)));
        assert!(src.contains("while p <= p_end && cs > 0 {"));
        assert!(src.contains("cs = __TRANS[__idx] as isize;"));
        // Error adjustment per the table skeleton.
        assert!(src.contains("p -= 1;"));
    }

    #[test]
    fn test_table_codegen_action_dispatch_chain() {
        let mut re = parse("ab").unwrap();
        re.on_enter(["first"]);
        re.on_exit(["second"]);
        let machine = compile(re).unwrap();
        let mut actions = ActionMap::new();
        actions.insert("first".to_string(), "n_first += 1;".to_string());
        actions.insert("second".to_string(), "n_second += 1;".to_string());
        let ctx = CodeGenContext::default();
        let src = generate_exec_code(&ctx, &machine, &actions).unwrap();
        assert!(src.contains("if __act == 1 {"));
        assert!(src.contains("n_first += 1;"));
        // Exit actions only fire at EOF here.
        assert!(src.contains("n_second += 1;"));
        assert!(src.contains("cs = 0;"));
    }

    #[test]
    fn test_table_codegen_rejects_preconds() {
        let mut re = parse("ab").unwrap();
        re.precond("flag", PrecondWhen::Enter, Polarity::True);
        let machine = compile(re).unwrap();
        let ctx = CodeGenContext::default();
        assert!(matches!(
            generate_exec_code(&ctx, &machine, &ActionMap::new()),
            Err(CompileError::PrecondWithTable)
        ));
    }

    #[test]
    fn test_goto_codegen_emits_preconds() {
        let mut strict = parse("ab").unwrap();
        strict.precond("allow_b", PrecondWhen::Enter, Polarity::True);
        let machine = compile(strict | parse("ac").unwrap()).unwrap();
        let ctx = CodeGenContext {
            generator: Generator::Goto,
            ..CodeGenContext::default()
        };
        let src = generate_exec_code(&ctx, &machine, &ActionMap::new()).unwrap();
        assert!(src.contains("'__scan: loop {"));
        assert!(src.contains("&& allow_b"));
    }

    #[test]
    fn test_goto_codegen_block_structure() {
        let machine = compile(parse("a+b").unwrap()).unwrap();
        let ctx = CodeGenContext {
            generator: Generator::Goto,
            ..CodeGenContext::default()
        };
        let src = generate_exec_code(&ctx, &machine, &ActionMap::new()).unwrap();
        for id in 1..=machine.state_count() {
            assert!(src.contains(&format!("// state_{}", id)));
            assert!(src.contains(&format!("// state_case_{}", id)));
        }
        assert!(src.contains("// exit"));
        assert!(src.contains("break '__scan;"));
    }

    #[test]
    fn test_goto_codegen_rejects_custom_getbyte() {
        let machine = compile(parse("ab").unwrap()).unwrap();
        let ctx = CodeGenContext {
            generator: Generator::Goto,
            getbyte: Some("fetch".to_string()),
            ..CodeGenContext::default()
        };
        assert!(matches!(
            generate_exec_code(&ctx, &machine, &ActionMap::new()),
            Err(CompileError::GetbyteWithGoto)
        ));
    }

    #[test]
    fn test_table_codegen_custom_getbyte() {
        let machine = compile(parse("ab").unwrap()).unwrap();
        let ctx = CodeGenContext {
            getbyte: Some("fetch".to_string()),
            ..CodeGenContext::default()
        };
        let src = generate_exec_code(&ctx, &machine, &ActionMap::new()).unwrap();
        assert!(src.contains("let byte: u8 = fetch(mem, p);"));
    }

    /// Both generators embed the same action fragments, and keep the
    /// within-block order of a shared transition.
    #[test]
    fn test_generators_embed_same_actions() {
        let mut ab = parse("ab").unwrap();
        ab.on_enter(["A"]);
        ab.on_exit(["B"]);
        let mut cd = parse("cd").unwrap();
        cd.on_enter(["C"]);
        cd.on_exit(["D"]);
        let machine = compile(ab * cd).unwrap();
        let mut actions = ActionMap::new();
        for name in ["A", "B", "C", "D"] {
            actions.insert(name.to_string(), format!("seen.push(\"{}\");", name));
        }
        let table_src =
            generate_exec_code(&CodeGenContext::default(), &machine, &actions).unwrap();
        let goto_src = generate_exec_code(
            &CodeGenContext {
                generator: Generator::Goto,
                ..CodeGenContext::default()
            },
            &machine,
            &actions,
        )
        .unwrap();
        for name in ["A", "B", "C", "D"] {
            let marker = format!("seen.push(\"{}\");", name);
            assert!(table_src.contains(&marker), "table misses {}", name);
            assert!(goto_src.contains(&marker), "goto misses {}", name);
        }
        // The transition on `c` fires B then C: both emitters keep that
        // order inside the block.
        for src in [&table_src, &goto_src] {
            let b_at = src.find("seen.push(\"B\");").unwrap();
            let c_at = src.find("seen.push(\"C\");").unwrap();
            assert!(b_at < c_at, "B must precede C");
        }
    }

    #[test]
    fn test_clean_strips_action_comments() {
        let mut re = parse("ab").unwrap();
        re.on_enter(["noted"]);
        let machine = compile(re).unwrap();
        let mut actions = ActionMap::new();
        actions.insert("noted".to_string(), "n += 1;".to_string());
        let commented =
            generate_exec_code(&CodeGenContext::default(), &machine, &actions).unwrap();
        assert!(commented.contains("// action: noted"));
        let clean = generate_exec_code(
            &CodeGenContext {
                clean: true,
                ..CodeGenContext::default()
            },
            &machine,
            &actions,
        )
        .unwrap();
        assert!(!clean.contains("// action: noted"));
        assert!(clean.contains("n += 1;"));
    }

    /// The emitted transition matrix must agree with the machine's own
    /// transition function.
    #[test]
    fn test_table_matrix_matches_interpreter() {
        let machine = compile(parse("(ab|cd)+").unwrap()).unwrap();
        let ctx = CodeGenContext::default();
        let src = generate_exec_code(&ctx, &machine, &ActionMap::new()).unwrap();
        // Parse the __TRANS literal back out of the emitted source.
        let start = src.find("static __TRANS").unwrap();
        let open = src[start..].find("= [").unwrap() + start + 2;
        let close = src[open..].find("];").unwrap() + open;
        let values: Vec<i64> = src[open + 1..close]
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with("//"))
            .flat_map(|l| l.split(','))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(values.len(), machine.state_count() * 256);
        // Check every state/byte cell against the interpreter's view.
        for state in 1..=machine.state_count() {
            for byte in 0..=255u8 {
                let cell = values[(state - 1) * 256 + byte as usize];
                let expected = machine
                    .transition(state as u32, byte)
                    .map_or(-(state as i64), |t| t as i64);
                assert_eq!(cell, expected, "state {} byte {:#04x} mismatch", state, byte);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Error surface
    // -----------------------------------------------------------------------

    #[test]
    fn test_error_display_messages() {
        let err = compile({
            let mut re = Regex::epsilon();
            re.on_final(["f"]);
            re
        })
        .unwrap_err();
        assert!(err.to_string().contains("definite last byte"));

        let err = parse("[").unwrap_err();
        assert!(err.to_string().starts_with("parse error"));
    }
}
