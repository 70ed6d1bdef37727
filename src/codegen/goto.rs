//! The goto generator: one labelled block per state with direct jumps,
//! rendered as a `loop`/`match` trampoline over block ids.
//!
//! Rust has no `goto`, so the labelled-jump network is expressed the
//! direct-coded way: every jump target owns an integer block id and a
//! jump is `__blk = ID; continue '__scan;`.  The layout per state `N`:
//!
//! - `state_N` (id `2N-1`) — advance: `p += 1`, jump to `exit` at EOF
//!   (recording `cs = N`), else fall into `state_case_N`.
//! - `state_case_N` (id `2N`) — load the byte at `p` and test the
//!   outgoing edges in order (guarded edges first, larger label sets
//!   first); the fallthrough records `cs = -N` and jumps to `exit`.
//! - `state_M_actions_i` — one prologue per distinct (destination,
//!   action list) pair; runs the actions, then jumps to `state_M`.
//! - `exit` (id 0, the `_` arm) — at EOF in an accept state, run the
//!   EOF chain and clear `cs`; then leave the loop.
//!
//! Preconditions compile to conjunctions over the named guard
//! expressions.  The default byte accessor is required here: edge tests
//! read `mem` directly.

use indexmap::{IndexMap, IndexSet};

use super::{
    action_names, byte_literal, rewrite_fragment, ActionMap, CodeBuilder, CodeGenContext,
    MacroScope,
};
use crate::byteset::ByteSet;
use crate::dfa::Machine;
use crate::re::Polarity;
use crate::CompileError;

pub(crate) fn emit(
    ctx: &CodeGenContext,
    machine: &Machine,
    actions: &ActionMap,
) -> Result<CodeBuilder, CompileError> {
    if ctx.getbyte.is_some() {
        return Err(CompileError::GetbyteWithGoto);
    }
    let v = &ctx.vars;
    let n = machine.state_count() as u32;

    // One prologue block per distinct (destination state, action list).
    let mut prologues: IndexSet<(u32, Vec<String>)> = IndexSet::new();
    for (_, state) in machine.dfa.iter() {
        for e in &state.edges {
            if !e.actions.is_empty() {
                prologues.insert((e.target, action_names(&e.actions)));
            }
        }
    }
    let adv = |state: u32| 2 * state - 1;
    let case = |state: u32| 2 * state;
    let prologue_id =
        |idx: usize| 2 * n as usize + idx + 1;

    // Rewrite fragments per prologue (the `@escape` expansion needs the
    // destination state) and per accept state for EOF.
    let mut prologue_code: Vec<Vec<(String, String)>> = Vec::new();
    for (target, names) in &prologues {
        let mut blocks = Vec::new();
        for name in names {
            let fragment = actions.get(name).expect("action map checked");
            let scope = MacroScope::GotoAction { state: *target };
            blocks.push((name.clone(), rewrite_fragment(fragment, v, scope)?));
        }
        prologue_code.push(blocks);
    }
    let mut eof_code: IndexMap<&str, String> = IndexMap::new();
    for name in machine.action_names() {
        let fragment = actions.get(name).expect("action map checked");
        eof_code.insert(name.as_str(), rewrite_fragment(fragment, v, MacroScope::Eof)?);
    }

    let mut b = CodeBuilder::default();

    // Entry dispatch: resume at the case block for `cs`, or go straight
    // to exit when the input is already exhausted.
    b.block(
        format!("let mut __blk: usize = if {} > {} || {} <= 0 {{", v.p, v.p_end, v.cs),
        |b| b.line("0"),
        "}",
    );
    for state in 1..=n {
        b.block(
            format!("else if {} == {} {{", v.cs, state),
            |b| b.line(format!("{}", case(state))),
            "}",
        );
    }
    b.block("else {", |b| b.line("0"), "};");

    b.block(
        "'__scan: loop {",
        |b| {
            b.block(
                "match __blk {",
                |b| {
                    for (id, state) in machine.dfa.iter() {
                        // Advance block.
                        b.line(format!("// state_{}", id));
                        b.block(
                            format!("{} => {{", adv(id)),
                            |b| {
                                b.line(format!("{} += 1;", v.p));
                                b.block(
                                    format!("if {} > {} {{", v.p, v.p_end),
                                    |b| {
                                        b.line(format!("{} = {};", v.cs, id));
                                        b.line("__blk = 0;".to_string());
                                    },
                                    "}",
                                );
                                b.block(
                                    "else {",
                                    |b| b.line(format!("__blk = {};", case(id))),
                                    "}",
                                );
                                b.line("continue '__scan;");
                            },
                            "}",
                        );
                        // Case block: byte load and edge tests.
                        b.line(format!("// state_case_{}", id));
                        b.block(
                            format!("{} => {{", case(id)),
                            |b| {
                                b.line(format!(
                                    "let {}: u8 = {}[{} - 1];",
                                    v.byte, v.mem, v.p
                                ));
                                for e in &state.edges {
                                    let target_blk = if e.actions.is_empty() {
                                        adv(e.target) as usize
                                    } else {
                                        let idx = prologues
                                            .get_index_of(&(e.target, action_names(&e.actions)))
                                            .expect("interned");
                                        prologue_id(idx)
                                    };
                                    b.block(
                                        format!("if {} {{", edge_cond(&e.labels, &e.preconds, ctx)),
                                        |b| {
                                            b.line(format!("__blk = {};", target_blk));
                                            b.line("continue '__scan;");
                                        },
                                        "}",
                                    );
                                }
                                b.line(format!("{} = -{};", v.cs, id));
                                b.line("__blk = 0;".to_string());
                                b.line("continue '__scan;");
                            },
                            "}",
                        );
                    }
                    // Action prologues.
                    for (idx, (target, names)) in prologues.iter().enumerate() {
                        b.line(format!(
                            "// state_{}_actions ({})",
                            target,
                            names.join(", ")
                        ));
                        b.block(
                            format!("{} => {{", prologue_id(idx)),
                            |b| {
                                for (name, code) in &prologue_code[idx] {
                                    if !ctx.clean {
                                        b.line(format!("// action: {}", name));
                                    }
                                    b.raw(code);
                                }
                                b.line(format!("__blk = {};", adv(*target)));
                                b.line("continue '__scan;");
                            },
                            "}",
                        );
                    }
                    // Exit.
                    b.line("// exit");
                    b.block(
                        "_ => {",
                        |b| {
                            b.block(
                                format!("if {} > {} && {} {{", v.p, v.p_end, v.is_eof),
                                |b| {
                                    let mut first = true;
                                    for (id, state) in machine.dfa.iter() {
                                        if !state.accept {
                                            continue;
                                        }
                                        let head = if first {
                                            format!("if {} == {} {{", v.cs, id)
                                        } else {
                                            format!("else if {} == {} {{", v.cs, id)
                                        };
                                        first = false;
                                        b.block(
                                            head,
                                            |b| {
                                                for action in &state.eof_actions {
                                                    if !ctx.clean {
                                                        b.line(format!(
                                                            "// action: {}",
                                                            action.name
                                                        ));
                                                    }
                                                    b.raw(&eof_code[action.name.as_str()]);
                                                }
                                                b.line(format!("{} = 0;", v.cs));
                                            },
                                            "}",
                                        );
                                    }
                                },
                                "}",
                            );
                            b.line("break '__scan;");
                        },
                        "}",
                    );
                },
                "}",
            );
        },
        "}",
    );

    Ok(b)
}

/// The guard of one edge test: byte membership plus the precondition
/// conjunction.
fn edge_cond(labels: &ByteSet, preconds: &crate::nfa::PrecondMap, ctx: &CodeGenContext) -> String {
    let mut parts = Vec::new();
    if labels.len() < 256 {
        parts.push(byte_test(labels, ctx));
    }
    for (name, polarity) in preconds {
        match polarity {
            Polarity::Both => {}
            Polarity::True => parts.push(name.clone()),
            Polarity::False => parts.push(format!("!{}", name)),
        }
    }
    if parts.is_empty() {
        "true".to_string()
    } else {
        parts.join(" && ")
    }
}

fn byte_test(labels: &ByteSet, ctx: &CodeGenContext) -> String {
    let pats: Vec<String> = labels
        .iter_ranges()
        .map(|(lo, hi)| {
            if lo == hi {
                byte_literal(lo)
            } else {
                format!("{}..={}", byte_literal(lo), byte_literal(hi))
            }
        })
        .collect();
    format!("matches!({}, {})", ctx.vars.byte, pats.join(" | "))
}
