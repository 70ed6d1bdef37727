//! The table generator: dense transition and action matrices plus an
//! equality-chain dispatch loop.
//!
//! Both matrices are row-major, indexed by `(cs - 1) * 256 + byte`, and
//! use the smallest signed integer width that fits their value range.
//! A transition entry holds the next state id, or `-state` as the error
//! sentinel; an action entry holds the dispatch id of the transition's
//! action list (0 for none).
//!
//! Preconditions cannot be encoded in a dense matrix; machines that
//! carry any are rejected and should go through the goto generator.

use indexmap::IndexMap;

use super::{
    action_names, int_type, intern_action_lists, rewrite_fragment, ActionMap, CodeBuilder,
    CodeGenContext, MacroScope,
};
use crate::dfa::Machine;
use crate::CompileError;

pub(crate) fn emit(
    ctx: &CodeGenContext,
    machine: &Machine,
    actions: &ActionMap,
) -> Result<CodeBuilder, CompileError> {
    if machine.has_preconds() {
        return Err(CompileError::PrecondWithTable);
    }
    let v = &ctx.vars;
    let n = machine.state_count();
    let lists = intern_action_lists(machine);

    // Rewrite every referenced fragment up front, once per scope.
    let mut in_loop: IndexMap<&str, String> = IndexMap::new();
    let mut at_eof: IndexMap<&str, String> = IndexMap::new();
    for name in machine.action_names() {
        let fragment = actions.get(name).expect("action map checked");
        in_loop.insert(
            name.as_str(),
            rewrite_fragment(fragment, v, MacroScope::TableAction)?,
        );
        at_eof.insert(name.as_str(), rewrite_fragment(fragment, v, MacroScope::Eof)?);
    }

    // Fill the matrices: error sentinel / no-action by default.
    let mut trans = vec![0i64; n * 256];
    let mut acts = vec![0i64; n * 256];
    for (id, state) in machine.dfa.iter() {
        let row = (id as usize - 1) * 256;
        for cell in &mut trans[row..row + 256] {
            *cell = -(id as i64);
        }
        for e in &state.edges {
            let act_id = if e.actions.is_empty() {
                0
            } else {
                lists.get_index_of(&action_names(&e.actions)).expect("interned") as i64 + 1
            };
            for (lo, hi) in e.labels.iter_ranges() {
                for b in lo..=hi {
                    trans[row + b as usize] = e.target as i64;
                    acts[row + b as usize] = act_id;
                }
            }
        }
    }

    let trans_ty = int_type(-(n as i64), n as i64);
    let acts_ty = int_type(0, lists.len() as i64);

    let mut b = CodeBuilder::default();
    emit_matrix(&mut b, "__TRANS", trans_ty, &trans, n);
    emit_matrix(&mut b, "__ACTS", acts_ty, &acts, n);

    // Main loop: fetch, look up, dispatch, advance.
    let accessor = match &ctx.getbyte {
        Some(f) => format!("{}({}, {})", f, v.mem, v.p),
        None => format!("{}[{} - 1]", v.mem, v.p),
    };
    b.block(
        format!("while {} <= {} && {} > 0 {{", v.p, v.p_end, v.cs),
        |b| {
            b.line(format!("let {}: u8 = {};", v.byte, accessor));
            b.line(format!(
                "let __idx: usize = (({} - 1) as usize) * 256 + {} as usize;",
                v.cs, v.byte
            ));
            b.line(format!("let __act: {} = __ACTS[__idx];", acts_ty));
            b.line(format!("{} = __TRANS[__idx] as isize;", v.cs));
            for (i, names) in lists.iter().enumerate() {
                let head = if i == 0 {
                    format!("if __act == {} {{", i + 1)
                } else {
                    format!("else if __act == {} {{", i + 1)
                };
                b.block(
                    head,
                    |b| {
                        for name in names {
                            if !ctx.clean {
                                b.line(format!("// action: {}", name));
                            }
                            b.raw(&in_loop[name.as_str()]);
                        }
                    },
                    "}",
                );
            }
            b.line(format!("{} += 1;", v.p));
        },
        "}",
    );

    // EOF: an equality chain over the accept states runs the EOF
    // actions and clears `cs`; a negative `cs` backs `p` up onto the
    // offending byte.
    b.block(
        format!(
            "if {} > {} && {} && {} > 0 {{",
            v.p, v.p_end, v.is_eof, v.cs
        ),
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
                                b.line(format!("// action: {}", action.name));
                            }
                            b.raw(&at_eof[action.name.as_str()]);
                        }
                        b.line(format!("{} = 0;", v.cs));
                    },
                    "}",
                );
            }
        },
        "}",
    );
    b.block(
        format!("else if {} < 0 {{", v.cs),
        |b| b.line(format!("{} -= 1;", v.p)),
        "}",
    );

    Ok(b)
}

fn emit_matrix(b: &mut CodeBuilder, name: &str, ty: &str, values: &[i64], states: usize) {
    b.block(
        format!("static {}: [{}; {}] = [", name, ty, values.len()),
        |b| {
            for s in 0..states {
                b.line(format!("// state {}", s + 1));
                for chunk in values[s * 256..(s + 1) * 256].chunks(16) {
                    let row: Vec<String> = chunk.iter().map(|value| value.to_string()).collect();
                    b.line(format!("{},", row.join(", ")));
                }
            }
        },
        "];",
    );
}
