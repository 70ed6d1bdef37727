//! Pseudomacro rewriting inside action fragments.
//!
//! Action fragments are host Rust code.  A closed set of `@name` /
//! `@name(expr)` placeholders is recognized and substituted before
//! emission; anything else is copied through verbatim.  Arguments of
//! the known one-argument macros are rewritten recursively, so macros
//! can nest (`@relpos(@bufferpos)`).

use crate::codegen::VarNames;
use crate::CompileError;

/// Where a fragment is being emitted; decides the `@escape` expansion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MacroScope {
    /// Action block inside the table generator's dispatch chain.
    TableAction,
    /// Action prologue in the goto generator; `state` is the state
    /// being entered when the actions run.
    GotoAction { state: u32 },
    /// EOF action block (either generator).
    Eof,
    /// Host initialization code; `@escape` is illegal here.
    Init,
}

/// Rewrite every recognized pseudomacro in `src`.
pub(crate) fn rewrite_fragment(
    src: &str,
    vars: &VarNames,
    scope: MacroScope,
) -> Result<String, CompileError> {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let tail = &rest[at + 1..];
        let ident_len = tail
            .char_indices()
            .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
            .map_or(tail.len(), |(i, _)| i);
        if ident_len == 0 {
            out.push('@');
            rest = tail;
            continue;
        }
        let name = &tail[..ident_len];
        let after_name = &tail[ident_len..];
        let (arg, consumed) = if after_name.starts_with('(') {
            let close = matching_paren(after_name)
                .ok_or_else(|| CompileError::MacroMisuse(format!(
                    "unbalanced parentheses in `@{}` argument",
                    name
                )))?;
            (Some(&after_name[1..close]), ident_len + close + 1)
        } else {
            (None, ident_len)
        };
        match expand(name, arg, vars, scope)? {
            Some(expansion) => out.push_str(&expansion),
            // Unknown macros pass through unchanged.
            None => out.push_str(&rest[at..at + 1 + consumed]),
        }
        rest = &tail[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Byte offset of the `)` matching the `(` at offset 0.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn expand(
    name: &str,
    arg: Option<&str>,
    vars: &VarNames,
    scope: MacroScope,
) -> Result<Option<String>, CompileError> {
    let zero_arg = |expansion: String| -> Result<Option<String>, CompileError> {
        match arg {
            None => Ok(Some(expansion)),
            Some(_) => Err(CompileError::MacroMisuse(format!(
                "`@{}` takes no argument",
                name
            ))),
        }
    };
    let one_arg = |f: &dyn Fn(&str) -> String| -> Result<Option<String>, CompileError> {
        match arg {
            Some(raw) => {
                let inner = rewrite_fragment(raw, vars, scope)?;
                Ok(Some(f(&inner)))
            }
            None => Err(CompileError::MacroMisuse(format!(
                "`@{}` requires exactly one argument",
                name
            ))),
        }
    };

    match name {
        "escape" => match scope {
            MacroScope::TableAction => zero_arg(format!("{{ {} += 1; break; }}", vars.p)),
            MacroScope::GotoAction { state } => zero_arg(format!(
                "{{ {} = {}; {} += 1; __blk = 0; continue '__scan; }}",
                vars.cs, state, vars.p
            )),
            MacroScope::Eof => zero_arg("{}".to_string()),
            MacroScope::Init => Err(CompileError::MacroMisuse(
                "`@escape` outside an action".to_string(),
            )),
        },
        "mark" => zero_arg(format!("{}.mark({})", vars.buffer, vars.p)),
        "unmark" => zero_arg(format!("{}.unmark()", vars.buffer)),
        "markpos" => zero_arg(format!("{}.markpos()", vars.buffer)),
        "bufferpos" => zero_arg(format!("{}.bufferpos()", vars.buffer)),
        "setbuffer" => zero_arg(format!("{}.set_bufferpos({})", vars.buffer, vars.p)),
        "relpos" => one_arg(&|x| format!("({} - {}.markpos() + 1)", x, vars.buffer)),
        "abspos" => one_arg(&|x| format!("({} + {}.markpos() - 1)", x, vars.buffer)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> VarNames {
        VarNames::default()
    }

    #[test]
    fn test_buffer_macros_expand() {
        let out =
            rewrite_fragment("@mark; let m = @markpos;", &vars(), MacroScope::TableAction)
                .unwrap();
        assert_eq!(out, "buffer.mark(p); let m = buffer.markpos();");
    }

    #[test]
    fn test_setbuffer_and_bufferpos() {
        let out = rewrite_fragment("@setbuffer; @bufferpos", &vars(), MacroScope::Eof).unwrap();
        assert_eq!(out, "buffer.set_bufferpos(p); buffer.bufferpos()");
    }

    #[test]
    fn test_relpos_abspos_arithmetic() {
        let out = rewrite_fragment("@relpos(p)", &vars(), MacroScope::TableAction).unwrap();
        assert_eq!(out, "(p - buffer.markpos() + 1)");
        let out = rewrite_fragment("@abspos(x)", &vars(), MacroScope::TableAction).unwrap();
        assert_eq!(out, "(x + buffer.markpos() - 1)");
    }

    #[test]
    fn test_macros_nest() {
        let out = rewrite_fragment("@relpos(@bufferpos)", &vars(), MacroScope::TableAction).unwrap();
        assert_eq!(out, "(buffer.bufferpos() - buffer.markpos() + 1)");
    }

    #[test]
    fn test_escape_table_and_goto() {
        let out = rewrite_fragment("@escape", &vars(), MacroScope::TableAction).unwrap();
        assert_eq!(out, "{ p += 1; break; }");
        let out =
            rewrite_fragment("@escape", &vars(), MacroScope::GotoAction { state: 7 }).unwrap();
        assert_eq!(out, "{ cs = 7; p += 1; __blk = 0; continue '__scan; }");
        let out = rewrite_fragment("@escape", &vars(), MacroScope::Eof).unwrap();
        assert_eq!(out, "{}");
    }

    #[test]
    fn test_escape_in_init_is_error() {
        assert!(matches!(
            rewrite_fragment("@escape", &vars(), MacroScope::Init),
            Err(CompileError::MacroMisuse(_))
        ));
    }

    #[test]
    fn test_arity_errors() {
        assert!(matches!(
            rewrite_fragment("@mark(3)", &vars(), MacroScope::TableAction),
            Err(CompileError::MacroMisuse(_))
        ));
        assert!(matches!(
            rewrite_fragment("@relpos", &vars(), MacroScope::TableAction),
            Err(CompileError::MacroMisuse(_))
        ));
    }

    #[test]
    fn test_unknown_macro_passes_through() {
        let out = rewrite_fragment("@custom(p, q) + 1", &vars(), MacroScope::TableAction).unwrap();
        assert_eq!(out, "@custom(p, q) + 1");
        let out = rewrite_fragment("a @ b", &vars(), MacroScope::TableAction).unwrap();
        assert_eq!(out, "a @ b");
    }

    #[test]
    fn test_unbalanced_argument_is_error() {
        assert!(matches!(
            rewrite_fragment("@relpos(p", &vars(), MacroScope::TableAction),
            Err(CompileError::MacroMisuse(_))
        ));
    }

    #[test]
    fn test_renamed_variables_flow_through() {
        let mut v = VarNames::default();
        v.p = "pos".to_string();
        v.buffer = "ring".to_string();
        let out = rewrite_fragment("@mark", &v, MacroScope::TableAction).unwrap();
        assert_eq!(out, "ring.mark(pos)");
    }
}
