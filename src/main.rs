//! Demo driver: compile a pattern from the command line and dump either
//! the DFA as Graphviz DOT or a generated validator function.

use std::env;
use std::io::{self, Write};
use std::process::ExitCode;

use redfa::{compile, generate_buffer_validator, parse};

enum Mode {
    Dot,
    Table,
    Goto,
}

fn usage() -> ExitCode {
    eprintln!("usage: redfa [--dot | --table | --goto] PATTERN");
    eprintln!();
    eprintln!("  --dot    print the compiled DFA as Graphviz DOT (default)");
    eprintln!("  --table  print a table-driven validator function");
    eprintln!("  --goto   print a direct-threaded validator function");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let (mode, pattern) = match args.as_slice() {
        [pattern] => (Mode::Dot, pattern),
        [flag, pattern] => match flag.as_str() {
            "--dot" => (Mode::Dot, pattern),
            "--table" => (Mode::Table, pattern),
            "--goto" => (Mode::Goto, pattern),
            _ => return usage(),
        },
        _ => return usage(),
    };

    let re = match parse(pattern) {
        Ok(re) => re,
        Err(err) => {
            eprintln!("redfa: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = match mode {
        Mode::Dot => compile(re).map(|machine| {
            let mut out = Vec::new();
            machine.to_dot(&mut out);
            out
        }),
        Mode::Table => generate_buffer_validator("validate", re, false).map(String::into_bytes),
        Mode::Goto => generate_buffer_validator("validate", re, true).map(String::into_bytes),
    };

    match result {
        Ok(output) => {
            io::stdout().write_all(&output).expect("write to stdout");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("redfa: {}", err);
            ExitCode::FAILURE
        }
    }
}
