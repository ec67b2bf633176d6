//! The `lox` command: run a script, start a REPL, or dump compiler stages.
//!
//! Exit codes follow sysexits: 0 on success, 65 for compile errors, 70 for
//! runtime errors, 74 when the script file cannot be read.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use lox_lex::{Scanner, TokenKind};
use lox_runtime::disasm;
use lox_vm::{InterpretError, Vm};

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

/// A bytecode interpreter for the Lox scripting language.
#[derive(Parser, Debug)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A bytecode interpreter for the Lox scripting language", long_about = None)]
struct Cli {
    /// Script to execute; omit to start an interactive session
    script: Option<PathBuf>,

    /// Print the token stream instead of running
    #[arg(long, conflicts_with = "emit_bytecode")]
    emit_tokens: bool,

    /// Compile and disassemble instead of running
    #[arg(long)]
    emit_bytecode: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::from(EXIT_IO_ERROR)
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.script {
        Some(path) => run_file(&path, cli.emit_tokens, cli.emit_bytecode),
        None => {
            repl()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_file(path: &Path, emit_tokens: bool, emit_bytecode: bool) -> anyhow::Result<ExitCode> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = source.len(), "loaded script");

    if emit_tokens {
        emit_token_stream(&source);
        return Ok(ExitCode::SUCCESS);
    }

    let mut vm = Vm::new();
    if emit_bytecode {
        return match vm.compile_only(&source) {
            Ok(function) => {
                let mut out = std::io::stdout();
                disasm::disassemble_function(vm.heap(), function, &mut out)
                    .context("writing disassembly")?;
                Ok(ExitCode::SUCCESS)
            }
            Err(_) => Ok(ExitCode::from(EXIT_COMPILE_ERROR)),
        };
    }

    match vm.interpret(&source) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(InterpretError::Compile) => Ok(ExitCode::from(EXIT_COMPILE_ERROR)),
        Err(InterpretError::Runtime) => Ok(ExitCode::from(EXIT_RUNTIME_ERROR)),
    }
}

fn emit_token_stream(source: &str) {
    let mut scanner = Scanner::new(source);
    loop {
        let token = scanner.next_token();
        println!("{:4} {:?} '{}'", token.line, token.kind, token.lexeme);
        if token.kind == TokenKind::Eof {
            return;
        }
    }
}

/// Line-at-a-time session against one persistent VM, so definitions carry
/// across inputs.
fn repl() -> anyhow::Result<()> {
    println!("Lox {} (ctrl-d to exit)", env!("CARGO_PKG_VERSION"));
    let mut editor = DefaultEditor::new()?;
    let mut vm = Vm::new();

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Diagnostics are already on stderr; the session survives
                // both kinds of error.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
    }
}
