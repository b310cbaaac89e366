//! Lox interpreter CLI
//!
//! Subcommands for running script files, evaluating one-liners, an
//! interactive shell, and the built-in self-test suite.
//!
//! Exit codes: 0 success, 64 bad usage, 65 compile error, 70 runtime
//! error, 74 I/O error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use lox_core::value::{ErrorKind, Value, format_value};
use lox_runtime::Vm;

mod selftest;

#[derive(ClapParser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox interpreter - run scripts or evaluate source interactively", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lox script file
    #[command(visible_alias = "r")]
    Run {
        /// Input script file
        script: PathBuf,
    },

    /// Start an interactive shell
    #[command(visible_alias = "s")]
    Shell,

    /// Evaluate a source string
    #[command(visible_alias = "e")]
    Eval {
        /// Source text to interpret
        source: String,
    },

    /// Run the built-in interpreter self-tests
    #[command(visible_alias = "t")]
    Test,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 64,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    let code = match cli.command {
        Commands::Run { script } => run_file(&script),
        Commands::Shell => run_shell(),
        Commands::Eval { source } => run_eval(&source),
        Commands::Test => selftest::run(),
        Commands::Completions { shell } => {
            run_completions(shell);
            0
        }
    };
    process::exit(code);
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "lox", &mut io::stdout());
}

fn run_file(script: &Path) -> i32 {
    let source = match fs::read_to_string(script) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {err}", script.display());
            return 74;
        }
    };
    let mut vm = Vm::new();
    exit_code_for(vm.interpret(&source))
}

fn run_eval(source: &str) -> i32 {
    let mut vm = Vm::new();
    exit_code_for(vm.interpret(source))
}

fn run_shell() -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start the shell: {err}");
            return 74;
        }
    };
    let mut vm = Vm::new();
    println!("Welcome to Lox. Type 'q' to quit.");
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim() == "q" {
                    break;
                }
                let _ = editor.add_history_entry(line.as_str());
                let value = vm.interpret(&line);
                println!("=> result: {}", format_value(vm.heap(), value));
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!();
                break;
            }
            Err(err) => {
                eprintln!("Read error: {err}");
                return 74;
            }
        }
    }
    0
}

fn exit_code_for(value: Value) -> i32 {
    match value {
        Value::Error(ErrorKind::Compile) => 65,
        Value::Error(ErrorKind::Runtime) => 70,
        _ => 0,
    }
}
