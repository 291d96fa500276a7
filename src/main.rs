use clap::Parser;
use kaleidoscope::backend::engine::DEFAULT_MAX_CALL_DEPTH;
use kaleidoscope::{Backend, Config, ErrorPolicy, Outcome, Session};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;
use std::path::PathBuf;
use std::process;

/// Kaleidoscope JIT
#[derive(Parser)]
#[command(name = "kaleidoscope")]
#[command(version)]
#[command(about = "JIT compiler and REPL for the Kaleidoscope language", long_about = None)]
struct Cli {
    /// Source file to run; starts a REPL when omitted
    file: Option<PathBuf>,

    /// Run SOURCE instead of a file
    #[arg(short, long, value_name = "SOURCE", conflicts_with = "file")]
    eval: Option<String>,

    /// Stop at the first error and exit with a failure status
    #[arg(long)]
    strict: bool,

    /// Print generated IR to stderr
    #[arg(long)]
    dump_ir: bool,

    /// Deepest call chain the built-in interpreter runs
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_CALL_DEPTH)]
    max_call_depth: usize,

    /// Compile through LLVM instead of the built-in interpreter
    #[cfg(feature = "llvm")]
    #[arg(long)]
    llvm: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), failure::Error> {
    let config = Config {
        error_policy: if cli.strict {
            ErrorPolicy::Abort
        } else {
            ErrorPolicy::Recover
        },
        dump_ir: cli.dump_ir,
        max_call_depth: cli.max_call_depth,
    };

    #[cfg(feature = "llvm")]
    {
        if cli.llvm {
            let backend = kaleidoscope::backend::llvm::LlvmBackend::new()?;
            return drive(Session::new(backend, config), cli);
        }
    }

    drive(Session::interpreter(config), cli)
}

fn drive<B: Backend>(mut session: Session<B>, cli: &Cli) -> Result<(), failure::Error> {
    if let Some(source) = &cli.eval {
        session.run_with(source, print_outcome)?;
        return Ok(());
    }
    if let Some(path) = &cli.file {
        let source = fs::read_to_string(path)?;
        session.run_with(&source, print_outcome)?;
        return Ok(());
    }
    run_repl(&mut session)
}

/// Lines are buffered until they end on a complete statement, so a
/// definition may span several lines.
fn run_repl<B: Backend>(session: &mut Session<B>) -> Result<(), failure::Error> {
    let mut rl = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Failed to initialize readline: {}", e);
            process::exit(1);
        }
    };

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "ready> " } else { "...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if buffer.is_empty() && line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                buffer.push_str(&line);
                buffer.push('\n');
                if session.is_incomplete(&buffer) {
                    continue;
                }
                let source = std::mem::take(&mut buffer);
                session.run_with(&source, print_outcome)?;
            }
            Err(ReadlineError::Interrupted) => buffer.clear(),
            Err(ReadlineError::Eof) => {
                // Whatever is left gets reported as a parse error.
                session.run_with(&buffer, print_outcome)?;
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }
    Ok(())
}

fn print_outcome(outcome: Outcome) {
    match outcome {
        Outcome::Defined(name) => eprintln!("Read function definition '{}'", name),
        Outcome::Declared(name) => eprintln!("Read extern '{}'", name),
        Outcome::Evaluated(value) => println!("Evaluated to {:.6}", value),
        Outcome::Failed(e) => eprintln!("Error: {}", e),
    }
}
