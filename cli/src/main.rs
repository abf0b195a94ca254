use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Once;

use anyhow::{Context, Result};
use clap::Parser;

use lama_core::bytecode::{BytecodeFile, read_bytecode_file};
use lama_core::idiom;
use lama_core::rt::Heap;
use lama_core::vm::{VerificationMode, interpret_file};


static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "lama::vm=trace,lama_core=info,lama_cli=info";

#[derive(Debug, Parser)]
#[command(
    name = "lama-interpreter",
    version,
    about = "Interpreter and idiom analyzer for Lama bytecode",
    long_about = None
)]
struct CliArgs {
    /// Statically verify the bytecode before execution; falls back to
    /// dynamic checks when the code cannot be fully verified
    #[arg(short = 's')]
    static_verification: bool,

    /// Report instruction idiom frequencies instead of executing
    #[arg(short = 'i')]
    idiom_analysis: bool,

    /// Bytecode file to load
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }

    !(trimmed.eq_ignore_ascii_case("0")
        || trimmed.eq_ignore_ascii_case("false")
        || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Install a stderr tracing subscriber when `LAMA_TRACE` asks for one.
fn maybe_init_trace() {
    let raw = match std::env::var("LAMA_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };

    if !env_toggle_enabled(&raw) {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter_expr = filter_expr_from(&raw).or_else(|| std::env::var("RUST_LOG").ok());
        let builder = fmt().with_writer(io::stderr);
        let builder = match filter_expr.and_then(|expr| EnvFilter::try_new(expr).ok()) {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };

        let _ = builder.try_init();
    });
}

fn run_idiom_analysis(file: &BytecodeFile) -> Result<()> {
    let report = idiom::analyze(file)
        .with_context(|| format!("idiom analysis failed for {}", file.path().display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for entry in report {
        writeln!(out, "{}\t{}", entry.count, idiom::render_span(file, entry.span)?)?;
    }

    Ok(())
}

fn run_interpreter(file: &mut BytecodeFile, mode: VerificationMode) -> Result<()> {
    let mut heap = Heap::new();

    interpret_file(file, &mut heap, mode)
}

fn main() {
    maybe_init_trace();

    let args = CliArgs::parse();

    let mut file = match read_bytecode_file(&args.file) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("{}: {}", args.file.display(), err);
            process::exit(err.exit_code());
        }
    };

    let mode = if args.static_verification {
        VerificationMode::Static
    } else {
        VerificationMode::Dynamic
    };

    let outcome = if args.idiom_analysis {
        run_idiom_analysis(&file)
    } else {
        run_interpreter(&mut file, mode)
    };

    if let Err(err) = outcome {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}
