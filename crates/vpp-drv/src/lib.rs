//! vpp-drv - Driver for the vpp preprocessor.
//!
//! The driver owns everything outside the language core: command-line
//! handling, file selection by extension, the worker pool, and output
//! writing. The pipeline per run:
//!
//! ```text
//! inputs ──▶ [select by extension]
//!              │ .src, .dat
//!              ▼
//!        [compile phase]   read + lex + parse, in parallel
//!              │
//!              ▼  (barrier: all compiles finish)
//!        [freeze registry]
//!              │
//!              ▼
//!        [generate phase]  evaluate .src files, in parallel
//!              │
//!              ▼
//!        output files (input path minus extension)
//! ```
//!
//! The two-phase barrier is the only cross-file synchronization:
//! `include` may reference any compiled file's tree, so no evaluation
//! starts until every parse has finished. Within a file, evaluation is
//! strictly sequential.
//!
//! Per-file failures are reported as diagnostics and never abort the
//! run; the process exit code is zero regardless.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use rayon::prelude::*;

use vpp_eval::{visit, Context, Environment, Registry};
use vpp_par::Parser;
use vpp_util::{Handler, Sink};

/// Extension of files that are compiled and generated.
pub const SOURCE_EXTENSION: &str = "src";

/// Extension of header files: compiled so `include` can reach them,
/// never generated.
pub const HEADER_EXTENSION: &str = "dat";

/// Driver configuration: the file list, straight off the command line.
#[derive(Debug, Default)]
pub struct Config {
    pub inputs: Vec<PathBuf>,
}

impl Config {
    /// Build a configuration from command-line arguments (program name
    /// already stripped).
    pub fn from_args(args: impl Iterator<Item = String>) -> Self {
        Self {
            inputs: args.map(PathBuf::from).collect(),
        }
    }
}

/// Run the whole pipeline over the configured inputs.
///
/// Informational messages go to stdout; diagnostics go to `sink`.
pub fn run(config: &Config, sink: &Sink) -> Result<()> {
    println!("vpp version {}.", env!("CARGO_PKG_VERSION"));

    let mut contexts = select_inputs(&config.inputs);

    // Compile phase: every file is read and parsed before any file is
    // evaluated, so the registry is complete when `include` consults it.
    contexts
        .par_iter_mut()
        .for_each(|context| compile_file(context, sink));

    let registry = Registry::new(contexts);

    // Generate phase: evaluate source files against the frozen registry.
    registry
        .contexts()
        .par_iter()
        .for_each(|context| generate_file(context, &registry, sink));

    println!("info: finished");
    Ok(())
}

/// Keep `.src` and `.dat` inputs; warn about and drop everything else.
fn select_inputs(inputs: &[PathBuf]) -> Vec<Context> {
    let mut contexts = Vec::new();
    for path in inputs {
        let extension = path.extension().and_then(|e| e.to_str());
        if matches!(extension, Some(SOURCE_EXTENSION) | Some(HEADER_EXTENSION)) {
            contexts.push(Context::new(path.clone(), Arc::from(""), None));
        } else {
            println!(
                "warning: skipping {} due to file extension; use '.{}' for source files and '.{}' for headers",
                path.display(),
                SOURCE_EXTENSION,
                HEADER_EXTENSION
            );
        }
    }
    contexts
}

/// Compile one file: read it and parse it. A parse failure leaves the
/// context without a tree; an unreadable file is reported the same way
/// any other per-file failure is.
fn compile_file(context: &mut Context, sink: &Sink) {
    if let Err(error) = try_compile(context, sink) {
        sink.write(&format!("{error:#}\n"));
    }
}

fn try_compile(context: &mut Context, sink: &Sink) -> Result<()> {
    let text = fs::read_to_string(&context.path)
        .with_context(|| format!("error: cannot open {}", context.path.display()))?;
    println!("info: compiling {}", context.path.display());
    context.source = Arc::from(text.as_str());
    let handler = Handler::new(sink.clone());
    match Parser::new(&context.path, &context.source, &handler).parse() {
        Ok(ast) => context.ast = Some(ast),
        Err(failure) => sink.write(&format!("{failure}\n")),
    }
    Ok(())
}

/// Generate one file's output, if it is a source file with a tree.
fn generate_file(context: &Context, registry: &Registry, sink: &Sink) {
    let is_source = context
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == SOURCE_EXTENSION)
        .unwrap_or(false);
    if !is_source {
        return;
    }
    if let Err(error) = try_generate(context, registry, sink) {
        sink.write(&format!("{error:#}\n"));
    }
}

fn try_generate(context: &Context, registry: &Registry, sink: &Sink) -> Result<()> {
    let out_path = context.path.with_extension("");
    let Some(ast) = &context.ast else {
        sink.write(&format!(
            "info: skipping {} due to previous error(s)\n",
            out_path.display()
        ));
        return Ok(());
    };
    println!("info: generating {}", out_path.display());
    let mut env = Environment::new(context.path.clone(), sink.clone());
    match visit(&context.path, &context.source, ast, &mut env, registry) {
        Ok(output) => fs::write(&out_path, output)
            .with_context(|| format!("error: cannot create {}", out_path.display()))?,
        Err(failure) => sink.write(&format!("{failure}\n")),
    }
    Ok(())
}
