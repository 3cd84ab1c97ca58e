use anyhow::{bail, Context, Result};
use clap::Parser;
use retraza::cli::{Cli, CliCommand};
use retraza::instrument::{Instrumenter, HEADER_FILE_NAME, WRAPPER_FILE_NAME};
use retraza::parser;
use retraza::replay::{build_executable, ReplayCompiler};
use retraza::schema::Schema;
use retraza::trace::Trace;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn run_extract(headers: &[PathBuf], output: &Path) -> Result<()> {
    let texts = headers
        .iter()
        .map(|p| read_source(p))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let schema = parser::extract(&refs)?;
    schema.save(output)
}

fn run_instrument(
    schema: &Path,
    templates: &[PathBuf],
    inputs: &[PathBuf],
    output: &Path,
) -> Result<()> {
    let schema = Schema::load(schema)?;
    let templates = templates
        .iter()
        .map(|p| read_source(p))
        .collect::<Result<Vec<_>>>()?;
    let sources = inputs
        .iter()
        .map(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("input has no file name: {}", p.display()))?;
            Ok((name, read_source(p)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let generated = Instrumenter::new(&schema).instrument(&sources, &templates)?;

    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory: {}", output.display()))?;
    fs::write(output.join(HEADER_FILE_NAME), generated.header)?;
    fs::write(output.join(WRAPPER_FILE_NAME), generated.wrapper)?;
    for (name, text) in generated.renamed {
        fs::write(output.join(name), text)?;
    }
    Ok(())
}

fn run_compile_trace(
    schema: &Path,
    c_file: Option<&Path>,
    executable: Option<&Path>,
    root: &Path,
    trace_file: &Path,
) -> Result<()> {
    if c_file.is_none() && executable.is_none() {
        bail!("either one of --c-file and --executable needs to be specified");
    }

    let schema = Schema::load(schema)?;
    let trace = Trace::load(trace_file)?;
    let source = ReplayCompiler::new(&schema, root).compile(&trace)?;

    // Only write once the whole source synthesized; a malformed trace must
    // not leave a partial file behind
    let temp;
    let c_path: &Path = match c_file {
        Some(path) => {
            fs::write(path, &source)
                .with_context(|| format!("failed to write {}", path.display()))?;
            path
        }
        None => {
            temp = tempfile::Builder::new()
                .suffix(".c")
                .tempfile()
                .context("failed to create temporary C file")?;
            fs::write(temp.path(), &source)?;
            temp.path()
        }
    };

    if let Some(executable) = executable {
        build_executable(c_path, executable)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match &cli.command {
        CliCommand::Extract { headers, output } => run_extract(headers, output),
        CliCommand::Instrument {
            schema,
            templates,
            inputs,
            output,
        } => run_instrument(schema, templates, inputs, output),
        CliCommand::CompileTrace {
            schema,
            c_file,
            executable,
            root,
            trace_file,
        } => run_compile_trace(
            schema,
            c_file.as_deref(),
            executable.as_deref(),
            root,
            trace_file,
        ),
    }
}
