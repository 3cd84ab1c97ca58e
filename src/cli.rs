//! CLI argument parsing for Retraza

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "retraza")]
#[command(version)]
#[command(about = "Trace capture/replay compiler for a native C API", long_about = None)]
pub struct Cli {
    /// Enable debug logging to stderr
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Extract the prototype schema from C headers
    Extract {
        /// Header file to parse (repeatable)
        #[arg(short = 'i', long = "header", value_name = "HEADER", required = true)]
        headers: Vec<PathBuf>,

        /// Output schema file
        output: PathBuf,
    },

    /// Generate tracing instrumentation for the API implementation
    Instrument {
        /// Prototype schema file
        #[arg(short = 'p', long = "schema", value_name = "SCHEMA")]
        schema: PathBuf,

        /// Tracing runtime source prepended to the generated wrapper (repeatable)
        #[arg(short = 't', long = "template", value_name = "SOURCE", required = true)]
        templates: Vec<PathBuf>,

        /// Implementation source to produce a renamed copy of (repeatable)
        #[arg(short = 'i', long = "input", value_name = "SOURCE", required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory
        output: PathBuf,
    },

    /// Compile a recorded trace into a replay program
    CompileTrace {
        /// Prototype schema file
        #[arg(short = 'p', long = "schema", value_name = "SCHEMA")]
        schema: PathBuf,

        /// Output C file
        #[arg(short = 'c', long = "c-file", value_name = "FILE")]
        c_file: Option<PathBuf>,

        /// Output replay executable
        #[arg(short = 'o', long = "executable", value_name = "FILE")]
        executable: Option<PathBuf>,

        /// Root directory recorded installation paths are rebased onto
        #[arg(long = "root", value_name = "DIR", default_value = ".")]
        root: PathBuf,

        /// Trace file
        trace_file: PathBuf,
    },
}
