//! Trace replay compilation
//!
//! Turns a recorded trace plus the prototype schema into a single
//! self-contained C source file that re-invokes the real API in trace order
//! and asserts every recorded return value. Pointer identity is preserved by
//! a symbol table mapping handle tags to the synthesized variable currently
//! holding the value; the table lives for exactly one compile pass.
//!
//! Trace order is program order: emission is a single linear pass with no
//! backtracking, which is what makes the replay deterministic.

use crate::instrument::DEFAULT_API_INCLUDE;
use crate::schema::{Argument, Function, Schema};
use crate::trace::{
    ArgumentValue, ReturnValue, Trace, TraceCommand, HANDLE_TAG_PREFIX, NULL_HANDLE_TAG,
    TRACE_VERSION,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Toolchain command template: warnings on, optimization off, debug symbols,
/// linked against the real API's shared libraries. The output path and the
/// generated source are appended.
pub const COMPILE_COMMAND: [&str; 7] = [
    "gcc",
    "-Wall",
    "-lrevngPipelineC",
    "-lrevngSupport",
    "-O0",
    "-g",
    "-o",
];

/// Functions whose return value is run-dependent: the call is still replayed
/// but no assertion is emitted for it.
pub const NON_REPRODUCIBLE_RETURNS: [&str; 1] = ["rp_buffer_size"];

/// Integral return types that get an equality assertion.
const INT_RETURN_TYPES: [&str; 4] = ["uint8_t", "uint32_t", "uint64_t", "int"];

/// Errors produced while compiling a trace into replay source.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("unsupported trace version: {0}")]
    UnsupportedTraceVersion(u32),

    #[error("command {index}: unknown function `{function}`")]
    UnknownFunction { index: usize, function: String },

    #[error(
        "command {index}: `{function}` takes {expected} recorded arguments, trace has {actual}"
    )]
    ArgumentCountMismatch {
        index: usize,
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("command {index}: handle `{tag}` of type `{type_}` was never produced")]
    DanglingHandle {
        index: usize,
        tag: String,
        type_: String,
    },

    #[error("command {index}: argument `{argument}` is not valid base64")]
    InvalidBuffer {
        index: usize,
        argument: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("command {index}: recorded value does not fit argument `{argument}`")]
    ArgumentMismatch { index: usize, argument: String },

    #[error("command {index}: path `{path}` has no root component to patch")]
    UnpatchablePath { index: usize, path: String },

    #[error("command {index}: recorded return does not fit return type `{type_}`")]
    ReturnMismatch { index: usize, type_: String },

    #[error("command {index}: unsupported return type `{type_}`")]
    UnsupportedReturnType { index: usize, type_: String },

    #[error("external compiler exited with status {status}:\n{stderr}")]
    CompilationFailed { status: i32, stderr: String },

    #[error("toolchain invocation failed")]
    Io(#[from] std::io::Error),
}

/// Per-(function, argument) override strategies, consulted before the default
/// materialization rule. These patch values that are only meaningful on the
/// recording machine: installation-relative paths and scratch directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Override {
    /// Rewrite every recorded path relative to the supplied root directory.
    PatchPaths,
    /// Ignore the recorded value; create a fresh temporary directory at run
    /// time and queue it for cleanup.
    TempDir,
}

fn override_for(function: &str, argument: &str) -> Option<Override> {
    match (function, argument) {
        ("rp_initialize", "libraries_path") | ("rp_manager_create", "pipelines_path") => {
            Some(Override::PatchPaths)
        }
        ("rp_manager_create", "execution_directory")
        | ("rp_manager_create_from_string", "execution_directory") => Some(Override::TempDir),
        _ => None,
    }
}

/// A materialized argument: the expression to pass in the call, plus any
/// declarations it needs emitted beforehand.
struct Materialized {
    expr: String,
    decls: Vec<String>,
}

impl Materialized {
    fn plain(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            decls: Vec::new(),
        }
    }
}

/// Compiles one trace at a time against a fixed schema and root directory.
pub struct ReplayCompiler<'a> {
    schema: &'a Schema,
    root: PathBuf,
    api_include: String,
    var_counter: u64,
    /// (handle tag, type with `const ` stripped) -> variable currently
    /// holding the value.
    variables: HashMap<(String, String), String>,
    temp_dirs: Vec<String>,
}

impl<'a> ReplayCompiler<'a> {
    pub fn new(schema: &'a Schema, root: &Path) -> Self {
        Self {
            schema,
            root: root.to_path_buf(),
            api_include: DEFAULT_API_INCLUDE.to_string(),
            var_counter: 0,
            variables: HashMap::new(),
            temp_dirs: Vec::new(),
        }
    }

    /// Override the API header the generated source includes.
    pub fn with_api_include(mut self, include: impl Into<String>) -> Self {
        self.api_include = include.into();
        self
    }

    /// Compile `trace` into a complete C source text. Nothing is written to
    /// disk; the same input always yields byte-identical output.
    pub fn compile(&mut self, trace: &Trace) -> Result<String, ReplayError> {
        if trace.version != TRACE_VERSION {
            return Err(ReplayError::UnsupportedTraceVersion(trace.version));
        }

        self.var_counter = 0;
        self.variables.clear();
        self.temp_dirs.clear();

        let mut blocks = Vec::with_capacity(trace.commands.len());
        for (index, command) in trace.commands.iter().enumerate() {
            blocks.push(self.emit_command(index, command)?);
        }

        let mut out = self.prelude();
        for block in blocks {
            out.push('\n');
            for line in block.lines() {
                if line.is_empty() {
                    out.push('\n');
                } else {
                    out.push_str("  ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out.push('\n');
        for dir in &self.temp_dirs {
            out.push_str(&format!("  remove_directory({dir});\n"));
        }
        out.push_str("  return 0;\n}\n");

        tracing::debug!(commands = trace.commands.len(), "compiled trace to replay source");
        Ok(out)
    }

    fn prelude(&self) -> String {
        format!(
            r#"#define _XOPEN_SOURCE 700

#include <ftw.h>
#include <stdbool.h>
#include <stdint.h>
#include <stdio.h>
#include <stdlib.h>
#include <string.h>
#include <sys/stat.h>
#include <unistd.h>

#include "{include}"

#define replay_assert(expr)                                                    \
  do {{                                                                         \
    if (!(expr)) {{                                                             \
      fprintf(stderr, "%s:%d: assertion failed: %s\n", __FILE__, __LINE__,     \
              #expr);                                                          \
      abort();                                                                 \
    }}                                                                          \
  }} while (0)

static int remove_entry(const char *path, const struct stat *info, int kind,
                        struct FTW *walk) {{
  (void) info;
  (void) kind;
  (void) walk;
  return remove(path);
}}

static void remove_directory(const char *path) {{
  nftw(path, remove_entry, 16, FTW_DEPTH | FTW_PHYS);
}}

int main(void) {{
"#,
            include = self.api_include
        )
    }

    fn next_var(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}{}", self.var_counter);
        self.var_counter += 1;
        name
    }

    fn normalize_type(type_: &str) -> String {
        type_.strip_prefix("const ").unwrap_or(type_).to_string()
    }

    fn lookup_handle(
        &self,
        index: usize,
        tag: &str,
        type_: &str,
    ) -> Result<String, ReplayError> {
        if tag == NULL_HANDLE_TAG {
            return Ok("NULL".to_string());
        }
        self.variables
            .get(&(tag.to_string(), Self::normalize_type(type_)))
            .cloned()
            .ok_or_else(|| ReplayError::DanglingHandle {
                index,
                tag: tag.to_string(),
                type_: type_.to_string(),
            })
    }

    fn emit_command(
        &mut self,
        index: usize,
        command: &TraceCommand,
    ) -> Result<String, ReplayError> {
        let function = self
            .schema
            .function(&command.name)
            .ok_or_else(|| ReplayError::UnknownFunction {
                index,
                function: command.name.clone(),
            })?;

        // Recorded values align with the non-count parameters; count
        // arguments are implied by their paired array.
        let recorded_params: Vec<&Argument> = function
            .arguments
            .iter()
            .filter(|a| !self.schema.is_count_argument(&function.name, &a.name))
            .collect();
        if recorded_params.len() != command.arguments.len() {
            return Err(ReplayError::ArgumentCountMismatch {
                index,
                function: function.name.clone(),
                expected: recorded_params.len(),
                actual: command.arguments.len(),
            });
        }
        let recorded: HashMap<&str, &ArgumentValue> = recorded_params
            .iter()
            .map(|a| a.name.as_str())
            .zip(command.arguments.iter())
            .collect();

        let mut decls = Vec::new();
        let mut call_args = Vec::new();
        for argument in &function.arguments {
            let materialized = if let Some(array) =
                self.schema.array_for_count(&function.name, &argument.name)
            {
                let count = self.recorded_count(index, function, array, &recorded)?;
                Materialized::plain(count.to_string())
            } else {
                let value = recorded[argument.name.as_str()];
                self.materialize(index, function, argument, value)?
            };
            decls.extend(materialized.decls);
            call_args.push(materialized.expr);
        }

        let call = format!("{}({})", function.name, call_args.join(", "));
        let body = self.emit_return(index, function, command, &call)?;

        let mut block = command_comment(command);
        for decl in decls {
            block.push_str(&decl);
            block.push('\n');
        }
        block.push_str(&body);
        Ok(block)
    }

    /// Element count of the array argument paired with a count argument: list
    /// length, or decoded byte length for base64 buffers. The sentinel
    /// terminator appended to generated array literals is never counted.
    fn recorded_count(
        &self,
        index: usize,
        function: &Function,
        array: &str,
        recorded: &HashMap<&str, &ArgumentValue>,
    ) -> Result<usize, ReplayError> {
        let argument = function
            .argument(array)
            .ok_or_else(|| ReplayError::ArgumentMismatch {
                index,
                argument: array.to_string(),
            })?;
        let value = recorded
            .get(array)
            .ok_or_else(|| ReplayError::ArgumentMismatch {
                index,
                argument: array.to_string(),
            })?;
        match value {
            ArgumentValue::IntList(items) => Ok(items.len()),
            ArgumentValue::StrList(items) => Ok(items.len()),
            ArgumentValue::Str(payload) if !argument.is_array() => {
                let bytes = BASE64.decode(payload).map_err(|source| {
                    ReplayError::InvalidBuffer {
                        index,
                        argument: array.to_string(),
                        source,
                    }
                })?;
                Ok(bytes.len())
            }
            _ => Err(ReplayError::ArgumentMismatch {
                index,
                argument: array.to_string(),
            }),
        }
    }

    fn materialize(
        &mut self,
        index: usize,
        function: &Function,
        argument: &Argument,
        value: &ArgumentValue,
    ) -> Result<Materialized, ReplayError> {
        match override_for(&function.name, &argument.name) {
            Some(Override::TempDir) => return Ok(self.workdir_variable()),
            Some(Override::PatchPaths) => {
                let ArgumentValue::StrList(paths) = value else {
                    return Err(ReplayError::ArgumentMismatch {
                        index,
                        argument: argument.name.clone(),
                    });
                };
                let patched = paths
                    .iter()
                    .map(|p| self.patch_path(index, p))
                    .collect::<Result<Vec<_>, _>>()?;
                let patched = ArgumentValue::StrList(patched);
                return self.materialize_default(index, function, argument, &patched);
            }
            None => {}
        }
        self.materialize_default(index, function, argument, value)
    }

    fn materialize_default(
        &mut self,
        index: usize,
        function: &Function,
        argument: &Argument,
        value: &ArgumentValue,
    ) -> Result<Materialized, ReplayError> {
        match value {
            ArgumentValue::Int(n) => Ok(Materialized::plain(n.to_string())),
            ArgumentValue::Str(s) => {
                if s.starts_with(HANDLE_TAG_PREFIX) {
                    let expr = self.lookup_handle(index, s, &argument.type_)?;
                    Ok(Materialized::plain(expr))
                } else {
                    self.temp_string(index, function, argument, s)
                }
            }
            ArgumentValue::IntList(_) | ArgumentValue::StrList(_) => {
                self.temp_list(index, argument, value)
            }
        }
    }

    /// A literal string argument: a base64 byte buffer when the argument has
    /// a length hint, a 0-terminated string otherwise.
    fn temp_string(
        &mut self,
        index: usize,
        function: &Function,
        argument: &Argument,
        payload: &str,
    ) -> Result<Materialized, ReplayError> {
        let name = self.next_var("temp");
        let decl = if self
            .schema
            .length_hint(&function.name, &argument.name)
            .is_some()
        {
            let bytes = BASE64.decode(payload).map_err(|source| {
                ReplayError::InvalidBuffer {
                    index,
                    argument: argument.name.clone(),
                    source,
                }
            })?;
            let initializer = bytes
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("char {name}[{}] = {{ {initializer} }};", bytes.len())
        } else {
            format!("char * {name} = \"{}\";", escape_c_string(payload))
        };
        Ok(Materialized {
            expr: name,
            decls: vec![decl],
        })
    }

    /// An array argument literal. One extra zero/NULL sentinel element is
    /// always appended after the real elements as an out-of-bounds guard; it
    /// is not reflected in any count.
    fn temp_list(
        &mut self,
        index: usize,
        argument: &Argument,
        value: &ArgumentValue,
    ) -> Result<Materialized, ReplayError> {
        if !argument.is_array() {
            return Err(ReplayError::ArgumentMismatch {
                index,
                argument: argument.name.clone(),
            });
        }
        let element_type = argument.element_type().to_string();

        let elements: Vec<String> = if element_type.contains("int") {
            let ArgumentValue::IntList(items) = value else {
                return Err(ReplayError::ArgumentMismatch {
                    index,
                    argument: argument.name.clone(),
                });
            };
            items.iter().map(|n| n.to_string()).collect()
        } else {
            let ArgumentValue::StrList(items) = value else {
                return Err(ReplayError::ArgumentMismatch {
                    index,
                    argument: argument.name.clone(),
                });
            };
            if element_type.contains("char") {
                items
                    .iter()
                    .map(|s| format!("\"{}\"", escape_c_string(s)))
                    .collect()
            } else {
                // A list of handles: every element references an earlier
                // return value
                items
                    .iter()
                    .map(|tag| self.lookup_handle(index, tag, &element_type))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let name = self.next_var("temp");
        let mut initializer = String::new();
        for element in &elements {
            initializer.push_str(element);
            initializer.push_str(", ");
        }
        initializer.push('0');
        let decl = format!(
            "{element_type} {name}[{}] = {{ {initializer} }};",
            elements.len() + 1
        );
        Ok(Materialized {
            expr: name,
            decls: vec![decl],
        })
    }

    /// Fresh run-time scratch directory, queued for removal in the epilogue.
    /// The recorded value is ignored: the directory it names only existed on
    /// the recording machine.
    fn workdir_variable(&mut self) -> Materialized {
        let name = self.next_var("workdir");
        let decls = vec![
            format!("char {name}_template[] = \"/tmp/retraza-workdir-XXXXXX\";"),
            format!("const char * {name} = mkdtemp({name}_template);"),
            format!("replay_assert({name} != NULL);"),
            format!("printf(\"workdir is %s\\n\", {name});"),
        ];
        self.temp_dirs.push(name.clone());
        Materialized {
            expr: name,
            decls,
        }
    }

    /// Rewrite a recorded installation path relative to the supplied root:
    /// everything after the last `root` component is kept.
    fn patch_path(&self, index: usize, path: &str) -> Result<String, ReplayError> {
        let pos = path
            .rfind("root")
            .filter(|pos| *pos > 0)
            .ok_or_else(|| ReplayError::UnpatchablePath {
                index,
                path: path.to_string(),
            })?;
        let suffix = path.get(pos + 5..).unwrap_or("");
        Ok(self.root.join(suffix).to_string_lossy().into_owned())
    }

    /// Bind the call's result and assert the recorded value. Computed after
    /// argument resolution so a returned pointer never aliases an argument
    /// lookup from the same command.
    fn emit_return(
        &mut self,
        index: usize,
        function: &Function,
        command: &TraceCommand,
        call: &str,
    ) -> Result<String, ReplayError> {
        let return_type = function.return_type.type_.as_str();

        if return_type.ends_with('*') {
            let Some(ReturnValue::Handle(tag)) = &command.return_ else {
                return Err(ReplayError::ReturnMismatch {
                    index,
                    type_: return_type.to_string(),
                });
            };
            // A pointer return must record a handle tag, not payload text
            if !tag.starts_with(HANDLE_TAG_PREFIX) {
                return Err(ReplayError::ReturnMismatch {
                    index,
                    type_: return_type.to_string(),
                });
            }
            let name = self.next_var("var");
            self.variables.insert(
                (tag.clone(), Self::normalize_type(return_type)),
                name.clone(),
            );
            // Non-null handles are tracked by identity, never compared by
            // value: the assertion only checks nullness
            let assertion = if tag == NULL_HANDLE_TAG {
                format!("replay_assert({name} == NULL);")
            } else {
                format!("replay_assert({name} != NULL);")
            };
            return Ok(format!("{return_type} {name} = {call};\n{assertion}\n"));
        }

        if return_type == "bool" {
            let Some(ReturnValue::Bool(expected)) = command.return_ else {
                return Err(ReplayError::ReturnMismatch {
                    index,
                    type_: return_type.to_string(),
                });
            };
            let name = self.next_var("check");
            return Ok(format!(
                "bool {name} = {call};\nreplay_assert({name} == {});\n",
                expected as u8
            ));
        }

        if INT_RETURN_TYPES.contains(&return_type) {
            if NON_REPRODUCIBLE_RETURNS.contains(&function.name.as_str()) {
                return Ok(format!("{call};\n"));
            }
            let Some(ReturnValue::Int(expected)) = command.return_ else {
                return Err(ReplayError::ReturnMismatch {
                    index,
                    type_: return_type.to_string(),
                });
            };
            let name = self.next_var("check");
            return Ok(format!(
                "{return_type} {name} = {call};\nreplay_assert({name} == {expected});\n"
            ));
        }

        if return_type == "void" {
            if command.return_.is_some() {
                return Err(ReplayError::ReturnMismatch {
                    index,
                    type_: return_type.to_string(),
                });
            }
            return Ok(format!("{call};\n"));
        }

        Err(ReplayError::UnsupportedReturnType {
            index,
            type_: return_type.to_string(),
        })
    }
}

/// Each command is preceded by its serialized record, as comment lines.
fn command_comment(command: &TraceCommand) -> String {
    let json = serde_json::to_string_pretty(command).expect("command serialization");
    let mut out = String::new();
    for line in json.lines() {
        out.push_str("// ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Escape a recorded payload into a C string literal body.
fn escape_c_string(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Invoke the external toolchain on a generated source file. A single
/// blocking subprocess call; a non-zero exit is surfaced with its stderr.
pub fn build_executable(c_file: &Path, executable: &Path) -> Result<(), ReplayError> {
    let (program, flags) = COMPILE_COMMAND
        .split_first()
        .expect("compile command is never empty");
    tracing::info!(compiler = program, source = %c_file.display(), "invoking external compiler");
    let output = Command::new(program)
        .args(flags)
        .arg(executable)
        .arg(c_file)
        .output()?;
    if !output.status.success() {
        return Err(ReplayError::CompilationFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
