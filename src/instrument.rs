//! Tracing instrumentation generation
//!
//! Consumes the prototype schema plus the implementation sources of the traced
//! API and produces three artifacts: a header of renamed (underscore-prefixed)
//! prototypes, a wrapper translation unit that logs every call under the
//! original name and forwards to the renamed symbol, and renamed copies of the
//! implementation sources. The wrapper links against a hand-written tracing
//! runtime (the template sources) providing the `trace_*` logging calls.

use crate::schema::{Argument, Function, Schema};
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

/// File name of the generated prototypes header; renamed sources include it.
pub const HEADER_FILE_NAME: &str = "TracingPrototypes.h";

/// File name the generated wrapper unit is written under.
pub const WRAPPER_FILE_NAME: &str = "TracingWrapper.c";

/// Header of the traced API itself, included by the generated prototypes.
pub const DEFAULT_API_INCLUDE: &str = "revng/PipelineC/PipelineC.h";

/// Errors produced while generating instrumentation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InstrumentError {
    #[error("don't know how to trace `{type_}` ({function}, argument {argument})")]
    UnknownArgumentKind {
        function: String,
        argument: String,
        type_: String,
    },

    #[error("definition of `{function}` not found in any input source")]
    TargetNotFound { function: String },

    #[error("source `{file}` has no blank line to anchor the tracing include")]
    NoIncludeAnchor { file: String },
}

/// Everything the generator emits for one schema + source set.
#[derive(Debug)]
pub struct Instrumented {
    /// Contents of [`HEADER_FILE_NAME`].
    pub header: String,
    /// Contents of [`WRAPPER_FILE_NAME`].
    pub wrapper: String,
    /// Renamed copy of every input source, keyed by its original file name.
    pub renamed: Vec<(String, String)>,
}

/// Per-argument logging strategy, picked from the type spelling and the
/// length-hint table.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogStrategy {
    Int,
    Bool,
    /// Count side of a length-hint pair: implied, never logged independently.
    Implied { array: String },
    StringList { count: String },
    Buffer { count: String },
    IntList { count: String },
    PtrList { count: String },
    String,
    Ptr,
}

const INT_TYPES: [&str; 3] = ["uint8_t", "uint32_t", "uint64_t"];
const STRING_TYPES: [&str; 2] = ["char *", "const char *"];
const STRING_LIST_TYPES: [&str; 2] = ["char *[]", "const char *[]"];
const INT_LIST_TYPES: [&str; 3] = ["uint8_t []", "uint32_t []", "uint64_t []"];

/// Render a parameter list for a prototype or wrapper definition; array
/// parameters come back out as `elem name[]`.
fn declaration_arguments(arguments: &[Argument]) -> String {
    arguments
        .iter()
        .map(|a| {
            if a.is_array() {
                format!("{} {}[]", a.element_type(), a.name)
            } else {
                format!("{} {}", a.type_, a.name)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct Instrumenter<'a> {
    schema: &'a Schema,
    api_include: String,
}

impl<'a> Instrumenter<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            api_include: DEFAULT_API_INCLUDE.to_string(),
        }
    }

    /// Override the API header the generated prototypes include.
    pub fn with_api_include(mut self, include: impl Into<String>) -> Self {
        self.api_include = include.into();
        self
    }

    /// Generate all artifacts. Nothing is written to disk here; a failure in
    /// any part means no output at all.
    pub fn instrument(
        &self,
        sources: &[(String, String)],
        templates: &[String],
    ) -> Result<Instrumented, InstrumentError> {
        let header = self.prototypes_header();
        let wrapper = self.tracing_wrapper(templates)?;

        let mut renamed = Vec::new();
        let mut found = HashSet::new();
        for (name, text) in sources {
            let (text, defined) = self.rename_definitions(name, text)?;
            found.extend(defined);
            renamed.push((name.clone(), text));
        }
        for function in &self.schema.functions {
            if !found.contains(&function.name) {
                return Err(InstrumentError::TargetNotFound {
                    function: function.name.clone(),
                });
            }
        }

        tracing::debug!(
            functions = self.schema.functions.len(),
            sources = sources.len(),
            "generated tracing instrumentation"
        );
        Ok(Instrumented {
            header,
            wrapper,
            renamed,
        })
    }

    /// The header of renamed prototypes: one `_name` declaration per schema
    /// function, in schema order.
    pub fn prototypes_header(&self) -> String {
        let mut out = String::from("#pragma once\n");
        out.push_str(&format!("#include \"{}\"\n", self.api_include));
        for function in &self.schema.functions {
            out.push_str(&format!(
                "{} _{}({});\n",
                function.return_type.type_,
                function.name,
                declaration_arguments(&function.arguments)
            ));
        }
        out
    }

    /// The wrapper unit: template sources first, then one logging wrapper per
    /// function under its original name.
    pub fn tracing_wrapper(&self, templates: &[String]) -> Result<String, InstrumentError> {
        let mut out = String::new();
        for template in templates {
            out.push_str(template);
            out.push('\n');
        }
        for function in &self.schema.functions {
            out.push_str(&self.wrapper_definition(function)?);
            out.push('\n');
        }
        Ok(out)
    }

    fn wrapper_definition(&self, function: &Function) -> Result<String, InstrumentError> {
        let mut body = String::new();
        body.push_str(&format!("  trace_begin(\"{}\");\n", function.name));
        for argument in &function.arguments {
            match self.classify_argument(function, argument)? {
                LogStrategy::Int => {
                    body.push_str(&format!("  trace_arg_int({});\n", argument.name));
                }
                LogStrategy::Bool => {
                    body.push_str(&format!("  trace_arg_bool({});\n", argument.name));
                }
                LogStrategy::Implied { array } => {
                    body.push_str(&format!(
                        "  /* {} implied by {} */\n",
                        argument.name, array
                    ));
                }
                LogStrategy::StringList { count } => {
                    body.push_str(&format!(
                        "  trace_arg_string_list({}, {});\n",
                        argument.name, count
                    ));
                }
                LogStrategy::Buffer { count } => {
                    body.push_str(&format!(
                        "  trace_arg_buffer({}, {});\n",
                        argument.name, count
                    ));
                }
                LogStrategy::IntList { count } => {
                    body.push_str(&format!(
                        "  trace_arg_int_list({}, {});\n",
                        argument.name, count
                    ));
                }
                LogStrategy::PtrList { count } => {
                    body.push_str(&format!(
                        "  trace_arg_ptr_list({}, {});\n",
                        argument.name, count
                    ));
                }
                LogStrategy::String => {
                    body.push_str(&format!("  trace_arg_string({});\n", argument.name));
                }
                LogStrategy::Ptr => {
                    body.push_str(&format!("  trace_arg_ptr({});\n", argument.name));
                }
            }
        }

        let forwarded = function
            .arguments
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let return_type = function.return_type.type_.as_str();
        if return_type == "void" {
            body.push_str(&format!("  _{}({});\n", function.name, forwarded));
            body.push_str("  trace_ret_void();\n");
        } else {
            body.push_str(&format!(
                "  {} ret = _{}({});\n",
                return_type, function.name, forwarded
            ));
            body.push_str(&format!(
                "  {}(ret);\n",
                self.return_logger(function, return_type)?
            ));
            body.push_str("  return ret;\n");
        }

        Ok(format!(
            "{} {}({}) {{\n{}}}\n",
            return_type,
            function.name,
            declaration_arguments(&function.arguments),
            body
        ))
    }

    /// Logging call for a return value. Returned strings are always logged by
    /// pointer identity: the replay side references them, never recreates them.
    fn return_logger(
        &self,
        function: &Function,
        return_type: &str,
    ) -> Result<&'static str, InstrumentError> {
        if INT_TYPES.contains(&return_type) {
            Ok("trace_ret_int")
        } else if return_type == "bool" {
            Ok("trace_ret_bool")
        } else if STRING_TYPES.contains(&return_type) || self.schema.is_opaque_pointer(return_type)
        {
            Ok("trace_ret_ptr")
        } else {
            Err(InstrumentError::UnknownArgumentKind {
                function: function.name.clone(),
                argument: "return".to_string(),
                type_: return_type.to_string(),
            })
        }
    }

    fn classify_argument(
        &self,
        function: &Function,
        argument: &Argument,
    ) -> Result<LogStrategy, InstrumentError> {
        let type_ = argument.type_.as_str();

        if self.schema.is_count_argument(&function.name, &argument.name) {
            let array = self
                .schema
                .array_for_count(&function.name, &argument.name)
                .unwrap_or_default()
                .to_string();
            return Ok(LogStrategy::Implied { array });
        }

        if INT_TYPES.contains(&type_) {
            return Ok(LogStrategy::Int);
        }
        if type_ == "bool" {
            return Ok(LogStrategy::Bool);
        }

        if let Some(count) = self.schema.length_hint(&function.name, &argument.name) {
            let count = count.to_string();
            return Ok(if STRING_LIST_TYPES.contains(&type_) {
                LogStrategy::StringList { count }
            } else if type_ == "const char *" {
                LogStrategy::Buffer { count }
            } else if INT_LIST_TYPES.contains(&type_) {
                LogStrategy::IntList { count }
            } else {
                LogStrategy::PtrList { count }
            });
        }

        if STRING_TYPES.contains(&type_) {
            // Destroy calls want the original pointer back, not a copy of its
            // textual content
            return Ok(if function.name.ends_with("_destroy") {
                LogStrategy::Ptr
            } else {
                LogStrategy::String
            });
        }

        if self.schema.is_opaque_pointer(type_) {
            return Ok(LogStrategy::Ptr);
        }

        Err(InstrumentError::UnknownArgumentKind {
            function: function.name.clone(),
            argument: argument.name.clone(),
            type_: argument.type_.clone(),
        })
    }

    /// Rename every schema function defined in `text` to its underscore form
    /// and swap the first blank line for the tracing include. Returns the
    /// rewritten text plus the names that were actually found.
    pub fn rename_definitions(
        &self,
        source: &str,
        text: &str,
    ) -> Result<(String, Vec<String>), InstrumentError> {
        let mut out = text.to_string();
        let mut found = Vec::new();
        for function in &self.schema.functions {
            let pattern = format!(r"(?s){}\([^)]*\)\s*\{{", regex::escape(&function.name));
            let re = Regex::new(&pattern).expect("definition regex");
            let start = re.find(&out).map(|m| m.start());
            if let Some(start) = start {
                out.insert(start, '_');
                found.push(function.name.clone());
            }
        }

        let include = format!("#include \"{HEADER_FILE_NAME}\"");
        let mut lines: Vec<&str> = out.lines().collect();
        let anchor = lines.iter().position(|line| line.is_empty()).ok_or_else(|| {
            InstrumentError::NoIncludeAnchor {
                file: source.to_string(),
            }
        })?;
        lines[anchor] = include.as_str();
        let mut rewritten = lines.join("\n");
        rewritten.push('\n');
        Ok((rewritten, found))
    }
}
