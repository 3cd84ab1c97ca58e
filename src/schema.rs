//! Prototype schema for the traced C API
//!
//! The schema is the canonical model shared by the instrumentation generator
//! and the trace replay compiler: the ordered function list, the set of opaque
//! pointer type names, and the length-hint table pairing array-like arguments
//! with the argument carrying their element (or byte) count.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Scalar type names the header parser injects stand-in typedefs for; these
/// never count as opaque pointer candidates.
pub const BUILTIN_SCALARS: [&str; 4] = ["bool", "uint8_t", "uint32_t", "uint64_t"];

/// A single function parameter: its name plus its C type spelling.
///
/// Type spellings are C-like (`"const char *"`, `"uint64_t []"`); a trailing
/// `[]` marks an array parameter whose element type is the spelling with the
/// suffix stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

impl Argument {
    pub fn new(name: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_: type_.into(),
        }
    }

    /// Whether this parameter is an array (`[]`-suffixed) parameter.
    pub fn is_array(&self) -> bool {
        self.type_.ends_with("[]")
    }

    /// Element type of an array parameter (`"const char *[]"` -> `"const char *"`).
    pub fn element_type(&self) -> &str {
        self.type_.strip_suffix("[]").unwrap_or(&self.type_).trim_end()
    }
}

/// A function's return type plus its ownership annotation.
///
/// `owning` marks returns transferring a newly allocated resource to the
/// caller. It is informational: nothing in code generation frees a value just
/// because its producer was owning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnType {
    #[serde(rename = "type")]
    pub type_: String,
    pub owning: bool,
}

impl ReturnType {
    pub fn new(type_: impl Into<String>, owning: bool) -> Self {
        Self {
            type_: type_.into(),
            owning,
        }
    }
}

/// One function prototype of the traced API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub arguments: Vec<Argument>,
    pub return_type: ReturnType,
}

impl Function {
    /// Position and definition of the named argument, if present.
    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }
}

/// Per-function mapping from array-like argument name to its count argument.
pub type LengthHints = BTreeMap<String, BTreeMap<String, String>>;

/// The extracted API schema shared by instrumentation and replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub functions: Vec<Function>,
    pub opaque_pointers: Vec<String>,
    #[serde(default)]
    pub length_hints: LengthHints,
}

/// Built-in length-hint table.
///
/// Hand-maintained domain knowledge about which argument pairs represent
/// array+count in the real signatures; not derivable from the header text.
pub fn default_length_hints() -> LengthHints {
    let table: [(&str, &[(&str, &str)]); 7] = [
        (
            "rp_initialize",
            &[
                ("argv", "argc"),
                ("libraries_path", "libraries_count"),
                ("signals_to_preserve", "signals_to_preserve_count"),
            ],
        ),
        (
            "rp_manager_create",
            &[
                ("pipelines_path", "pipelines_count"),
                ("pipeline_flags", "pipeline_flags_count"),
            ],
        ),
        (
            "rp_manager_create_from_string",
            &[
                ("pipelines", "pipelines_count"),
                ("pipeline_flags", "pipeline_flags_count"),
            ],
        ),
        ("rp_manager_produce_targets", &[("targets", "targets_count")]),
        ("rp_manager_run_analysis", &[("targets", "targets_count")]),
        ("rp_target_create", &[("path_components", "path_components_count")]),
        ("rp_manager_container_deserialize", &[("content", "size")]),
    ];

    table
        .iter()
        .map(|(func, pairs)| {
            let hints = pairs
                .iter()
                .map(|(arg, count)| (arg.to_string(), count.to_string()))
                .collect();
            (func.to_string(), hints)
        })
        .collect()
}

impl Schema {
    /// Build a schema from extraction output, injecting the built-in
    /// length-hint table.
    pub fn new(functions: Vec<Function>, opaque_pointers: Vec<String>) -> Self {
        Self {
            functions,
            opaque_pointers,
            length_hints: default_length_hints(),
        }
    }

    /// Parse a schema document. An absent or empty `length_hints` section is
    /// replaced with the built-in table.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut schema: Schema = serde_json::from_str(text).context("invalid schema document")?;
        if schema.length_hints.is_empty() {
            schema.length_hints = default_length_hints();
        }
        Ok(schema)
    }

    /// Load a schema document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file: {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Serialize to the on-disk document form.
    pub fn to_json(&self) -> String {
        // Serialization of these shapes cannot fail
        serde_json::to_string_pretty(self).expect("schema serialization")
    }

    /// Write the schema document to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json())
            .with_context(|| format!("failed to write schema file: {}", path.display()))
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Count argument paired with `argument`, if `argument` is the array side
    /// of a length-hint pair in `function`.
    pub fn length_hint(&self, function: &str, argument: &str) -> Option<&str> {
        self.length_hints
            .get(function)?
            .get(argument)
            .map(String::as_str)
    }

    /// Whether `argument` is the count side of a length-hint pair in
    /// `function`. Count arguments are implied by their paired array and are
    /// never recorded or logged independently.
    pub fn is_count_argument(&self, function: &str, argument: &str) -> bool {
        self.length_hints
            .get(function)
            .is_some_and(|hints| hints.values().any(|count| count == argument))
    }

    /// Array-side argument whose length hint names `count`, if any.
    pub fn array_for_count(&self, function: &str, count: &str) -> Option<&str> {
        self.length_hints.get(function).and_then(|hints| {
            hints
                .iter()
                .find(|(_, c)| c.as_str() == count)
                .map(|(arg, _)| arg.as_str())
        })
    }

    /// Whether `type_` spells a pointer to one of the schema's opaque types,
    /// optionally `const`-qualified.
    pub fn is_opaque_pointer(&self, type_: &str) -> bool {
        self.opaque_pointers.iter().any(|name| {
            type_ == format!("{name} *") || type_ == format!("const {name} *")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(
            vec![
                Function {
                    name: "rp_manager_create".to_string(),
                    arguments: vec![
                        Argument::new("pipelines_count", "uint64_t"),
                        Argument::new("pipelines_path", "const char *[]"),
                        Argument::new("pipeline_flags_count", "uint64_t"),
                        Argument::new("pipeline_flags", "const char *[]"),
                        Argument::new("execution_directory", "const char *"),
                    ],
                    return_type: ReturnType::new("rp_manager *", true),
                },
                Function {
                    name: "rp_manager_destroy".to_string(),
                    arguments: vec![Argument::new("manager", "rp_manager *")],
                    return_type: ReturnType::new("void", false),
                },
            ],
            vec!["rp_manager".to_string()],
        )
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let schema = sample_schema();
        let text = schema.to_json();
        let parsed = Schema::from_json(&text).unwrap();
        assert_eq!(schema, parsed);
    }

    #[test]
    fn test_missing_length_hints_get_defaults() {
        let text = r#"{"functions": [], "opaque_pointers": []}"#;
        let schema = Schema::from_json(text).unwrap();
        assert_eq!(schema.length_hints, default_length_hints());
        assert_eq!(
            schema.length_hint("rp_manager_container_deserialize", "content"),
            Some("size")
        );
    }

    #[test]
    fn test_explicit_length_hints_are_kept_verbatim() {
        let text = r#"{
            "functions": [],
            "opaque_pointers": [],
            "length_hints": {"f": {"values": "values_count"}}
        }"#;
        let schema = Schema::from_json(text).unwrap();
        assert_eq!(schema.length_hint("f", "values"), Some("values_count"));
        assert!(schema.length_hint("rp_initialize", "argv").is_none());
    }

    #[test]
    fn test_count_argument_detection() {
        let schema = sample_schema();
        assert!(schema.is_count_argument("rp_manager_create", "pipelines_count"));
        assert!(schema.is_count_argument("rp_manager_create", "pipeline_flags_count"));
        assert!(!schema.is_count_argument("rp_manager_create", "pipelines_path"));
        assert_eq!(
            schema.array_for_count("rp_manager_create", "pipelines_count"),
            Some("pipelines_path")
        );
    }

    #[test]
    fn test_opaque_pointer_spellings() {
        let schema = sample_schema();
        assert!(schema.is_opaque_pointer("rp_manager *"));
        assert!(schema.is_opaque_pointer("const rp_manager *"));
        assert!(!schema.is_opaque_pointer("rp_manager"));
        assert!(!schema.is_opaque_pointer("char *"));
    }

    #[test]
    fn test_array_argument_helpers() {
        let arg = Argument::new("paths", "const char *[]");
        assert!(arg.is_array());
        assert_eq!(arg.element_type(), "const char *");

        let arg = Argument::new("sizes", "uint64_t []");
        assert!(arg.is_array());
        assert_eq!(arg.element_type(), "uint64_t");

        let arg = Argument::new("flag", "bool");
        assert!(!arg.is_array());
        assert_eq!(arg.element_type(), "bool");
    }
}
