//! Recorded API traces
//!
//! A trace is an ordered sequence of concrete API invocations with their
//! recorded arguments and observed return values. Pointer values are recorded
//! as handle tags (`P0x...`) standing in for the address identity; buffer
//! arguments are recorded as base64 payloads; count arguments of length-hint
//! pairs are implied by their paired array and carry no record of their own.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The only trace format version current tooling understands.
pub const TRACE_VERSION: u32 = 1;

/// Reserved prefix marking a recorded value as a handle tag.
pub const HANDLE_TAG_PREFIX: &str = "P0x";

/// The handle tag denoting the null pointer.
pub const NULL_HANDLE_TAG: &str = "P0x0";

/// One recorded argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Int(u64),
    Str(String),
    IntList(Vec<u64>),
    StrList(Vec<String>),
}

impl ArgumentValue {
    /// Handle tag payload, when this value records a pointer identity.
    pub fn as_handle(&self) -> Option<&str> {
        match self {
            ArgumentValue::Str(s) if s.starts_with(HANDLE_TAG_PREFIX) => Some(s),
            _ => None,
        }
    }
}

/// One recorded return value; `None` at the command level means `void`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnValue {
    Bool(bool),
    Int(u64),
    Handle(String),
}

/// A single recorded API invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCommand {
    pub name: String,
    pub arguments: Vec<ArgumentValue>,
    #[serde(rename = "return")]
    pub return_: Option<ReturnValue>,
}

/// A complete recorded trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub version: u32,
    pub commands: Vec<TraceCommand>,
}

impl Trace {
    /// Parse a trace document. The version field is validated by the replay
    /// compiler, not here, so malformed traces can still be inspected.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid trace document")
    }

    /// Load a trace document from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read trace file: {}", path.display()))?;
        Self::from_json(&text)
    }

    /// Serialize to the on-disk document form.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("trace serialization")
    }
}
