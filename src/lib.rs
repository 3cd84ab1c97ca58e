//! Retraza - trace capture/replay compiler for a native C API surface
//!
//! This library extracts a prototype schema from C header declarations,
//! generates call-tracing instrumentation for the API's implementation, and
//! compiles recorded traces back into small, deterministically-replayable C
//! programs that re-invoke the real API and assert that every return value
//! matches what was recorded.

pub mod cli;
pub mod instrument;
pub mod parser;
pub mod replay;
pub mod schema;
pub mod trace;
