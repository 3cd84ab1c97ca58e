//! Integration tests for the `instrument` subcommand
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use predicates::prelude::*;
use retraza::schema::{Argument, Function, ReturnType, Schema};
use std::fs;
use std::path::Path;

fn write_schema(path: &Path) {
    let schema = Schema::new(
        vec![
            Function {
                name: "rp_manager_create".to_string(),
                arguments: vec![
                    Argument::new("pipelines_count", "uint64_t"),
                    Argument::new("pipelines_path", "const char *[]"),
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
    );
    schema.save(path).unwrap();
}

const IMPL: &str = "\
// PipelineC implementation

rp_manager *rp_manager_create(uint64_t pipelines_count,
                              const char *pipelines_path[],
                              const char *execution_directory) {
  return NULL;
}

void rp_manager_destroy(rp_manager *manager) {
}
";

#[test]
fn test_instrument_writes_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let schema = dir.path().join("schema.json");
    let template = dir.path().join("runtime.c");
    let input = dir.path().join("impl.c");
    let out = dir.path().join("out");
    write_schema(&schema);
    fs::write(&template, "/* tracing runtime */\n").unwrap();
    fs::write(&input, IMPL).unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("retraza");
    cmd.arg("instrument")
        .arg("-p")
        .arg(&schema)
        .arg("-t")
        .arg(&template)
        .arg("-i")
        .arg(&input)
        .arg(&out);
    cmd.assert().success();

    let header = fs::read_to_string(out.join("TracingPrototypes.h")).unwrap();
    assert!(header.contains("rp_manager * _rp_manager_create("));
    assert!(header.contains("void _rp_manager_destroy(rp_manager * manager);"));

    let wrapper = fs::read_to_string(out.join("TracingWrapper.c")).unwrap();
    assert!(wrapper.starts_with("/* tracing runtime */"));
    assert!(wrapper.contains("trace_begin(\"rp_manager_create\");"));
    assert!(wrapper.contains("return ret;"));

    let renamed = fs::read_to_string(out.join("impl.c")).unwrap();
    assert!(renamed.contains("#include \"TracingPrototypes.h\""));
    assert!(renamed.contains("rp_manager *_rp_manager_create("));
}

#[test]
fn test_instrument_fails_when_definition_missing() {
    let dir = tempfile::tempdir().unwrap();
    let schema = dir.path().join("schema.json");
    let template = dir.path().join("runtime.c");
    let input = dir.path().join("impl.c");
    let out = dir.path().join("out");
    write_schema(&schema);
    fs::write(&template, "/* tracing runtime */\n").unwrap();
    fs::write(&input, "// nothing defined here\n\nstatic int helper;\n").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("retraza");
    cmd.arg("instrument")
        .arg("-p")
        .arg(&schema)
        .arg("-t")
        .arg(&template)
        .arg("-i")
        .arg(&input)
        .arg(&out);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("rp_manager_create"));
    // Nothing gets written on failure
    assert!(!out.join("TracingWrapper.c").exists());
}
