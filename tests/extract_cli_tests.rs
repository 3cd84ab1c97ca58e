//! Integration tests for the `extract` subcommand
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use predicates::prelude::*;
use retraza::schema::Schema;
use std::fs;

const HEADER: &str = r#"
#ifndef RP_API_H
#define RP_API_H

typedef struct rp_manager rp_manager;

rp_manager * /* owning */ rp_manager_create(uint64_t pipelines_count,
                                            const char *pipelines_path[],
                                            const char *execution_directory);

void rp_manager_destroy(rp_manager *manager);

#endif
"#;

#[test]
fn test_extract_writes_loadable_schema() {
    let dir = tempfile::tempdir().unwrap();
    let header = dir.path().join("api.h");
    let output = dir.path().join("schema.json");
    fs::write(&header, HEADER).unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("retraza");
    cmd.arg("extract").arg("-i").arg(&header).arg(&output);
    cmd.assert().success();

    let schema = Schema::load(&output).unwrap();
    assert_eq!(schema.functions.len(), 2);
    assert_eq!(schema.functions[0].name, "rp_manager_create");
    assert!(schema.functions[0].return_type.owning);
    assert_eq!(schema.opaque_pointers, ["rp_manager"]);
    // The built-in length-hint table rides along
    assert_eq!(
        schema.length_hint("rp_manager_create", "pipelines_path"),
        Some("pipelines_count")
    );
}

#[test]
fn test_extract_rejects_malformed_header() {
    let dir = tempfile::tempdir().unwrap();
    let header = dir.path().join("api.h");
    let output = dir.path().join("schema.json");
    fs::write(&header, "void rp_broken(uint64_t\n").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("retraza");
    cmd.arg("extract").arg("-i").arg(&header).arg(&output);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unexpected end of input"));
    assert!(!output.exists());
}

#[test]
fn test_extract_requires_a_header() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("retraza");
    cmd.arg("extract").arg("schema.json");
    cmd.assert().failure();
}
