//! CLI end-to-end tests: run the `vpp` binary against template files
//! and check outputs, messages and the exit code.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn vpp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_vpp"))
}

#[test]
fn test_banner_and_finish() {
    vpp()
        .assert()
        .success()
        .stdout(predicate::str::contains("vpp version").and(predicate::str::contains("info: finished")));
}

#[test]
fn test_expands_source_file() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("blink.src");
    fs::write(&input, "`let n = 2 + 3\nled<=`n;\n").unwrap();

    vpp()
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("info: compiling"))
        .stdout(predicate::str::contains("info: generating"));

    let output = fs::read_to_string(dir.path().join("blink")).unwrap();
    assert_eq!(output, "led<=5;\n");
}

#[test]
fn test_unknown_extension_warns_and_skips() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("notes.txt");
    fs::write(&input, "hello").unwrap();

    vpp()
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("warning: skipping"))
        .stdout(predicate::str::contains(".src"));
}

#[test]
fn test_diagnostics_go_to_stderr_and_exit_zero() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("broken.src");
    fs::write(&input, "`let = 1\n").unwrap();

    vpp()
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("syntax error"))
        .stderr(predicate::str::contains("compilation failed due to 1 error(s)"));
}

#[test]
fn test_diagnostic_carries_caret_snippet() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("pointy.src");
    fs::write(&input, "`oops\n").unwrap();

    vpp()
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("cannot find 'oops'; identifier undefined"))
        .stderr(predicate::str::contains("`oops"))
        .stderr(predicate::str::contains("^"));
}

#[test]
fn test_include_across_files() {
    let dir = TempDir::new().unwrap();
    let header = dir.path().join("params.dat");
    let source = dir.path().join("core.src");
    fs::write(&header, "`define DEPTH = 16\n").unwrap();
    fs::write(&source, "`include \"params.dat\"\ndepth=`DEPTH\n").unwrap();

    vpp().arg(&source).arg(&header).assert().success();

    let output = fs::read_to_string(dir.path().join("core")).unwrap();
    assert_eq!(output, "depth=16\n");
}
