//! End-to-end CLI tests: scripts on disk, observed output, exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn lox() -> Command {
    Command::cargo_bin("lox").expect("lox binary builds")
}

fn script(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp script");
    file.write_all(contents.as_bytes()).expect("write script");
    file
}

#[test]
fn help_mentions_usage() {
    lox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_prints_crate_version() {
    lox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn runs_a_script_and_prints_output() {
    let file = script("print 1 + 2 * 3;\n");
    lox()
        .arg(file.path())
        .assert()
        .success()
        .stdout("7\n");
}

#[test]
fn programs_span_the_language() {
    let file = script(
        "\
class Greeter {
  init(name) { this.name = name; }
  greet() { return \"hi \" + this.name; }
}
var items = [Greeter(\"a\"), Greeter(\"b\")];
print items[1].greet();
",
    );
    lox().arg(file.path()).assert().success().stdout("hi b\n");
}

#[test]
fn compile_error_exits_65() {
    let file = script("class A < A {}\n");
    lox()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("A class can't inherit from itself."));
}

#[test]
fn runtime_error_exits_70_with_trace() {
    let file = script("fun f() { return ghost; }\nf();\n");
    lox()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(
            predicate::str::contains("Undefined variable 'ghost'.")
                .and(predicate::str::contains("[line 1] in f()"))
                .and(predicate::str::contains("[line 2] in script")),
        );
}

#[test]
fn missing_file_exits_74() {
    lox()
        .arg("definitely/not/a/file.lox")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("could not read"));
}

#[test]
fn emit_tokens_dumps_the_stream() {
    let file = script("var answer = 42;\n");
    lox()
        .arg(file.path())
        .arg("--emit-tokens")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Var")
                .and(predicate::str::contains("Identifier 'answer'"))
                .and(predicate::str::contains("Number '42'"))
                .and(predicate::str::contains("Eof")),
        );
}

#[test]
fn emit_bytecode_disassembles_without_running() {
    let file = script("print \"side effect\";\n");
    lox()
        .arg(file.path())
        .arg("--emit-bytecode")
        .assert()
        .success()
        .stdout(
            // Disassembly only; the program itself must not have executed.
            predicate::str::starts_with("== script ==")
                .and(predicate::str::contains("Print"))
                .and(predicate::str::contains("'side effect'")),
        );
}

#[test]
fn emit_bytecode_covers_nested_functions() {
    let file = script("fun twice(x) { return x * 2; }\nprint twice(4);\n");
    lox()
        .arg(file.path())
        .arg("--emit-bytecode")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("== script ==")
                .and(predicate::str::contains("== fun twice ==")),
        );
}

#[test]
fn emit_bytecode_on_bad_source_exits_65() {
    let file = script("print ;;\n");
    lox()
        .arg(file.path())
        .arg("--emit-bytecode")
        .assert()
        .code(65);
}

#[test]
fn conflicting_emit_flags_are_rejected() {
    let file = script("print 1;\n");
    lox()
        .arg(file.path())
        .arg("--emit-tokens")
        .arg("--emit-bytecode")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
