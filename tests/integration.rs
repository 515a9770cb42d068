use std::path::PathBuf;
use std::{env, fs, process::Command};

use regex::Regex;
use test_generator::test_resources;

fn interpreter_command() -> Command {
    // Full path to the built binary, next to the test executable.
    let mut path = env::current_exe()
        .unwrap()
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_owned();
    path.push(env!("CARGO_PKG_NAME"));
    path.set_extension(env::consts::EXE_EXTENSION);
    Command::new(path.into_os_string())
}

struct Expected {
    out: Vec<String>,
    err: Vec<String>,
    runtime_error: bool,
}

fn parse_comments(path: &PathBuf) -> Expected {
    let output_re = Regex::new(r"// expect: ?(.*)").unwrap();
    let error_re = Regex::new(r"// (Error.*)").unwrap();
    let error_line_re = Regex::new(r"// \[line (\d+)\] (Error.*)").unwrap();
    let runtime_error_re = Regex::new(r"// expect runtime error: (.+)").unwrap();

    let mut expected = Expected {
        out: vec![],
        err: vec![],
        runtime_error: false,
    };

    let content = fs::read_to_string(path).unwrap();
    for (i, line) in content.lines().enumerate() {
        if let Some(m) = output_re.captures(line) {
            let s = m.get(1).unwrap().as_str().to_owned();
            expected.out.push(s);
        }
        if let Some(m) = error_line_re.captures(line) {
            let line = m.get(1).unwrap().as_str();
            let msg = m.get(2).unwrap().as_str();
            expected.err.push(format!("[line {}] {}", line, msg));
        } else if let Some(m) = error_re.captures(line) {
            let msg = m.get(1).unwrap().as_str();
            expected.err.push(format!("[line {}] {}", i + 1, msg));
        }
        if let Some(m) = runtime_error_re.captures(line) {
            let msg = m.get(1).unwrap().as_str().to_owned();
            expected.err.push(msg);
            expected.err.push(format!("[line {}]", i + 1));
            expected.runtime_error = true;
        }
    }
    expected
}

fn run_file_test(filename: &str) {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push(filename);
    let expected = parse_comments(&path);

    let output = interpreter_command().arg(&path).output().unwrap();
    let out = String::from_utf8(output.stdout).unwrap();
    let err = String::from_utf8(output.stderr).unwrap();

    let out_lines: Vec<&str> = out.lines().collect();
    assert_eq!(
        expected.out.len(),
        out_lines.len(),
        "stdout line count mismatch for {}:\n{}",
        path.display(),
        out
    );
    for (expected_line, actual) in expected.out.iter().zip(out_lines) {
        assert_eq!(expected_line, actual, "stdout mismatch for {}", path.display());
    }

    // Stderr is matched as an in-order subsequence of prefixes so stack
    // traces may carry extra frames.
    let mut err_lines = err.lines();
    for expected_line in &expected.err {
        let found = err_lines.any(|line| line.starts_with(expected_line.as_str()));
        assert!(
            found,
            "missing stderr line {:?} for {}:\n{}",
            expected_line,
            path.display(),
            err
        );
    }

    let code = output.status.code();
    if expected.runtime_error {
        assert_eq!(code, Some(70), "exit code for {}", path.display());
    } else if !expected.err.is_empty() {
        assert_eq!(code, Some(65), "exit code for {}", path.display());
    } else {
        assert_eq!(code, Some(0), "exit code for {}:\n{}", path.display(), err);
    }
}

#[test_resources("tests/resources/*/*.lox")]
fn lox_file(resource: &str) {
    run_file_test(resource);
}
