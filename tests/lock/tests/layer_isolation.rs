//! Layer isolation: the kernel performs no I/O and depends on no I/O crate,
//! and lower layers never depend on higher ones.

use std::fmt::Write;
use std::fs;
use std::path::Path;

/// Forbidden in non-comment kernel source lines.
const KERNEL_FORBIDDEN: &[&str] = &[
    "std::fs",
    "std::net",
    "std::process",
    "std::env",
    "std::thread",
    "reqwest",
    "tokio",
    "tracing",
];

fn walk(dir: &Path, patterns: &[&str], violations: &mut Vec<(String, usize, String)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, patterns, violations);
        } else if path.extension().is_some_and(|e| e == "rs") {
            check_file(&path, patterns, violations);
        }
    }
}

fn check_file(path: &Path, patterns: &[&str], violations: &mut Vec<(String, usize, String)>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*') {
            continue;
        }
        for pattern in patterns {
            if trimmed.contains(pattern) {
                violations.push((path.display().to_string(), line_no + 1, line.to_string()));
            }
        }
    }
}

fn workspace_root() -> &'static Path {
    // lock-tests lives at tests/lock/
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("tests/ exists")
        .parent()
        .expect("workspace root exists")
}

/// Dependency names under `[dependencies]` only.
fn runtime_dependencies(crate_dir: &str) -> Vec<String> {
    let text = fs::read_to_string(workspace_root().join(crate_dir).join("Cargo.toml"))
        .expect("manifest readable");
    let mut in_deps = false;
    let mut deps = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_deps = line == "[dependencies]";
            continue;
        }
        if in_deps && !line.is_empty() && !line.starts_with('#') {
            if let Some((name, _)) = line.split_once('=') {
                deps.push(name.trim().to_string());
            }
        }
    }
    deps
}

#[test]
fn kernel_source_performs_no_io() {
    let mut violations = Vec::new();
    walk(&workspace_root().join("kernel").join("src"), KERNEL_FORBIDDEN, &mut violations);
    if !violations.is_empty() {
        let mut msg = String::from("I/O references found in kernel source:\n");
        for (file, line, content) in &violations {
            let _ = writeln!(msg, "  {file}:{line}: {content}");
        }
        panic!("{msg}");
    }
}

#[test]
fn kernel_has_no_io_dependencies() {
    let deps = runtime_dependencies("kernel");
    for forbidden in ["reqwest", "tokio", "tracing", "tempfile", "walkdir", "rayon"] {
        assert!(
            !deps.iter().any(|d| d == forbidden),
            "kernel depends on {forbidden}: {deps:?}"
        );
    }
    assert!(
        !deps.iter().any(|d| d.starts_with("veribuild-")),
        "kernel depends on another workspace crate: {deps:?}"
    );
}

#[test]
fn dependency_direction_is_kernel_chain_harness_cli() {
    let chain = runtime_dependencies("chain");
    assert!(chain.contains(&"veribuild-kernel".to_string()));
    assert!(!chain.iter().any(|d| d == "veribuild-harness" || d == "veribuild-cli"));

    let harness = runtime_dependencies("harness");
    assert!(!harness.iter().any(|d| d == "veribuild-cli"));
}
