use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ember_hir::{HirBuilder, HirModule};
use ember_types::{EffectRowId, OperationSpec, ResumeKind, Type};

static TEMP_NONCE: AtomicU64 = AtomicU64::new(0);

fn ember_bin() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_ember") {
        return PathBuf::from(path);
    }

    let mut exe = std::env::current_exe().expect("test executable path should be known");
    exe.pop();
    if exe.file_name().and_then(|name| name.to_str()) == Some("deps") {
        exe.pop();
    }
    exe.join("ember")
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should move forward")
        .as_nanos();
    let counter = TEMP_NONCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}-{timestamp}-{counter}.{extension}"))
}

fn builder() -> HirBuilder {
    let b = HirBuilder::new();
    b.effect("Tick", Some(1), vec![OperationSpec::new("tick", ResumeKind::Tail)]);
    b.effect("Abort", Some(3), vec![OperationSpec::new("abort", ResumeKind::Resume)]);
    b
}

/// `counter` handles one `tick` and returns 7.
fn counter_module() -> HirModule {
    let b = builder();
    let k = b.continuation("k");
    let body = b.handle(
        b.block(vec![b.perform("tick", vec![]), b.int(7)]),
        vec![b.clause("tick", Some(k), vec![], b.resume(k, b.unit()))],
        Some(b.unit()),
    );
    let mut counter = b.function("counter", vec![], Type::Int, EffectRowId::PURE, body);
    counter.exported = true;
    b.finish(vec![counter])
}

fn broken_module() -> HirModule {
    let b = builder();
    let broken = b.function(
        "broken",
        vec![],
        Type::Unit,
        EffectRowId::PURE,
        b.perform("abort", vec![]),
    );
    b.finish(vec![broken])
}

fn run_ember(prefix: &str, module: &HirModule, args: &[&str]) -> Output {
    let path = temp_path(prefix, "json");
    let json = serde_json::to_string(module).expect("module should serialize");
    std::fs::write(&path, json).expect("temp module write should succeed");

    let output = Command::new(ember_bin())
        .arg(args[0])
        .arg(&path)
        .args(&args[1..])
        .output()
        .expect("ember should execute");

    let _ = std::fs::remove_file(path);
    output
}

#[test]
fn check_accepts_well_typed_module() {
    let output = run_ember("ember-cli-check", &counter_module(), &["check"]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("checked 1 functions"), "got: {stdout}");
}

#[test]
fn check_reports_typing_errors() {
    let output = run_ember("ember-cli-broken", &broken_module(), &["check"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error["), "got: {stderr}");
    assert!(stderr.contains("typing failed"), "got: {stderr}");
}

#[test]
fn check_prints_trace_as_json() {
    let output = run_ember("ember-cli-trace", &counter_module(), &["check", "--trace"]);

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"tail_enforcement\""), "got: {stdout}");
}

#[test]
fn lower_prints_mir_and_stats() {
    let output = run_ember("ember-cli-lower", &counter_module(), &["lower", "--stats"]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("fn counter("), "got: {stdout}");
    assert!(stdout.contains("export \"counter\" = counter$export"), "got: {stdout}");
    assert!(stdout.contains("\"handler_installs\": 1"), "got: {stdout}");
}

#[test]
fn lower_rejects_unknown_target() {
    let output = run_ember(
        "ember-cli-target",
        &counter_module(),
        &["lower", "--target", "x86_64"],
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported target `x86_64`"), "got: {stderr}");
}

#[test]
fn malformed_input_is_reported() {
    let path = temp_path("ember-cli-bad", "json");
    std::fs::write(&path, "{ not json").expect("temp module write should succeed");
    let output = Command::new(ember_bin())
        .arg("check")
        .arg(&path)
        .output()
        .expect("ember should execute");
    let _ = std::fs::remove_file(path);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid HIR module"), "got: {stderr}");
}
