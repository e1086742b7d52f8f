// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(target_os = "linux")]

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process;

use bin_tests::{build_artifacts, ArtifactsBuild, BuildProfile};
use crashdump::ParsedDump;

fn crash_trigger(profile: BuildProfile) -> PathBuf {
    let trigger = ArtifactsBuild::bin("crash_trigger", profile);
    let artifacts = build_artifacts(&[&trigger]).unwrap();
    artifacts[&trigger].clone()
}

fn run(profile: BuildProfile, fault: &str, dump_dir: &Path, chain: bool) -> process::Output {
    let mut cmd = process::Command::new(crash_trigger(profile));
    cmd.arg(fault)
        .env("CRASHDUMP_DIR", dump_dir)
        .stdin(process::Stdio::null());
    if chain {
        cmd.env("CRASH_TRIGGER_CHAIN", "1");
    }
    bin_tests::timeit!("crash_trigger", { cmd.output().unwrap() })
}

/// Runs the harness without an argument, answering the menu prompt with `input`.
fn run_interactive(input: &str, dump_dir: &Path) -> process::Output {
    let mut child = process::Command::new(crash_trigger(BuildProfile::Debug))
        .env("CRASHDUMP_DIR", dump_dir)
        .stdin(process::Stdio::piped())
        .stdout(process::Stdio::piped())
        .stderr(process::Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

fn dump_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    files
}

/// The single complete dump the crash left behind.
fn single_dump(dir: &Path) -> ParsedDump {
    let files = dump_files(dir);
    assert_eq!(files.len(), 1, "expected exactly one dump, found {files:?}");
    assert!(
        crashdump::receiver::is_complete_dump(&files[0]),
        "unpublished dump {}",
        files[0].display()
    );
    crashdump::read_dump_file(&files[0]).unwrap()
}

fn check_dump(dump: &ParsedDump, signal: i32, pid: u32) {
    assert_eq!(dump.context.signal, signal);
    assert_eq!(dump.context.pid, pid);
    // The harness faults on its main thread.
    assert_eq!(dump.context.tid, pid);
    let faulting = dump.faulting_thread().unwrap();
    assert_eq!(faulting.tid, dump.context.tid);
    assert!(!faulting.frames.is_empty());
    assert!(dump.threads_seen >= 1);
    assert!(
        dump.modules.iter().any(|m| m.path.ends_with("crash_trigger")),
        "the executable is missing from {:?}",
        dump.modules.iter().map(|m| &m.path).collect::<Vec<_>>()
    );
}

fn pid_from_stdout(stdout: &[u8]) -> u32 {
    let stdout = String::from_utf8_lossy(stdout);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("[*] Process ID: "))
        .and_then(|pid| pid.trim().parse().ok())
        .unwrap_or_else(|| panic!("no pid in output:\n{stdout}"))
}

fn test_fault(fault: &str, signal: i32) -> ParsedDump {
    let dir = tempfile::tempdir().unwrap();
    let output = run(BuildProfile::Debug, fault, dir.path(), false);
    assert!(!output.status.success());
    assert_eq!(
        output.status.signal(),
        Some(signal),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dump written: "), "stderr:\n{stderr}");

    let dump = single_dump(dir.path());
    check_dump(&dump, signal, pid_from_stdout(&output.stdout));
    dump
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exit_normally_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(BuildProfile::Debug, "0", dir.path(), false);
    assert!(output.status.success());
    assert!(dump_files(dir.path()).is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_null_pointer_write() {
    let dump = test_fault("1", libc::SIGSEGV);
    assert_eq!(dump.context.fault_address, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_wild_pointer_write() {
    let dump = test_fault("2", libc::SIGSEGV);
    assert_eq!(dump.context.fault_address, 0xDEAD_BEEF);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_abort() {
    test_fault("3", libc::SIGABRT);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stack_overflow() {
    // Only works if the handler runs on the alternate stack.
    test_fault("4", libc::SIGSEGV);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_divide_by_zero() {
    test_fault("5", libc::SIGFPE);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_illegal_instruction() {
    test_fault("6", libc::SIGILL);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_non_numeric_argument_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(BuildProfile::Debug, "nonsense", dir.path(), false);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stdout:\n{stdout}");
    assert!(stdout.contains("[*] Using crash type: 0"), "stdout:\n{stdout}");
    assert!(stdout.contains("Exiting normally"), "stdout:\n{stdout}");
    assert!(dump_files(dir.path()).is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_argument_with_trailing_text_uses_leading_number() {
    test_fault("3rd", libc::SIGABRT);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_out_of_range_selection_falls_back_to_null_write() {
    let dump = test_fault("9", libc::SIGSEGV);
    assert_eq!(dump.context.fault_address, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_interactive_invalid_input_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_interactive("abc\n", dir.path());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1), "stdout:\n{stdout}");
    assert!(stdout.contains("Choice: "), "stdout:\n{stdout}");
    assert!(stdout.contains("[!] Invalid input"), "stdout:\n{stdout}");
    assert!(!stdout.contains("INITIATING CRASH"), "stdout:\n{stdout}");
    assert!(dump_files(dir.path()).is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_interactive_selection() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_interactive("2\n", dir.path());
    assert_eq!(output.status.signal(), Some(libc::SIGSEGV));
    let dump = single_dump(dir.path());
    check_dump(&dump, libc::SIGSEGV, pid_from_stdout(&output.stdout));
    assert_eq!(dump.context.fault_address, 0xDEAD_BEEF);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_progress_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(BuildProfile::Debug, "0", dir.path(), false);
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in [
        "[✓] Crash handler installed",
        "CRASH INFORMATION",
        "[*] Doing some work before crash...",
        "[*] Array sum: 100",
        "[!] INITIATING CRASH",
    ] {
        assert!(stdout.contains(line), "{line:?} missing from:\n{stdout}");
    }
    assert!(pid_from_stdout(&output.stdout) > 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_chains_to_previous_handler() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(BuildProfile::Debug, "1", dir.path(), true);
    let stderr = String::from_utf8_lossy(&output.stderr);
    // The previous handler exits on its own, after the dump was published.
    assert_eq!(output.status.code(), Some(42), "stderr:\n{stderr}");
    assert!(stderr.contains("previous handler ran"), "stderr:\n{stderr}");
    let dump = single_dump(dir.path());
    check_dump(&dump, libc::SIGSEGV, pid_from_stdout(&output.stdout));
}

#[test]
#[ignore] // This test is slow, only run it if explicitly opted in
fn test_null_pointer_write_release() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(BuildProfile::Release, "1", dir.path(), false);
    assert_eq!(output.status.signal(), Some(libc::SIGSEGV));
    let dump = single_dump(dir.path());
    check_dump(&dump, libc::SIGSEGV, pid_from_stdout(&output.stdout));
}
