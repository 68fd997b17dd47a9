//! # Broadcast Integration Tests
//!
//! Drive real worker processes: the `dsm` binary for the happy paths and
//! `/bin/sh` scripts standing in for misbehaving workers.

use dsm::{Coordinator, CoordinatorError, ProcessSupervisor};
use dsm_common::prelude::*;
use dsm_shared_memory::platform::is_process_alive;
use dsm_shared_memory::{ParallelStatus, RegionHandle};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

const DSM: &str = env!("CARGO_BIN_EXE_dsm");

// ─── Helpers ────────────────────────────────────────────────────────

fn config(slots: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        max_worker_processes: slots,
        startup_timeout_ms: 10_000,
        ..CoordinatorConfig::default()
    }
}

fn dsm_coordinator(slots: usize) -> Coordinator<ProcessSupervisor> {
    Coordinator::new(ProcessSupervisor::new(DSM, &config(slots)), config(slots))
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn event_message(event: &Value) -> Option<&str> {
    event["fields"]["message"].as_str()
}

fn assert_all_reaped(supervisor: &ProcessSupervisor) {
    assert_eq!(supervisor.live_workers(), 0);
    for pid in supervisor.spawned_pids() {
        assert!(!is_process_alive(*pid), "worker {pid} still running");
    }
}

// ─── Library surface with real workers ──────────────────────────────

#[test]
fn test_every_worker_reports_the_message() {
    let mut coordinator = dsm_coordinator(8);
    let report = coordinator.broadcast(b"Hello", 3).expect("broadcast");

    assert_eq!(report.reports.len(), 3);
    for (i, record) in report.reports.iter().enumerate() {
        assert_eq!(record.index, i as u32);
        assert_eq!(record.payload, b"Hello");
        assert!(record.attached_workers >= 1);
        assert!(record.attached_workers <= 3);
    }
    let pids: Vec<u32> = report.reports.iter().map(|r| r.pid).collect();
    assert_eq!(pids, coordinator.supervisor().spawned_pids());

    assert_eq!(report.status.status, ParallelStatus::Finished);
    assert_eq!(report.status.attached_workers, 3);
    assert!(!report.region.path().exists(), "region not unlinked");
    assert_all_reaped(coordinator.supervisor());
}

#[test]
fn test_zero_workers_spawns_nothing() {
    let mut coordinator = dsm_coordinator(8);
    let report = coordinator.broadcast(b"Hello", 0).expect("broadcast");
    assert!(report.reports.is_empty());
    assert!(coordinator.supervisor().spawned_pids().is_empty());
}

#[test]
fn test_payload_beyond_queue_capacity() {
    let message: Vec<u8> = (0..MESSAGE_QUEUE_SIZE * 2 + 13)
        .map(|i| b'a' + (i % 26) as u8)
        .collect();
    let mut coordinator = dsm_coordinator(2);
    let report = coordinator.broadcast(&message, 2).expect("broadcast");
    for record in &report.reports {
        assert_eq!(record.payload.len(), message.len());
        assert_eq!(record.payload, message);
    }
}

#[test]
fn test_empty_payload() {
    let mut coordinator = dsm_coordinator(1);
    let report = coordinator.broadcast(b"", 1).expect("broadcast");
    assert_eq!(report.reports[0].payload, Vec::<u8>::new());
}

#[test]
fn test_registration_exhaustion_leaves_no_worker() {
    let mut coordinator = dsm_coordinator(2);
    let err = coordinator.broadcast(b"Hello", 3).unwrap_err();

    assert!(
        matches!(err, CoordinatorError::ConfigurationExhausted { .. }),
        "unexpected {err:?}"
    );
    assert!(err.hint().unwrap().contains("max_worker_processes"));
    assert_eq!(coordinator.supervisor().spawned_pids().len(), 2);
    assert_all_reaped(coordinator.supervisor());
}

#[test]
fn test_worker_crash_surfaces_at_join() {
    let supervisor = ProcessSupervisor::new("/bin/sh", &config(2))
        .with_prefix_args(["-c", "echo dsm-worker-started; exit 3", "sh"]);
    let mut coordinator = Coordinator::new(supervisor, config(2));

    let err = coordinator.broadcast(b"Hello", 2).unwrap_err();
    match err {
        CoordinatorError::WorkerExited { index, status, .. } => {
            assert_eq!(index, 0);
            assert_eq!(status, "exit code 3");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_all_reaped(coordinator.supervisor());
}

#[test]
fn test_worker_that_never_starts() {
    let supervisor =
        ProcessSupervisor::new("/bin/sh", &config(2)).with_prefix_args(["-c", "exit 0", "sh"]);
    let mut coordinator = Coordinator::new(supervisor, config(2));

    let err = coordinator.broadcast(b"Hello", 2).unwrap_err();
    assert!(matches!(err, CoordinatorError::ConfigurationExhausted { .. }));
    assert_all_reaped(coordinator.supervisor());
}

#[test]
fn test_supervisor_trait_is_usable_directly() {
    let mut supervisor = ProcessSupervisor::new(DSM, &config(1));
    // A worker pointed at a missing region fails on its own
    let request = WorkerRequest::new(0xdead_0003, 0);
    let handle = supervisor.register(&request).unwrap();
    assert!(matches!(
        supervisor.wait_started(handle),
        StartOutcome::Started { .. }
    ));
    let ExitOutcome::Stopped(exit) = supervisor.wait_exited(handle).unwrap() else {
        panic!("supervisor died");
    };
    assert_eq!(exit.code, Some(1));
}

// ─── Binary front end ───────────────────────────────────────────────

#[test]
fn test_cli_broadcast() {
    let output = Command::new(DSM)
        .args(["broadcast", "--message", "Hello", "--workers", "3"])
        .output()
        .expect("run dsm");
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "{stdout}");
    for (i, line) in lines.iter().enumerate() {
        assert!(line.starts_with(&format!("worker {i} ")), "{line}");
        assert!(line.ends_with(": Hello"), "{line}");
    }
}

#[test]
fn test_cli_exhaustion_reports_hint() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[coordinator]
max_worker_processes = 2
"#
    )
    .unwrap();
    file.flush().unwrap();

    let output = Command::new(DSM)
        .arg("--config")
        .arg(file.path())
        .args(["broadcast", "-m", "Hello", "-w", "3"])
        .output()
        .expect("run dsm");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("max_worker_processes"), "{stderr}");
}

#[test]
fn test_cli_rejects_invalid_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[coordinator]\nmax_worker_processes = 0\n").unwrap();
    file.flush().unwrap();

    let output = Command::new(DSM)
        .arg("--config")
        .arg(file.path())
        .args(["broadcast", "-m", "Hello", "-w", "1"])
        .output()
        .expect("run dsm");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_cli_honours_configured_log_level() {
    let file = config_file("[shared]\nservice_name = \"dsm-test\"\nlog_level = \"debug\"\n");

    let output = Command::new(DSM)
        .arg("--config")
        .arg(file.path())
        .args(["broadcast", "-m", "Hello", "-w", "1"])
        .env_remove("RUST_LOG")
        .output()
        .expect("run dsm");
    assert!(output.status.success(), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("region laid out"), "{stderr}");
}

#[test]
fn test_termination_during_join_still_unlinks_region() {
    let file = config_file(
        r#"[coordinator]
worker_program = "/bin/sh"
worker_args = ["-c", "echo dsm-worker-started; sleep 2", "sh"]
watch_parent = false
"#,
    );

    let mut child = Command::new(DSM)
        .arg("--config")
        .arg(file.path())
        .args(["--verbose", "--json", "broadcast", "-m", "Hello", "-w", "1"])
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("run dsm");

    let stderr = BufReader::new(child.stderr.take().unwrap());
    let (tx, rx) = mpsc::channel();
    let reader = std::thread::spawn(move || {
        for line in stderr.lines().map_while(Result::ok) {
            if let Ok(event) = serde_json::from_str::<Value>(&line) {
                let _ = tx.send(event);
            }
        }
    });

    // Wait until the join has started with interrupts held
    let mut region = None;
    loop {
        let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) else {
            let _ = child.kill();
            panic!("coordinator never started joining");
        };
        if event_message(&event) == Some("workers launched") {
            let handle = event["fields"]["handle"].as_str().unwrap();
            region = Some(RegionHandle::from_raw(u32::from_str_radix(handle, 16).unwrap()));
        }
        if event_message(&event) == Some("interrupts held") {
            break;
        }
    }
    let region = region.expect("region handle logged at launch");
    assert!(region.path().exists());

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = child.wait().unwrap();
    reader.join().unwrap();

    // The held signal lands only after teardown
    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    let messages: Vec<String> = rx
        .try_iter()
        .filter_map(|event| event_message(&event).map(str::to_string))
        .collect();
    assert!(
        messages.iter().any(|m| m == "region unlinked"),
        "{messages:?}"
    );
    assert!(!region.path().exists(), "region {region} leaked");
}
