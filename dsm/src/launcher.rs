//! # Worker Launcher
//!
//! [`ProcessSupervisor`] implements the [`Supervisor`] contract with plain
//! child processes: a fixed number of slots, a startup handshake over the
//! worker's stdout and an overseer pid whose death aborts every wait.
//!
//! [`WorkerLauncher`] drives any supervisor through an all-or-nothing launch
//! of N workers. When one worker cannot be registered or started, the ones
//! already launched are stopped before the error is returned.

use crate::error::CoordinatorError;
use dsm_common::config::CoordinatorConfig;
use dsm_common::consts::WORKER_STARTED_TOKEN;
use dsm_common::supervisor::{
    ExitOutcome, StartOutcome, Supervisor, SupervisorError, WorkerExit, WorkerHandle,
    WorkerRequest,
};
use dsm_shared_memory::RegionHandle;
use dsm_shared_memory::platform::{get_parent_pid, is_process_alive};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::{self, ErrorKind, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// A registered worker process.
#[derive(Debug)]
struct RunningWorker {
    child: Child,
    stdout: Option<ChildStdout>,
    output: Vec<u8>,
    started: bool,
    exit: Option<ExitStatus>,
}

impl RunningWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Move whatever the worker has written so far into `output`.
    fn pump(&mut self) {
        let Some(stdout) = self.stdout.as_mut() else {
            return;
        };
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => {
                    self.stdout = None;
                    return;
                }
                Ok(n) => self.output.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(pid = self.child.id(), "reading worker output failed: {e}");
                    self.stdout = None;
                    return;
                }
            }
        }
    }

    /// Reap the process if it has exited.
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => {
                    warn!(pid = self.child.id(), "waiting on worker failed: {e}");
                    self.exit = Some(ExitStatus::from_raw(-1));
                }
            }
        }
        self.exit
    }

    /// Drop everything up to and including the startup token line.
    fn take_started_token(&mut self) -> bool {
        let token = WORKER_STARTED_TOKEN.as_bytes();
        let mut end = 0;
        for line in self.output.split_inclusive(|b| *b == b'\n') {
            end += line.len();
            if line.strip_suffix(b"\n") == Some(token) {
                self.output.drain(..end);
                self.started = true;
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    worker: Option<RunningWorker>,
}

/// Spawns workers as child processes of the current process.
///
/// Each worker runs `program [prefix args] worker --region-handle H --extra HEX`
/// with stdout piped back for the startup token and diagnostic records and
/// stderr inherited for logs. Every worker leads its own process group.
#[derive(Debug)]
pub struct ProcessSupervisor {
    program: PathBuf,
    prefix_args: Vec<OsString>,
    slots: Vec<Slot>,
    startup_timeout: Duration,
    poll_interval: Duration,
    overseer: Option<u32>,
    spawned: Vec<u32>,
}

impl ProcessSupervisor {
    /// Supervisor launching `program` with the limits of `config`.
    pub fn new(program: impl Into<PathBuf>, config: &CoordinatorConfig) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            slots: (0..config.max_worker_processes)
                .map(|_| Slot::default())
                .collect(),
            startup_timeout: config.startup_timeout(),
            poll_interval: config.poll_interval(),
            overseer: config.watch_parent.then(get_parent_pid),
            spawned: Vec::new(),
        }
    }

    /// Supervisor launching `config.worker_program`, or the running
    /// executable when none is configured.
    pub fn from_config(config: &CoordinatorConfig) -> io::Result<Self> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(program, config).with_prefix_args(&config.worker_args))
    }

    /// Arguments inserted before the `worker` subcommand.
    pub fn with_prefix_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the process whose death aborts every wait.
    pub fn with_overseer(mut self, pid: Option<u32>) -> Self {
        self.overseer = pid;
        self
    }

    /// Pids of every worker spawned so far.
    pub fn spawned_pids(&self) -> &[u32] {
        &self.spawned
    }

    /// Workers registered and not yet reaped.
    pub fn live_workers(&self) -> usize {
        self.slots.iter().filter(|s| s.worker.is_some()).count()
    }

    fn overseer_gone(&self) -> bool {
        self.overseer.is_some_and(|pid| !is_process_alive(pid))
    }

    fn worker_mut(&mut self, handle: WorkerHandle) -> Result<&mut RunningWorker, SupervisorError> {
        self.slots
            .get_mut(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.worker.as_mut())
            .ok_or(SupervisorError::InvalidHandle(handle))
    }

    fn release(&mut self, handle: WorkerHandle) -> Option<RunningWorker> {
        let slot = self.slots.get_mut(handle.slot)?;
        let worker = slot.worker.take();
        slot.generation += 1;
        worker
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn spawn_failed(e: &io::Error) -> SupervisorError {
    SupervisorError::SpawnFailed {
        reason: e.to_string(),
        resource_limit: matches!(e.raw_os_error(), Some(libc::EAGAIN | libc::ENOMEM)),
    }
}

impl Supervisor for ProcessSupervisor {
    fn register(&mut self, request: &WorkerRequest) -> Result<WorkerHandle, SupervisorError> {
        let max = self.slots.len();
        let slot = self
            .slots
            .iter()
            .position(|s| s.worker.is_none())
            .ok_or(SupervisorError::SlotsExhausted { max })?;

        let mut child = Command::new(&self.program)
            .args(&self.prefix_args)
            .arg("worker")
            .arg("--region-handle")
            .arg(request.region_handle.to_string())
            .arg("--extra")
            .arg(request.extra.to_hex())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // Terminal interrupts reach the coordinator only
            .process_group(0)
            .spawn()
            .map_err(|e| spawn_failed(&e))?;

        let stdout = child.stdout.take();
        if let Some(out) = &stdout {
            if let Err(e) = set_nonblocking(out.as_raw_fd()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_failed(&e));
            }
        }

        let pid = child.id();
        self.spawned.push(pid);
        let entry = &mut self.slots[slot];
        entry.worker = Some(RunningWorker {
            child,
            stdout,
            output: Vec::new(),
            started: false,
            exit: None,
        });
        let handle = WorkerHandle {
            slot,
            generation: entry.generation,
        };
        debug!(%handle, pid, index = request.extra.index(), "worker registered");
        Ok(handle)
    }

    fn wait_started(&mut self, handle: WorkerHandle) -> StartOutcome {
        let deadline = Instant::now() + self.startup_timeout;
        let poll = self.poll_interval;

        loop {
            let worker = match self.worker_mut(handle) {
                Ok(worker) => worker,
                Err(e) => return StartOutcome::Failed(e.to_string()),
            };
            worker.pump();
            if worker.started || worker.take_started_token() {
                return StartOutcome::Started { pid: worker.pid() };
            }
            if worker.poll_exit().is_some() {
                // The token may have been written just before exiting
                worker.pump();
                if worker.take_started_token() {
                    return StartOutcome::Started { pid: worker.pid() };
                }
                return StartOutcome::Stopped;
            }

            if self.overseer_gone() {
                return StartOutcome::SupervisorDied;
            }
            if Instant::now() >= deadline {
                return StartOutcome::Failed(format!(
                    "no startup notification within {:?}",
                    self.startup_timeout
                ));
            }
            std::thread::sleep(poll);
        }
    }

    fn wait_exited(&mut self, handle: WorkerHandle) -> Result<ExitOutcome, SupervisorError> {
        let poll = self.poll_interval;

        loop {
            let worker = self.worker_mut(handle)?;
            worker.pump();
            if let Some(status) = worker.poll_exit() {
                worker.pump();
                // A worker that died during startup may still hold the token
                if !worker.started {
                    worker.take_started_token();
                }
                let pid = worker.pid();
                let output = std::mem::take(&mut worker.output);
                self.release(handle);
                let exit = WorkerExit {
                    pid,
                    code: status.code(),
                    signal: status.signal(),
                    output,
                };
                debug!(%handle, pid, status = %exit.describe(), "worker exited");
                return Ok(ExitOutcome::Stopped(exit));
            }

            if self.overseer_gone() {
                return Ok(ExitOutcome::SupervisorDied);
            }
            std::thread::sleep(poll);
        }
    }

    fn terminate(&mut self, handle: WorkerHandle) {
        let Ok(worker) = self.worker_mut(handle) else {
            return;
        };
        if worker.exit.is_some() {
            return;
        }
        let pid = worker.pid();
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => info!(%handle, pid, "terminating worker"),
            Err(nix::Error::ESRCH) => {}
            Err(e) => warn!(%handle, pid, "failed to signal worker: {e}"),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut worker) = slot.worker.take() {
                if worker.exit.is_none() {
                    warn!(pid = worker.pid(), "killing unreaped worker");
                    let _ = worker.child.kill();
                }
                let _ = worker.child.wait();
            }
        }
    }
}

/// A worker confirmed running by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedWorker {
    /// Worker index, also the queue index.
    pub index: usize,
    /// Supervisor handle.
    pub handle: WorkerHandle,
    /// OS process id reported at startup.
    pub pid: u32,
}

/// All-or-nothing launch of a worker group.
pub struct WorkerLauncher;

impl WorkerLauncher {
    /// Register `count` workers on `region`, then wait for each to start.
    ///
    /// On any failure the workers launched so far are stopped and reaped
    /// before the error is returned.
    pub fn launch<S: Supervisor + ?Sized>(
        supervisor: &mut S,
        region: RegionHandle,
        count: usize,
    ) -> Result<Vec<LaunchedWorker>, CoordinatorError> {
        let mut registered = Vec::with_capacity(count);
        for index in 0..count {
            let request = WorkerRequest::new(region.as_raw(), index as u32);
            match supervisor.register(&request) {
                Ok(handle) => registered.push(handle),
                Err(err) => {
                    warn!(worker = index, "worker registration failed: {err}");
                    Self::stop_all(supervisor, &registered);
                    return Err(registration_failed(&err));
                }
            }
        }

        let mut launched = Vec::with_capacity(count);
        for (index, handle) in registered.iter().copied().enumerate() {
            let reason = match supervisor.wait_started(handle) {
                StartOutcome::Started { pid } => {
                    debug!(worker = index, pid, "worker started");
                    launched.push(LaunchedWorker { index, handle, pid });
                    continue;
                }
                StartOutcome::SupervisorDied => {
                    Self::stop_all(supervisor, &registered);
                    return Err(CoordinatorError::SupervisorDied);
                }
                StartOutcome::Stopped => "stopped before startup completed".to_string(),
                StartOutcome::Failed(reason) => reason,
            };
            warn!(worker = index, "worker failed to start: {reason}");
            Self::stop_all(supervisor, &registered);
            return Err(CoordinatorError::ConfigurationExhausted {
                reason: format!("could not start background worker {index}: {reason}"),
                hint: "More details may be available in the worker log.".to_string(),
            });
        }

        info!(count, handle = %region, "workers launched");
        Ok(launched)
    }

    /// Terminate every handle, then wait for each to exit.
    pub fn stop_all<S: Supervisor + ?Sized>(supervisor: &mut S, handles: &[WorkerHandle]) {
        for handle in handles {
            supervisor.terminate(*handle);
        }
        for handle in handles {
            match supervisor.wait_exited(*handle) {
                Ok(ExitOutcome::Stopped(exit)) => {
                    debug!(%handle, pid = exit.pid, status = %exit.describe(), "worker stopped")
                }
                Ok(ExitOutcome::SupervisorDied) => {
                    warn!(%handle, "supervisor died while stopping workers");
                    return;
                }
                Err(e) => warn!(%handle, "cannot wait on worker: {e}"),
            }
        }
    }
}

fn registration_failed(err: &SupervisorError) -> CoordinatorError {
    let hint = if err.is_resource_exhaustion() {
        "You may need to increase max_worker_processes."
    } else {
        "Check that the worker program exists and is executable."
    };
    CoordinatorError::ConfigurationExhausted {
        reason: format!("could not register background process: {err}"),
        hint: hint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm_common::supervisor::WorkerExtra;
    use std::collections::HashSet;

    fn config(slots: usize, timeout_ms: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            max_worker_processes: slots,
            startup_timeout_ms: timeout_ms,
            poll_interval_us: 1_000,
            watch_parent: false,
            ..CoordinatorConfig::default()
        }
    }

    fn shell(script: &str, slots: usize, timeout_ms: u64) -> ProcessSupervisor {
        ProcessSupervisor::new("/bin/sh", &config(slots, timeout_ms))
            .with_prefix_args(["-c", script, "sh"])
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn startup_token_and_output_are_collected() {
        let mut sup = shell("echo dsm-worker-started; echo \"$@\"", 1, 5_000);
        let handle = sup.register(&WorkerRequest::new(7, 3)).unwrap();

        let StartOutcome::Started { pid } = sup.wait_started(handle) else {
            panic!("worker did not start");
        };
        assert_eq!(sup.spawned_pids(), &[pid]);

        let ExitOutcome::Stopped(exit) = sup.wait_exited(handle).unwrap() else {
            panic!("supervisor died");
        };
        assert!(exit.success());
        let text = String::from_utf8(exit.output).unwrap();
        let expected = format!(
            "worker --region-handle 7 --extra {}\n",
            WorkerExtra::from_index(3).to_hex()
        );
        assert_eq!(text, expected);
        assert_eq!(sup.live_workers(), 0);
    }

    #[test]
    fn slots_are_bounded_and_handles_go_stale() {
        let mut sup = shell("echo dsm-worker-started", 1, 5_000);
        let first = sup.register(&WorkerRequest::new(1, 0)).unwrap();
        assert_eq!(
            sup.register(&WorkerRequest::new(1, 1)),
            Err(SupervisorError::SlotsExhausted { max: 1 })
        );

        sup.wait_exited(first).unwrap();
        let second = sup.register(&WorkerRequest::new(1, 1)).unwrap();
        assert_eq!(second.slot, first.slot);
        assert_ne!(second.generation, first.generation);
        assert_eq!(
            sup.wait_exited(first),
            Err(SupervisorError::InvalidHandle(first))
        );
        sup.wait_exited(second).unwrap();
    }

    #[test]
    fn exit_before_token_is_stopped() {
        let mut sup = shell("exit 4", 1, 5_000);
        let handle = sup.register(&WorkerRequest::new(1, 0)).unwrap();
        assert_eq!(sup.wait_started(handle), StartOutcome::Stopped);
        let ExitOutcome::Stopped(exit) = sup.wait_exited(handle).unwrap() else {
            panic!("supervisor died");
        };
        assert_eq!(exit.code, Some(4));
    }

    #[test]
    fn startup_timeout_then_terminate() {
        let mut sup = shell("exec sleep 30", 1, 100);
        let handle = sup.register(&WorkerRequest::new(1, 0)).unwrap();
        assert!(matches!(sup.wait_started(handle), StartOutcome::Failed(_)));

        sup.terminate(handle);
        let ExitOutcome::Stopped(exit) = sup.wait_exited(handle).unwrap() else {
            panic!("supervisor died");
        };
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[test]
    fn dead_overseer_aborts_waits() {
        let mut sup = shell("exec sleep 30", 1, 5_000).with_overseer(Some(dead_pid()));
        let handle = sup.register(&WorkerRequest::new(1, 0)).unwrap();
        assert_eq!(sup.wait_started(handle), StartOutcome::SupervisorDied);
        assert_eq!(
            sup.wait_exited(handle).unwrap(),
            ExitOutcome::SupervisorDied
        );
        let pid = sup.spawned_pids()[0];
        drop(sup);
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn workers_lead_their_own_process_group() {
        use nix::unistd::{getpgid, getpgrp};

        let mut sup = shell("echo dsm-worker-started; exec sleep 30", 1, 5_000);
        let handle = sup.register(&WorkerRequest::new(1, 0)).unwrap();
        let StartOutcome::Started { pid } = sup.wait_started(handle) else {
            panic!("worker did not start");
        };

        let group = getpgid(Some(Pid::from_raw(pid as i32))).unwrap();
        assert_eq!(group.as_raw() as u32, pid);
        assert_ne!(group, getpgrp());

        sup.terminate(handle);
        sup.wait_exited(handle).unwrap();
    }

    #[test]
    fn configured_worker_program_and_args() {
        let settings = CoordinatorConfig {
            worker_program: Some("/bin/sh".into()),
            worker_args: vec![
                "-c".into(),
                "echo dsm-worker-started; echo configured".into(),
                "sh".into(),
            ],
            ..config(1, 5_000)
        };
        let mut sup = ProcessSupervisor::from_config(&settings).unwrap();
        let handle = sup.register(&WorkerRequest::new(1, 0)).unwrap();
        let ExitOutcome::Stopped(exit) = sup.wait_exited(handle).unwrap() else {
            panic!("supervisor died");
        };
        assert_eq!(exit.output, b"configured\n");
    }

    #[test]
    fn missing_program_is_not_resource_exhaustion() {
        let mut sup = ProcessSupervisor::new("/nonexistent/dsm", &config(1, 100));
        let err = sup.register(&WorkerRequest::new(1, 0)).unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
        assert!(!err.is_resource_exhaustion());
        assert_eq!(sup.live_workers(), 0);
    }

    /// In-process supervisor recording every call.
    #[derive(Default)]
    struct ScriptedSupervisor {
        max: usize,
        fail_start: Option<usize>,
        generation: u64,
        live: HashSet<WorkerHandle>,
        terminated: Vec<WorkerHandle>,
        reaped: Vec<WorkerHandle>,
    }

    impl Supervisor for ScriptedSupervisor {
        fn register(&mut self, _request: &WorkerRequest) -> Result<WorkerHandle, SupervisorError> {
            if self.live.len() == self.max {
                return Err(SupervisorError::SlotsExhausted { max: self.max });
            }
            self.generation += 1;
            let handle = WorkerHandle {
                slot: self.live.len(),
                generation: self.generation,
            };
            self.live.insert(handle);
            Ok(handle)
        }

        fn wait_started(&mut self, handle: WorkerHandle) -> StartOutcome {
            if Some(handle.slot) == self.fail_start {
                StartOutcome::Failed("scripted".into())
            } else {
                StartOutcome::Started {
                    pid: 1000 + handle.slot as u32,
                }
            }
        }

        fn wait_exited(&mut self, handle: WorkerHandle) -> Result<ExitOutcome, SupervisorError> {
            if !self.live.remove(&handle) {
                return Err(SupervisorError::InvalidHandle(handle));
            }
            self.reaped.push(handle);
            Ok(ExitOutcome::Stopped(WorkerExit {
                pid: 1000 + handle.slot as u32,
                code: Some(0),
                signal: None,
                output: Vec::new(),
            }))
        }

        fn terminate(&mut self, handle: WorkerHandle) {
            self.terminated.push(handle);
        }
    }

    #[test]
    fn launch_all_workers() {
        let mut sup = ScriptedSupervisor {
            max: 4,
            ..Default::default()
        };
        let workers =
            WorkerLauncher::launch(&mut sup, RegionHandle::from_raw(9), 3).unwrap();
        assert_eq!(workers.len(), 3);
        for (i, worker) in workers.iter().enumerate() {
            assert_eq!(worker.index, i);
            assert_eq!(worker.pid, 1000 + i as u32);
        }
        assert!(sup.terminated.is_empty());
    }

    #[test]
    fn registration_exhaustion_stops_launched_workers() {
        let mut sup = ScriptedSupervisor {
            max: 2,
            ..Default::default()
        };
        let err = WorkerLauncher::launch(&mut sup, RegionHandle::from_raw(9), 3).unwrap_err();
        match &err {
            CoordinatorError::ConfigurationExhausted { hint, .. } => {
                assert!(hint.contains("max_worker_processes"), "{hint}")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sup.terminated.len(), 2);
        assert_eq!(sup.reaped.len(), 2);
        assert!(sup.live.is_empty());
    }

    #[test]
    fn startup_failure_aborts_whole_launch() {
        let mut sup = ScriptedSupervisor {
            max: 4,
            fail_start: Some(1),
            ..Default::default()
        };
        let err = WorkerLauncher::launch(&mut sup, RegionHandle::from_raw(9), 3).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ConfigurationExhausted { ref reason, .. } if reason.contains("worker 1")
        ));
        assert!(sup.live.is_empty());
    }
}
