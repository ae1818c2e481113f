//! Backend process supervision: locate a launch command, start the process,
//! watch its output for the ready marker, and stop it on shutdown.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use aide_config::{BackendConfig, LaunchMode};

use crate::error::SupervisorError;
use crate::events::{EventBus, ProcessEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

/// Snapshot of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProcess {
    pub command: String,
    pub working_dir: PathBuf,
    pub state: ProcessState,
    /// Set while the process is alive.
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// Resolved command line for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchPlan {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

enum StopMode {
    Graceful(Duration),
    Kill,
}

struct ProcessControl {
    stop_tx: oneshot::Sender<StopMode>,
    monitor: JoinHandle<()>,
}

/// State shared with the monitor and output reader tasks.
struct Shared {
    state: watch::Sender<BackendProcess>,
    bus: EventBus,
}

impl Shared {
    fn transition(&self, state: ProcessState, message: impl Into<String>, exit_code: Option<i32>) {
        self.bus.backend.publish(ProcessEvent {
            state,
            message: message.into(),
            exit_code,
        });
        self.state.send_modify(|process| {
            process.state = state;
            if exit_code.is_some() {
                process.exit_code = exit_code;
            }
        });
    }

    fn current(&self) -> ProcessState {
        self.state.borrow().state
    }

    fn on_stdout(&self, line: &str, ready_marker: &str) {
        if line.trim() == ready_marker {
            if matches!(self.current(), ProcessState::Starting | ProcessState::Errored) {
                info!("backend ready");
                self.transition(ProcessState::Running, "backend ready", None);
            }
        } else {
            debug!(target: "aide::backend", "{line}");
        }
    }

    /// Any stderr output is reported as an error; the process may keep running.
    fn on_stderr(&self, line: &str) {
        warn!(target: "aide::backend", "{line}");
        if matches!(
            self.current(),
            ProcessState::Starting | ProcessState::Running | ProcessState::Errored
        ) {
            self.transition(ProcessState::Errored, line, None);
        }
    }

    fn on_exit(&self, status: std::io::Result<ExitStatus>, stop_requested: bool) {
        self.state.send_modify(|process| process.pid = None);
        match status {
            Ok(status) if status.success() || stop_requested => {
                info!(?status, "backend stopped");
                self.transition(ProcessState::Stopped, "backend stopped", status.code());
            }
            Ok(status) => {
                error!(?status, "backend exited unexpectedly");
                self.transition(
                    ProcessState::Errored,
                    format!("backend exited with {status}"),
                    status.code(),
                );
            }
            Err(err) => {
                error!(?err, "failed to wait on backend");
                self.transition(ProcessState::Errored, err.to_string(), None);
            }
        }
    }
}

pub struct BackendSupervisor {
    config: BackendConfig,
    shared: Arc<Shared>,
    control: Mutex<Option<ProcessControl>>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig, bus: EventBus) -> Self {
        let (state, _) = watch::channel(BackendProcess {
            command: String::new(),
            working_dir: PathBuf::new(),
            state: ProcessState::NotStarted,
            pid: None,
            exit_code: None,
        });
        Self {
            config,
            shared: Arc::new(Shared { state, bus }),
            control: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> BackendProcess {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendProcess> {
        self.shared.state.subscribe()
    }

    /// Work out what to run without starting anything.
    pub async fn resolve_launch(&self) -> Result<LaunchPlan, SupervisorError> {
        match self.config.launch {
            LaunchMode::Embedded => {
                let program = std::env::current_exe().map_err(|source| {
                    SupervisorError::ProcessLaunchFailed {
                        command: "current executable".to_string(),
                        source,
                    }
                })?;
                let working_dir = std::env::current_dir().map_err(|source| {
                    SupervisorError::ProcessLaunchFailed {
                        command: program.display().to_string(),
                        source,
                    }
                })?;
                Ok(LaunchPlan {
                    program,
                    args: vec!["serve".to_string()],
                    working_dir,
                })
            }
            LaunchMode::Script => {
                let timeout = Duration::from_millis(self.config.probe_timeout_ms);
                let runtime = probe_runtime(&self.config.runtime_candidates, timeout)
                    .await
                    .ok_or_else(|| SupervisorError::RuntimeNotFound {
                        candidates: self.config.runtime_candidates.clone(),
                    })?;

                let script = PathBuf::from(&self.config.script_path);
                if !script.is_file() {
                    return Err(SupervisorError::ScriptNotFound(script));
                }
                let script = std::fs::canonicalize(&script).map_err(|_| {
                    SupervisorError::ScriptNotFound(script.clone())
                })?;
                let working_dir = script
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));

                Ok(LaunchPlan {
                    program: PathBuf::from(runtime),
                    args: vec![script.display().to_string()],
                    working_dir,
                })
            }
        }
    }

    /// Start the backend. A no-op while a previous process is still alive.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut control = self.control.lock().await;
        if let Some(existing) = control.as_ref() {
            if !existing.monitor.is_finished() {
                debug!(state = ?self.shared.current(), "backend already started");
                return Ok(());
            }
        }

        let plan = match self.resolve_launch().await {
            Ok(plan) => plan,
            Err(err) => {
                error!(%err, "cannot launch backend");
                self.shared
                    .transition(ProcessState::Errored, err.to_string(), None);
                return Err(err);
            }
        };
        let command = plan.display();

        self.shared.state.send_modify(|process| {
            process.command = command.clone();
            process.working_dir = plan.working_dir.clone();
            process.exit_code = None;
            process.pid = None;
        });
        self.shared
            .transition(ProcessState::Starting, format!("starting {command}"), None);
        info!(%command, cwd = %plan.working_dir.display(), "starting backend");

        let spawned = Command::new(&plan.program)
            .args(&plan.args)
            .current_dir(&plan.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::ProcessLaunchFailed { command, source };
                error!(%err, "backend launch failed");
                self.shared
                    .transition(ProcessState::Errored, err.to_string(), None);
                return Err(err);
            }
        };

        let pid = child.id();
        self.shared.state.send_modify(|process| process.pid = pid);

        if let Some(stdout) = child.stdout.take() {
            let shared = self.shared.clone();
            let marker = self.config.ready_marker.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    shared.on_stdout(&line, &marker);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    shared.on_stderr(&line);
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, stop_rx, self.shared.clone()));
        *control = Some(ProcessControl { stop_tx, monitor });
        Ok(())
    }

    /// Stop the backend. Graceful stops send SIGTERM and force-kill after the
    /// configured grace period. Idempotent.
    pub async fn stop(&self, graceful: bool) {
        let Some(control) = self.control.lock().await.take() else {
            debug!("no backend process to stop");
            return;
        };
        let mode = if graceful {
            StopMode::Graceful(Duration::from_millis(self.config.stop_grace_ms))
        } else {
            StopMode::Kill
        };
        let _ = control.stop_tx.send(mode);
        if let Err(err) = control.monitor.await {
            warn!(?err, "backend monitor task failed");
        }
    }

    /// Wait for the ready marker. Fails early if the process exits first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let mut rx = self.shared.state.subscribe();
        let wait = async {
            loop {
                {
                    let process = rx.borrow_and_update();
                    match process.state {
                        ProcessState::Running => return Ok(()),
                        ProcessState::Stopped => {
                            return Err(SupervisorError::NotReady("backend stopped".into()));
                        }
                        ProcessState::Errored if process.pid.is_none() => {
                            return Err(SupervisorError::NotReady(match process.exit_code {
                                Some(code) => format!("backend exited with code {code}"),
                                None => "backend failed to start".to_string(),
                            }));
                        }
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(SupervisorError::NotReady("supervisor dropped".into()));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::NotReady(format!(
                "no ready signal within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

async fn monitor(mut child: Child, stop_rx: oneshot::Receiver<StopMode>, shared: Arc<Shared>) {
    let (status, stop_requested) = tokio::select! {
        status = child.wait() => (status, false),
        mode = stop_rx => {
            shared.transition(ProcessState::Stopping, "stopping backend", None);
            let status = match mode {
                Ok(StopMode::Graceful(grace)) => {
                    terminate(&mut child);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(?grace, "backend ignored SIGTERM; killing");
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
                Ok(StopMode::Kill) | Err(_) => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            (status, true)
        }
    };
    shared.on_exit(status, stop_requested);
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we spawned and have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// First candidate whose `--version` succeeds within `timeout`.
async fn probe_runtime(candidates: &[String], timeout: Duration) -> Option<String> {
    for candidate in candidates {
        let probe = Command::new(candidate)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(status)) if status.success() => {
                debug!(candidate, "runtime found");
                return Some(candidate.clone());
            }
            Ok(Ok(status)) => debug!(candidate, ?status, "runtime probe failed"),
            Ok(Err(err)) => debug!(candidate, ?err, "runtime not runnable"),
            Err(_) => debug!(candidate, "runtime probe timed out"),
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn script_config(dir: &TempDir, body: &str) -> BackendConfig {
        let script = dir.path().join("backend.sh");
        fs::write(&script, body).unwrap();
        BackendConfig {
            launch: LaunchMode::Script,
            runtime_candidates: vec!["bash".to_string()],
            script_path: script.display().to_string(),
            ready_marker: "READY".to_string(),
            stop_grace_ms: 300,
            ..BackendConfig::default()
        }
    }

    async fn wait_for_state(
        supervisor: &BackendSupervisor,
        matches: impl Fn(&BackendProcess) -> bool,
    ) -> BackendProcess {
        let mut rx = supervisor.subscribe();
        let wait = async {
            loop {
                {
                    let process = rx.borrow_and_update();
                    if matches(&process) {
                        return process.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("state never reached")
    }

    // ── Launch resolution ────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_runtime_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = script_config(&dir, "echo READY\n");
        config.runtime_candidates = vec!["aide-no-such-runtime".to_string()];

        let bus = EventBus::new();
        let mut events = bus.backend.subscribe();
        let supervisor = BackendSupervisor::new(config, bus);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::RuntimeNotFound { .. }));
        assert_eq!(supervisor.snapshot().state, ProcessState::Errored);
        assert_eq!(events.recv().await.unwrap().state, ProcessState::Errored);
    }

    #[tokio::test]
    async fn missing_script_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = script_config(&dir, "");
        config.script_path = dir.path().join("absent.sh").display().to_string();

        let supervisor = BackendSupervisor::new(config, EventBus::new());
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ScriptNotFound(_)));
    }

    #[tokio::test]
    async fn script_runs_from_its_own_directory() {
        let dir = TempDir::new().unwrap();
        let supervisor = BackendSupervisor::new(script_config(&dir, "echo READY\n"), EventBus::new());
        let plan = supervisor.resolve_launch().await.unwrap();
        assert_eq!(plan.program, PathBuf::from("bash"));
        assert_eq!(plan.working_dir, fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn embedded_launch_runs_current_exe_with_serve() {
        let supervisor = BackendSupervisor::new(BackendConfig::default(), EventBus::new());
        let plan = supervisor.resolve_launch().await.unwrap();
        assert_eq!(plan.program, std::env::current_exe().unwrap());
        assert_eq!(plan.args, vec!["serve".to_string()]);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ready_marker_then_graceful_stop() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "echo booting\necho READY\nexec sleep 30\n");
        let supervisor = BackendSupervisor::new(config, EventBus::new());

        supervisor.start().await.unwrap();
        supervisor
            .wait_until_ready(Duration::from_secs(10))
            .await
            .unwrap();
        let running = supervisor.snapshot();
        assert_eq!(running.state, ProcessState::Running);
        assert!(running.pid.is_some());

        // Second start while running keeps the same process.
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.snapshot().pid, running.pid);

        supervisor.stop(true).await;
        let stopped = supervisor.snapshot();
        assert_eq!(stopped.state, ProcessState::Stopped);
        assert!(stopped.pid.is_none());

        supervisor.stop(true).await;
        assert_eq!(supervisor.snapshot().state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stderr_output_marks_errored_without_killing() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "echo READY\nsleep 0.5\necho oops >&2\nexec sleep 30\n");
        let bus = EventBus::new();
        let mut events = bus.backend.subscribe();
        let supervisor = BackendSupervisor::new(config, bus);

        supervisor.start().await.unwrap();
        let errored = wait_for_state(&supervisor, |p| p.state == ProcessState::Errored).await;
        assert!(errored.pid.is_some());

        let mut saw_stderr = false;
        while let Ok(event) = events.try_recv() {
            saw_stderr |= event.message == "oops";
        }
        assert!(saw_stderr);

        supervisor.stop(false).await;
        assert_eq!(supervisor.snapshot().state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn non_zero_exit_is_errored_with_code() {
        let dir = TempDir::new().unwrap();
        let supervisor =
            BackendSupervisor::new(script_config(&dir, "exit 3\n"), EventBus::new());

        supervisor.start().await.unwrap();
        let exited =
            wait_for_state(&supervisor, |p| p.state == ProcessState::Errored && p.pid.is_none())
                .await;
        assert_eq!(exited.exit_code, Some(3));

        let err = supervisor
            .wait_until_ready(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn ignored_sigterm_is_followed_by_kill() {
        let dir = TempDir::new().unwrap();
        let body = "trap '' TERM\necho READY\nwhile true; do sleep 0.1; done\n";
        let supervisor = BackendSupervisor::new(script_config(&dir, body), EventBus::new());

        supervisor.start().await.unwrap();
        supervisor
            .wait_until_ready(Duration::from_secs(10))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        supervisor.stop(true).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(supervisor.snapshot().state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let supervisor = BackendSupervisor::new(BackendConfig::default(), EventBus::new());
        supervisor.stop(true).await;
        assert_eq!(supervisor.snapshot().state, ProcessState::NotStarted);
    }
}
