//! Supervises the local OpenCode server process: binary discovery, spawn,
//! health polling, crash detection, and shutdown.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;

use opengui_error::HostError;

mod binary;
pub mod port;
mod port_reclaim;

pub use port::{allocate_port, BASE_PORT, PORT_RANGE};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_ATTEMPTS: usize = 10;
const HEALTH_DELAY: Duration = Duration::from_millis(500);
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SPAWN_SETTLE: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const RESTART_PAUSE: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ServerStatus {
    /// Guarded lifecycle transitions. Everything else is a bug in the
    /// caller and is refused.
    pub fn may_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Crashed, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Crashed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Crashed)
                | (Crashed, Stopping)
                | (Stopping, Stopped)
        )
    }

    fn probe_allowed(self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Running)
    }
}

/// Notification emitted when the server degrades outside of a lifecycle
/// call. The presentation layer turns these into actionable messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerEvent {
    Crashed { code: Option<i32> },
    Unhealthy,
}

/// Snapshot of the supervised process, for status-bar style consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProcessState {
    pub pid: Option<u32>,
    pub port: u16,
    pub status: ServerStatus,
    pub started_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ServerManagerConfig {
    pub workspace_root: PathBuf,
    /// Explicit binary override; `OPENCODE_PATH` and `PATH` are consulted
    /// when unset.
    pub binary_path: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl ServerManagerConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            binary_path: None,
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: ServerManagerConfig,
    port: u16,
    http: reqwest::Client,
    /// Serializes start/stop/restart so exactly one lifecycle transition is
    /// in flight per manager.
    ops: Mutex<()>,
    state: Mutex<Shared>,
    events: broadcast::Sender<ServerEvent>,
}

#[derive(Debug, Default)]
struct Shared {
    status: StatusCell,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<i64>,
    /// Bumped on every successful spawn; monitor tasks from older
    /// instances bail out when it no longer matches.
    instance_id: u64,
    shutdown_requested: bool,
}

#[derive(Debug)]
struct StatusCell(ServerStatus);

impl Default for StatusCell {
    fn default() -> Self {
        Self(ServerStatus::Stopped)
    }
}

impl StatusCell {
    fn get(&self) -> ServerStatus {
        self.0
    }

    fn set(&mut self, next: ServerStatus) {
        if self.0.may_transition_to(next) {
            tracing::debug!(from = ?self.0, to = ?next, "server lifecycle transition");
            self.0 = next;
        } else {
            tracing::error!(from = ?self.0, to = ?next, "refused invalid lifecycle transition");
        }
    }
}

impl ServerManager {
    pub fn new(config: ServerManagerConfig) -> Self {
        let port = port::allocate_port(&config.workspace_root);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                config,
                port,
                http: reqwest::Client::new(),
                ops: Mutex::new(()),
                state: Mutex::new(Shared::default()),
                events,
            }),
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.inner.port)
    }

    pub fn log_dir(&self) -> &Path {
        &self.inner.config.log_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn status(&self) -> ServerProcessState {
        let state = self.inner.state.lock().await;
        ServerProcessState {
            pid: state.pid,
            port: self.inner.port,
            status: state.status.get(),
            started_at: state.started_at,
        }
    }

    /// Start the server. No-op if it is already starting or running.
    pub async fn start(&self) -> Result<(), HostError> {
        let _guard = self.inner.ops.lock().await;
        self.start_locked().await
    }

    /// Stop the server. No-op if it is not running.
    pub async fn stop(&self) -> Result<(), HostError> {
        let _guard = self.inner.ops.lock().await;
        self.stop_locked().await;
        Ok(())
    }

    /// Stop, wait for the OS to release the port, start again.
    pub async fn restart(&self) -> Result<(), HostError> {
        let _guard = self.inner.ops.lock().await;
        tracing::info!("restarting opencode server");
        self.stop_locked().await;
        sleep(RESTART_PAUSE).await;
        self.start_locked().await
    }

    /// Probe the server root endpoint. Any HTTP response counts as healthy;
    /// returns false without probing when the server is not marked running.
    pub async fn is_healthy(&self) -> bool {
        let status = self.inner.state.lock().await.status.get();
        if !status.probe_allowed() {
            return false;
        }
        self.probe(PROBE_TIMEOUT).await
    }

    async fn start_locked(&self) -> Result<(), HostError> {
        {
            let mut state = self.inner.state.lock().await;
            match state.status.get() {
                ServerStatus::Starting | ServerStatus::Running => {
                    tracing::info!("opencode server is already running");
                    return Ok(());
                }
                ServerStatus::Stopping => {
                    tracing::warn!("opencode server is still stopping, not starting");
                    return Ok(());
                }
                ServerStatus::Stopped | ServerStatus::Crashed => {
                    state.status.set(ServerStatus::Starting);
                }
            }
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                if state.child.is_some() {
                    // Health checks were exhausted but the process is alive;
                    // leave it for diagnostics.
                    state.status.set(ServerStatus::Crashed);
                } else {
                    state.status.set(ServerStatus::Stopped);
                }
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), HostError> {
        let binary = binary::resolve_binary(self.inner.config.binary_path.as_ref())?;
        let port = self.inner.port;
        let workspace = &self.inner.config.workspace_root;

        tracing::info!(
            binary = %binary.display(),
            port,
            workspace = %workspace.display(),
            "starting opencode server"
        );

        // A stale server from a crashed host commonly holds the workspace
        // port; reclaim it before spawning.
        if self.probe(PORT_CHECK_TIMEOUT).await {
            tracing::warn!(port, "port is already in use, attempting to free it");
            if port_reclaim::kill_listener(port).await {
                sleep(RESTART_PAUSE).await;
            } else if self.probe(PORT_CHECK_TIMEOUT).await {
                return Err(HostError::PortInUse { port });
            }
        }

        let log_file = open_server_log(&self.inner.config.log_dir);
        let (stdout, stderr) = match log_file {
            Some(file) => {
                let clone = file.try_clone().ok();
                (
                    Stdio::from(file),
                    clone.map(Stdio::from).unwrap_or_else(Stdio::null),
                )
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut child = Command::new(&binary)
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .current_dir(workspace)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| HostError::SpawnFailed {
                binary: binary.clone(),
                message: err.to_string(),
            })?;

        // Give the process a moment; an immediate exit means the launch
        // itself failed (bad binary, bad flags).
        sleep(SPAWN_SETTLE).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(HostError::SpawnFailed {
                binary,
                message: format!("exited with {status} during startup"),
            });
        }

        let instance_id = {
            let mut state = self.inner.state.lock().await;
            state.pid = child.id();
            state.started_at = Some(now_ms());
            state.child = Some(child);
            state.shutdown_requested = false;
            state.instance_id += 1;
            state.instance_id
        };

        // Status is Starting here, which already permits probes; the health
        // loop below goes through the same path the monitor uses.
        let mut healthy = false;
        for attempt in 1..=HEALTH_ATTEMPTS {
            if self.probe(PROBE_TIMEOUT).await {
                tracing::debug!(attempt, "health check passed");
                healthy = true;
                break;
            }
            tracing::debug!(attempt, max = HEALTH_ATTEMPTS, "health check failed, retrying");
            sleep(HEALTH_DELAY).await;
        }
        if !healthy {
            return Err(HostError::ServerUnhealthy {
                attempts: HEALTH_ATTEMPTS,
            });
        }

        self.inner
            .state
            .lock()
            .await
            .status
            .set(ServerStatus::Running);
        self.spawn_exit_watcher(instance_id);
        self.spawn_health_monitor(instance_id);

        tracing::info!(port, "opencode server ready");
        Ok(())
    }

    async fn stop_locked(&self) {
        let child = {
            let mut state = self.inner.state.lock().await;
            match state.status.get() {
                ServerStatus::Stopped | ServerStatus::Stopping => {
                    tracing::info!("opencode server is not running");
                    return;
                }
                ServerStatus::Running | ServerStatus::Crashed => {
                    state.status.set(ServerStatus::Stopping);
                }
                ServerStatus::Starting => {
                    // Unreachable while lifecycle ops hold the mutex; kept
                    // for the StatusCell guard to report if it ever happens.
                    state.status.set(ServerStatus::Stopping);
                }
            }
            state.shutdown_requested = true;
            state.child.take()
        };

        if let Some(child) = child {
            tracing::info!("stopping opencode server");
            graceful_kill(child).await;
        }

        let mut state = self.inner.state.lock().await;
        state.pid = None;
        state.started_at = None;
        state.status.set(ServerStatus::Stopped);
        tracing::info!("opencode server stopped");
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let url = format!("{}/", self.base_url());
        match self.inner.http.get(&url).timeout(timeout).send().await {
            Ok(response) => {
                tracing::trace!(status = %response.status(), "health probe response");
                true
            }
            Err(err) => {
                tracing::trace!(error = %err, "health probe failed");
                false
            }
        }
    }

    fn spawn_exit_watcher(&self, instance_id: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(EXIT_POLL_INTERVAL).await;
                let exited = {
                    let mut state = manager.inner.state.lock().await;
                    if state.instance_id != instance_id {
                        return;
                    }
                    match state.child.as_mut() {
                        Some(child) => match child.try_wait() {
                            Ok(status) => status,
                            Err(_) => return,
                        },
                        None => return,
                    }
                };
                if let Some(status) = exited {
                    manager.handle_exit(instance_id, status).await;
                    return;
                }
            }
        });
    }

    fn spawn_health_monitor(&self, instance_id: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(MONITOR_INTERVAL).await;
                {
                    let state = manager.inner.state.lock().await;
                    if state.instance_id != instance_id
                        || state.status.get() != ServerStatus::Running
                    {
                        return;
                    }
                }
                if manager.probe(PROBE_TIMEOUT).await {
                    continue;
                }
                let mut state = manager.inner.state.lock().await;
                if state.instance_id != instance_id || state.status.get() != ServerStatus::Running
                {
                    return;
                }
                state.status.set(ServerStatus::Crashed);
                drop(state);
                tracing::warn!("opencode server stopped responding to health checks");
                let _ = manager.inner.events.send(ServerEvent::Unhealthy);
                return;
            }
        });
    }

    async fn handle_exit(&self, instance_id: u64, status: ExitStatus) {
        let code = {
            let mut state = self.inner.state.lock().await;
            if state.instance_id != instance_id {
                return;
            }
            // The process is gone either way; drop the references even if
            // the monitor already flipped the state.
            state.child = None;
            state.pid = None;
            if state.status.get() != ServerStatus::Running || state.shutdown_requested {
                return;
            }
            let code = status.code();
            if code == Some(0) {
                tracing::info!("opencode server exited cleanly");
                state.status.set(ServerStatus::Stopped);
                return;
            }
            state.status.set(ServerStatus::Crashed);
            code
        };

        tracing::warn!(?code, "opencode server crashed");
        let _ = self.inner.events.send(ServerEvent::Crashed { code });
    }

    #[cfg(test)]
    async fn force_status(&self, status: ServerStatus) {
        self.inner.state.lock().await.status.0 = status;
    }
}

async fn graceful_kill(mut child: Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => return,
                Err(_) => {
                    tracing::warn!(pid, "server did not exit in time, force killing");
                }
            }
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn default_log_dir() -> PathBuf {
    let mut base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.push("opengui");
    base.push("server-logs");
    base
}

fn open_server_log(log_dir: &Path) -> Option<std::fs::File> {
    if let Err(err) = std::fs::create_dir_all(log_dir) {
        tracing::warn!(error = %err, "failed to create server log directory");
        return None;
    }
    let path = log_dir.join("opencode-server.log");
    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(error = %err, "failed to open server log file");
            return None;
        }
    };
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = writeln!(file, "[{timestamp}] --- server starting ---");
    Some(file)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ServerManager {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerManagerConfig::new(dir.path());
        config.log_dir = dir.path().join("logs");
        ServerManager::new(config)
    }

    #[test]
    fn lifecycle_transitions_are_guarded() {
        use ServerStatus::*;
        assert!(Stopped.may_transition_to(Starting));
        assert!(Crashed.may_transition_to(Starting));
        assert!(Starting.may_transition_to(Running));
        assert!(Starting.may_transition_to(Stopped));
        assert!(Running.may_transition_to(Stopping));
        assert!(Running.may_transition_to(Crashed));
        assert!(Stopping.may_transition_to(Stopped));

        assert!(!Stopped.may_transition_to(Running));
        assert!(!Running.may_transition_to(Starting));
        assert!(!Stopping.may_transition_to(Running));
        assert!(!Stopped.may_transition_to(Stopped));
    }

    #[tokio::test]
    async fn is_healthy_is_false_without_probe_when_stopped() {
        let manager = manager();
        // No server, no probe: must return immediately rather than time out
        // against the unbound port.
        let started = std::time::Instant::now();
        assert!(!manager.is_healthy().await);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn stop_when_not_running_is_a_noop() {
        let manager = manager();
        manager.stop().await.unwrap();
        assert_eq!(manager.status().await.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn start_when_already_running_spawns_nothing() {
        let manager = manager();
        manager.force_status(ServerStatus::Running).await;

        manager.start().await.unwrap();

        let state = manager.inner.state.lock().await;
        assert_eq!(state.status.get(), ServerStatus::Running);
        assert!(state.child.is_none(), "no process should have been spawned");
    }

    #[tokio::test]
    async fn status_snapshot_reports_port_and_state() {
        let manager = manager();
        let status = manager.status().await;
        assert_eq!(status.status, ServerStatus::Stopped);
        assert_eq!(status.port, manager.port());
        assert!(status.pid.is_none());
        assert!(status.started_at.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_emits_exactly_one_crash_event() {
        use std::os::unix::process::ExitStatusExt;

        let manager = manager();
        manager.force_status(ServerStatus::Running).await;
        {
            let mut state = manager.inner.state.lock().await;
            state.instance_id = 1;
        }
        let mut events = manager.subscribe();

        let status = ExitStatus::from_raw(1 << 8);
        manager.handle_exit(1, status).await;
        // A second observation of the same exit must not notify again.
        manager.handle_exit(1, status).await;

        assert_eq!(manager.status().await.status, ServerStatus::Crashed);
        match events.try_recv() {
            Ok(ServerEvent::Crashed { code }) => assert_eq!(code, Some(1)),
            other => panic!("expected crash event, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "only one crash event expected");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_after_monitor_marked_crash_clears_the_pid() {
        use std::os::unix::process::ExitStatusExt;

        let manager = manager();
        // The health monitor beat the exit watcher to the transition.
        manager.force_status(ServerStatus::Crashed).await;
        {
            let mut state = manager.inner.state.lock().await;
            state.instance_id = 1;
            state.pid = Some(4242);
        }
        let mut events = manager.subscribe();

        manager.handle_exit(1, ExitStatus::from_raw(1 << 8)).await;

        let status = manager.status().await;
        assert_eq!(status.status, ServerStatus::Crashed);
        assert!(status.pid.is_none(), "stale pid survived the exit");
        assert!(events.try_recv().is_err(), "monitor already notified");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_during_shutdown_is_not_a_crash() {
        use std::os::unix::process::ExitStatusExt;

        let manager = manager();
        manager.force_status(ServerStatus::Running).await;
        {
            let mut state = manager.inner.state.lock().await;
            state.instance_id = 1;
            state.shutdown_requested = true;
        }
        let mut events = manager.subscribe();

        manager.handle_exit(1, ExitStatus::from_raw(1 << 8)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn probe_sees_local_listener() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let config = ServerManagerConfig::new(dir.path());
        let manager = ServerManager::new(config);
        // Point the probe at the test listener rather than the derived port.
        let url = format!("http://127.0.0.1:{port}/");
        let response = manager.inner.http.get(&url).timeout(PROBE_TIMEOUT).send().await;
        assert!(response.is_ok());
    }
}
