//! A single supervised app and its lifecycle
//!
//! Every state transition happens while holding the app's launch lock, so
//! at most one process exists per app at any time. Launch attempts run in
//! a detached task: a request that gives up waiting cannot leave the app
//! half-started.

use crate::config::AppsConfig;
use crate::error::AppError;
use crate::events::{AppEvent, EventSink, StopReason};
use crate::registry::LaunchSpec;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound for the readiness probe backoff
const MAX_READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long to wait for output readers to drain after a failed start
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Lifecycle state of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The last launch attempt failed; retried on the next `ensure`
    Failed,
}

/// Timing and capture settings shared by every app in a pool
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub startup_timeout: Duration,
    pub stop_grace_period: Duration,
    pub ready_poll_interval: Duration,
    pub output_tail_lines: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self::from_config(&AppsConfig::default())
    }
}

impl AppSettings {
    pub fn from_config(config: &AppsConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            stop_grace_period: config.stop_grace_period(),
            ready_poll_interval: config.ready_poll_interval(),
            output_tail_lines: config.output_tail_lines,
        }
    }
}

/// Bounded buffer of the most recent output lines
struct OutputTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    fn clear(&self) {
        self.lines.lock().clear();
    }
}

/// State only touched while holding the launch lock
struct Launch {
    child: Option<Child>,
    last_failure: Option<AppError>,
    /// Set once the app has been removed from its pool; it never starts again
    retired: bool,
}

/// One app served under one subdomain
pub struct App {
    name: String,
    spec: LaunchSpec,
    settings: AppSettings,
    events: Arc<dyn EventSink>,
    epoch: Instant,
    /// Milliseconds since `epoch`, only ever moves forward
    last_activity_ms: AtomicU64,
    /// Completed launch attempts, successful or not
    attempts: AtomicU64,
    state: RwLock<AppState>,
    addr: RwLock<Option<SocketAddr>>,
    pid: RwLock<Option<u32>>,
    output: Arc<OutputTail>,
    launch: tokio::sync::Mutex<Launch>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("addr", &self.addr())
            .finish()
    }
}

impl App {
    pub fn new(
        name: impl Into<String>,
        spec: LaunchSpec,
        settings: AppSettings,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let output = Arc::new(OutputTail::new(settings.output_tail_lines));
        Arc::new(Self {
            name: name.into(),
            spec,
            settings,
            events,
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            state: RwLock::new(AppState::Stopped),
            addr: RwLock::new(None),
            pid: RwLock::new(None),
            output,
            launch: tokio::sync::Mutex::new(Launch {
                child: None,
                last_failure: None,
                retired: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AppState {
        *self.state.read()
    }

    /// Address the app is reachable on while Running
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.read()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.read()
    }

    /// Number of launch attempts that have completed
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Most recent captured stdout/stderr lines
    pub fn output(&self) -> Vec<String> {
        self.output.snapshot()
    }

    /// Record activity now. Never moves the timestamp backwards.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::SeqCst);
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Make sure the app is Running and return its address.
    ///
    /// Callers that arrive while a launch is in flight wait for it and get
    /// its outcome, including a failure, instead of starting another one.
    pub async fn ensure(self: &Arc<Self>) -> Result<SocketAddr, AppError> {
        self.try_ensure().await?.ok_or_else(|| AppError::StartFailure {
            name: self.name.clone(),
            reason: "app was removed".to_string(),
            output: Vec::new(),
        })
    }

    /// Like [`App::ensure`], but `Ok(None)` when the app has been retired
    /// and must be looked up again.
    pub(crate) async fn try_ensure(self: &Arc<Self>) -> Result<Option<SocketAddr>, AppError> {
        let observed_attempts = self.attempts();
        let app = Arc::clone(self);
        match tokio::spawn(async move { app.ensure_locked(observed_attempts).await }).await {
            Ok(result) => result,
            Err(e) => Err(AppError::StartFailure {
                name: self.name.clone(),
                reason: format!("launch task failed: {}", e),
                output: self.output(),
            }),
        }
    }

    async fn ensure_locked(&self, observed_attempts: u64) -> Result<Option<SocketAddr>, AppError> {
        let mut launch = self.launch.lock().await;
        if launch.retired {
            return Ok(None);
        }

        match self.state() {
            AppState::Running => {
                if let Some(exit) = launch.child.as_mut().and_then(|c| c.try_wait().ok().flatten()) {
                    info!(name = %self.name, status = %exit, "App process exited, relaunching");
                    launch.child = None;
                    self.mark_stopped(StopReason::Exited);
                } else if let Some(addr) = self.addr() {
                    self.touch();
                    return Ok(Some(addr));
                }
            }
            AppState::Failed if self.attempts() > observed_attempts => {
                // A launch finished after this caller arrived; share its outcome
                if let Some(err) = launch.last_failure.clone() {
                    return Err(err);
                }
            }
            _ => {}
        }

        self.start(&mut launch).await.map(Some)
    }

    async fn start(&self, launch: &mut Launch) -> Result<SocketAddr, AppError> {
        self.set_state(AppState::Starting);
        self.output.clear();
        launch.last_failure = None;

        let result = match &self.spec {
            LaunchSpec::Static { addr } => self.probe_static(addr).await,
            LaunchSpec::Command {
                program,
                args,
                dir,
                env,
            } => self.spawn_and_wait(launch, program, args, dir.as_deref(), env).await,
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(addr) => {
                *self.addr.write() = Some(addr);
                self.set_state(AppState::Running);
                self.touch();
                self.events.notify(AppEvent::Started {
                    name: self.name.clone(),
                    addr,
                    pid: self.pid(),
                });
                Ok(addr)
            }
            Err(err) => {
                if let Some(child) = launch.child.take() {
                    terminate(&self.name, child, Duration::ZERO).await;
                }
                *self.pid.write() = None;
                *self.addr.write() = None;
                self.set_state(AppState::Failed);
                launch.last_failure = Some(err.clone());
                self.events.notify(AppEvent::Failed {
                    name: self.name.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn probe_static(&self, target: &str) -> Result<SocketAddr, AppError> {
        let failure = |reason: String| AppError::StartFailure {
            name: self.name.clone(),
            reason,
            output: Vec::new(),
        };

        let addr = tokio::net::lookup_host(target)
            .await
            .map_err(|e| failure(format!("cannot resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| failure(format!("cannot resolve {}", target)))?;

        match tokio::time::timeout(self.settings.startup_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(addr),
            Ok(Err(e)) => Err(failure(format!("nothing listening on {}: {}", addr, e))),
            Err(_) => Err(AppError::StartTimeout {
                name: self.name.clone(),
                timeout: self.settings.startup_timeout,
                output: Vec::new(),
            }),
        }
    }

    async fn spawn_and_wait(
        &self,
        launch: &mut Launch,
        program: &str,
        args: &[String],
        dir: Option<&std::path::Path>,
        env: &[(String, String)],
    ) -> Result<SocketAddr, AppError> {
        let addr = pick_local_addr().map_err(|e| AppError::StartFailure {
            name: self.name.clone(),
            reason: format!("no free port: {}", e),
            output: Vec::new(),
        })?;
        let port = addr.port().to_string();

        info!(name = %self.name, program, %addr, "Starting app");

        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| a.replace("$PORT", &port)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("PORT", &port);
        // Own process group so shutdown reaches wrappers like `bundle exec`
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| AppError::StartFailure {
            name: self.name.clone(),
            reason: format!("failed to spawn '{}': {}", program, e),
            output: Vec::new(),
        })?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture_output(self.name.clone(), stdout, Arc::clone(&self.output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture_output(self.name.clone(), stderr, Arc::clone(&self.output)));
        }

        let pid = child.id();
        debug!(name = %self.name, pid, "App process spawned");
        *self.pid.write() = pid;
        launch.child = Some(child);

        let result = self.wait_ready(launch, addr).await;
        if result.is_err() {
            // Let the readers catch the last lines the process printed
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers)).await;
        }
        result.map(|()| addr).map_err(|reason| match reason {
            ReadyError::Exited(reason) => AppError::StartFailure {
                name: self.name.clone(),
                reason,
                output: self.output(),
            },
            ReadyError::Timeout => AppError::StartTimeout {
                name: self.name.clone(),
                timeout: self.settings.startup_timeout,
                output: self.output(),
            },
        })
    }

    /// Probe the bind address with backoff until it accepts a connection
    async fn wait_ready(&self, launch: &mut Launch, addr: SocketAddr) -> Result<(), ReadyError> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        let mut interval = self.settings.ready_poll_interval;

        loop {
            if let Some(child) = launch.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        launch.child = None;
                        return Err(ReadyError::Exited(format!("process exited with {}", status)));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(ReadyError::Exited(format!("failed to poll process: {}", e))),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReadyError::Timeout);
            }
            let remaining = deadline - now;

            if let Ok(Ok(_)) = tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
                debug!(name = %self.name, %addr, "App accepting connections");
                return Ok(());
            }

            tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
            interval = (interval * 2).min(MAX_READY_POLL_INTERVAL);
        }
    }

    /// Stop the app if it is Running or Starting. Returns whether it stopped.
    pub async fn stop(&self, reason: StopReason) -> bool {
        let mut launch = self.launch.lock().await;
        self.stop_locked(&mut launch, reason).await
    }

    /// Stop the app for good. Later `ensure` calls fail without launching.
    pub async fn retire(&self, reason: StopReason) -> bool {
        let mut launch = self.launch.lock().await;
        launch.retired = true;
        self.stop_locked(&mut launch, reason).await
    }

    /// Stop the app if it is Running and has been idle longer than `idle_timeout`
    /// A launch or stop already in progress wins; the app is left alone.
    pub async fn stop_if_idle(&self, idle_timeout: Duration) -> bool {
        let Ok(mut launch) = self.launch.try_lock() else {
            return false;
        };
        if self.state() != AppState::Running {
            return false;
        }
        let idle = self.idle_for();
        if idle <= idle_timeout {
            return false;
        }
        info!(name = %self.name, idle_secs = idle.as_secs(), "App idle timeout reached");
        self.stop_locked(&mut launch, StopReason::Idle).await
    }

    async fn stop_locked(&self, launch: &mut Launch, reason: StopReason) -> bool {
        match self.state() {
            AppState::Running | AppState::Starting => {}
            _ => return false,
        }

        self.set_state(AppState::Stopping);
        if let Some(child) = launch.child.take() {
            terminate(&self.name, child, self.settings.stop_grace_period).await;
        }
        self.mark_stopped(reason);
        true
    }

    fn mark_stopped(&self, reason: StopReason) {
        *self.addr.write() = None;
        *self.pid.write() = None;
        self.set_state(AppState::Stopped);
        self.events.notify(AppEvent::Stopped {
            name: self.name.clone(),
            reason,
        });
    }

    fn set_state(&self, state: AppState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(name = %self.name, from = ?*current, to = ?state, "App state change");
            *current = state;
        }
    }
}

enum ReadyError {
    Exited(String),
    Timeout,
}

/// Choose a free loopback port for the app to bind
fn pick_local_addr() -> std::io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    listener.local_addr()
}

fn capture_output<R>(name: String, reader: R, tail: Arc<OutputTail>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(name = %name, "{}", line);
            tail.push(line);
        }
    })
}

/// SIGTERM the process group, wait up to `grace_period`, then SIGKILL.
/// Errors are logged and otherwise ignored.
async fn terminate(name: &str, mut child: Child, grace_period: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    if !grace_period.is_zero() {
        info!(name, pid, "Sending SIGTERM to app");
        #[cfg(unix)]
        signal_group(pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(name, pid, %status, "App exited gracefully");
                return;
            }
            Ok(Err(e)) => {
                warn!(name, pid, error = %e, "Error waiting for app to exit");
            }
            Err(_) => {
                warn!(name, pid, grace_period_secs = grace_period.as_secs(), "Grace period exceeded, sending SIGKILL");
            }
        }
    }

    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
    if let Err(e) = child.kill().await {
        debug!(name, pid, error = %e, "Kill failed");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    // The child leads its own process group; fall back to the single pid
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}
