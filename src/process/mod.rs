use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc, oneshot, watch};

use crate::install::lock::InstallLocks;
use crate::notify::{Notification, Observers};
use crate::product::ProductKind;

pub mod client;
pub mod output;
pub mod profile_api;
pub mod server;

pub use client::ClientProcess;
pub use server::ServerProcess;

use output::{DEFAULT_OUTPUT_LINES, OutputChannel};

/// Lifecycle of a managed executable. Declaration order is significant:
/// `state >= RunningState::Starting` means "launched and not yet exited".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunningState {
    NotRunning,
    StoppedUnexpectedly,
    Starting,
    Running,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no executable directory configured for the {0}")]
    NotConfigured(ProductKind),
    #[error("executable not found at {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("failed to launch {}: {source}", .path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to clear cache at {}: {source}", .path.display())]
    ClearCache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("an install or update of the {0} is in progress")]
    InstallInProgress(ProductKind),
    #[error("another {0} instance is already running outside the launcher")]
    AlreadyRunning(ProductKind),
    #[error("process did not exit after forced termination")]
    StopTimeout,
}

/// How the supervisor decides a launched process has finished starting.
#[derive(Clone, Debug)]
pub enum StartupDetection {
    /// A stdout/stderr line containing the marker.
    OutputMarker(String),
    /// The process stays alive for the given period.
    Settle(Duration),
}

#[derive(Clone, Debug)]
pub enum CacheLocation {
    /// Relative to the executable directory.
    Install(PathBuf),
    Absolute(PathBuf),
}

#[derive(Clone, Debug)]
pub struct ProcessProfile {
    pub kind: ProductKind,
    pub executable_name: String,
    pub detection: StartupDetection,
    pub cache: Vec<CacheLocation>,
    pub capture_output: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct SupervisorOptions {
    /// Wait after a close request, and again after a forced kill.
    pub shutdown_grace: Duration,
    /// Startup detection deadline; expiry kills the process.
    pub startup_timeout: Duration,
    pub output_lines: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(120),
            output_lines: DEFAULT_OUTPUT_LINES,
        }
    }
}

struct ChildHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

struct Inner {
    executable_dir: PathBuf,
    state: RunningState,
    stop_requested: bool,
    generation: u64,
    child: Option<ChildHandle>,
}

struct Shared {
    profile: ProcessProfile,
    options: SupervisorOptions,
    inner: Mutex<Inner>,
    op_lock: tokio::sync::Mutex<()>,
    states: Observers<RunningState>,
    started: Observers<()>,
    output: OutputChannel,
    locks: Option<InstallLocks>,
}

/// Supervises one executable across any number of launches.
#[derive(Clone)]
pub struct ManagedProcess {
    shared: Arc<Shared>,
}

impl ManagedProcess {
    pub fn new(
        profile: ProcessProfile,
        executable_dir: impl Into<PathBuf>,
        options: SupervisorOptions,
        locks: Option<InstallLocks>,
    ) -> Self {
        let output = OutputChannel::new(options.output_lines);
        Self {
            shared: Arc::new(Shared {
                profile,
                options,
                inner: Mutex::new(Inner {
                    executable_dir: executable_dir.into(),
                    state: RunningState::NotRunning,
                    stop_requested: false,
                    generation: 0,
                    child: None,
                }),
                op_lock: tokio::sync::Mutex::new(()),
                states: Observers::new(),
                started: Observers::new(),
                output,
                locks,
            }),
        }
    }

    pub fn kind(&self) -> ProductKind {
        self.shared.profile.kind
    }

    pub fn state(&self) -> RunningState {
        self.shared.lock().state
    }

    pub fn executable_dir(&self) -> PathBuf {
        self.shared.lock().executable_dir.clone()
    }

    pub fn set_executable_dir(&self, dir: impl Into<PathBuf>) {
        self.shared.lock().executable_dir = dir.into();
    }

    /// Full path of the executable, or an empty path when no directory is set.
    pub fn executable_file_path(&self) -> PathBuf {
        let dir = self.executable_dir();
        if dir.as_os_str().is_empty() {
            PathBuf::new()
        } else {
            dir.join(&self.shared.profile.executable_name)
        }
    }

    /// Every state transition, delivered to each subscriber in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunningState> {
        self.shared.states.subscribe()
    }

    /// Fires each time startup detection succeeds.
    pub fn subscribe_started(&self) -> mpsc::UnboundedReceiver<()> {
        self.shared.started.subscribe()
    }

    pub fn attach_output(&self) -> mpsc::UnboundedReceiver<String> {
        self.shared.output.attach()
    }

    pub fn detach_output(&self) {
        self.shared.output.detach();
    }

    pub fn drain_output(&self) -> Vec<String> {
        self.shared.output.drain()
    }

    /// Launch the executable. A no-op while already `Starting` or `Running`.
    pub async fn start(&self, arguments: Option<&str>) -> Result<(), ProcessError> {
        let _op = self.shared.op_lock.lock().await;
        let kind = self.kind();
        let current = self.state();
        if current >= RunningState::Starting {
            debug!("{kind}: start ignored while {current:?}");
            return Ok(());
        }

        let path = self.executable_file_path();
        if path.as_os_str().is_empty() {
            return Err(ProcessError::NotConfigured(kind));
        }
        if !path.exists() {
            warn!("{kind}: executable missing at {}", path.display());
            self.shared.fail_launch();
            return Err(ProcessError::MissingExecutable(path));
        }

        let mut cmd = Command::new(&path);
        apply_arguments(&mut cmd, arguments);
        cmd.current_dir(self.executable_dir());
        cmd.stdin(Stdio::null());
        if self.shared.profile.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.kill_on_drop(false);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!("{kind}: failed to launch {}: {source}", path.display());
                self.shared.fail_launch();
                return Err(ProcessError::Launch { path, source });
            }
        };
        let pid = child.id();
        info!("{kind}: launched {} (pid {:?})", path.display(), pid);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let startup_signal = Arc::new(Notify::new());

        let generation = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.stop_requested = false;
            inner.child = Some(ChildHandle {
                pid,
                kill_tx: Some(kill_tx),
                exited: exited_rx.clone(),
            });
            self.shared.set_state(&mut inner, RunningState::Starting);
            inner.generation
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(self.shared.clone(), stdout, startup_signal.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(self.shared.clone(), stderr, startup_signal.clone());
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(err) = child.start_kill() {
                        warn!("{}: kill failed: {err}", shared.profile.kind);
                    }
                    child.wait().await
                }
            };
            shared.handle_exit(generation, status);
            let _ = exited_tx.send(true);
        });

        tokio::spawn(watch_startup(
            self.shared.clone(),
            generation,
            startup_signal,
            exited_rx,
        ));
        Ok(())
    }

    /// Close the process: cooperative close first, then a forced kill.
    ///
    /// A no-op once the process is flagged `StoppedUnexpectedly`; the flag stays until the next start.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let _op = self.shared.op_lock.lock().await;
        let kind = self.kind();
        let (pid, mut exited) = {
            let mut inner = self.shared.lock();
            if matches!(
                inner.state,
                RunningState::NotRunning | RunningState::StoppedUnexpectedly
            ) {
                return Ok(());
            }
            let Some(child) = inner.child.as_ref() else {
                return Ok(());
            };
            if *child.exited.borrow() {
                return Ok(());
            }
            let handles = (child.pid, child.exited.clone());
            inner.stop_requested = true;
            handles
        };
        let grace = self.shared.options.shutdown_grace;

        info!("{kind}: requesting close");
        if let Some(pid) = pid
            && !request_close(pid).await
        {
            debug!("{kind}: close request for pid {pid} was not delivered");
        }
        if wait_exit(&mut exited, grace).await {
            info!("{kind}: exited after close request");
            return Ok(());
        }

        warn!("{kind}: still running after {grace:?}; terminating");
        let kill_tx = self
            .shared
            .lock()
            .child
            .as_mut()
            .and_then(|child| child.kill_tx.take());
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        if wait_exit(&mut exited, grace).await {
            info!("{kind}: terminated");
            return Ok(());
        }
        error!("{kind}: did not exit after forced termination");
        Err(ProcessError::StopTimeout)
    }

    /// Remove this kind's cache directories. Does not touch the process itself.
    pub fn clear_cache(&self) -> Result<Vec<PathBuf>, ProcessError> {
        let paths = self.cache_paths();
        self.remove_cache_dirs(&paths)
    }

    pub fn cache_paths(&self) -> Vec<PathBuf> {
        let dir = self.executable_dir();
        self.shared
            .profile
            .cache
            .iter()
            .filter_map(|location| match location {
                CacheLocation::Install(rel) if !dir.as_os_str().is_empty() => Some(dir.join(rel)),
                CacheLocation::Install(_) => None,
                CacheLocation::Absolute(path) => Some(path.clone()),
            })
            .collect()
    }

    pub(crate) fn remove_cache_dirs(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>, ProcessError> {
        let kind = self.kind();
        let _guard = match &self.shared.locks {
            Some(locks) => Some(
                locks
                    .try_acquire(kind)
                    .ok_or(ProcessError::InstallInProgress(kind))?,
            ),
            None => None,
        };
        let mut removed = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            std::fs::remove_dir_all(path).map_err(|source| ProcessError::ClearCache {
                path: path.clone(),
                source,
            })?;
            info!("{kind}: cleared cache {}", path.display());
            removed.push(path.clone());
        }
        Ok(removed)
    }

    /// Whether a process with this executable name runs that the launcher did not start.
    pub fn is_unmanaged_instance_running(&self) -> bool {
        let own_pid = self
            .shared
            .lock()
            .child
            .as_ref()
            .and_then(|child| child.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let name = OsStr::new(&self.shared.profile.executable_name);
        let found = system
            .processes_by_exact_name(name)
            .any(|process| Some(process.pid().as_u32()) != own_pid);
        if found {
            debug!(
                "{}: found unmanaged {} instance",
                self.kind(),
                self.shared.profile.executable_name
            );
        }
        found
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, next: RunningState) {
        if inner.state == next {
            return;
        }
        info!("{}: {:?} -> {:?}", self.profile.kind, inner.state, next);
        inner.state = next;
        self.states.publish(next);
    }

    fn fail_launch(&self) {
        let mut inner = self.lock();
        self.set_state(&mut inner, RunningState::StoppedUnexpectedly);
    }

    fn mark_running(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != RunningState::Starting {
            return;
        }
        self.set_state(&mut inner, RunningState::Running);
        drop(inner);
        self.started.publish(());
    }

    fn startup_timed_out(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != RunningState::Starting {
            return;
        }
        warn!(
            "{}: no startup signal within {:?}; terminating",
            self.profile.kind, self.options.startup_timeout
        );
        self.set_state(&mut inner, RunningState::StoppedUnexpectedly);
        if let Some(tx) = inner.child.as_mut().and_then(|child| child.kill_tx.take()) {
            let _ = tx.send(());
        }
    }

    fn handle_exit(&self, generation: u64, status: io::Result<ExitStatus>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match &status {
            Ok(status) => info!("{}: exited with {status}", self.profile.kind),
            Err(err) => warn!("{}: failed to wait for exit: {err}", self.profile.kind),
        }
        inner.child = None;
        let requested = std::mem::take(&mut inner.stop_requested);
        let next = if requested {
            RunningState::NotRunning
        } else if inner.state >= RunningState::Starting {
            warn!("{}: stopped unexpectedly", self.profile.kind);
            RunningState::StoppedUnexpectedly
        } else {
            inner.state
        };
        self.set_state(&mut inner, next);
    }
}

async fn watch_startup(
    shared: Arc<Shared>,
    generation: u64,
    signal: Arc<Notify>,
    mut exited: watch::Receiver<bool>,
) {
    let detection = shared.profile.detection.clone();
    let detected = async move {
        match detection {
            StartupDetection::OutputMarker(_) => signal.notified().await,
            StartupDetection::Settle(period) => tokio::time::sleep(period).await,
        }
    };
    tokio::select! {
        _ = exited.wait_for(|done| *done) => {}
        result = tokio::time::timeout(shared.options.startup_timeout, detected) => match result {
            Ok(()) => shared.mark_running(generation),
            Err(_) => shared.startup_timed_out(generation),
        },
    }
}

fn spawn_reader<R>(shared: Arc<Shared>, stream: R, signal: Arc<Notify>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let marker = match &shared.profile.detection {
            StartupDetection::OutputMarker(marker) => Some(marker.clone()),
            StartupDetection::Settle(_) => None,
        };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if marker.as_deref().is_some_and(|m| line.contains(m)) {
                signal.notify_one();
            }
            shared.output.push(line);
        }
    });
}

async fn wait_exit(exited: &mut watch::Receiver<bool>, within: Duration) -> bool {
    match tokio::time::timeout(within, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(unix)]
async fn request_close(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
}

#[cfg(windows)]
async fn request_close(pid: u32) -> bool {
    // taskkill without /F posts WM_CLOSE to the process windows.
    Command::new("taskkill")
        .arg("/PID")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
async fn request_close(_pid: u32) -> bool {
    false
}

fn apply_arguments(cmd: &mut Command, arguments: Option<&str>) {
    let Some(arguments) = arguments.map(str::trim).filter(|a| !a.is_empty()) else {
        return;
    };
    #[cfg(windows)]
    {
        cmd.raw_arg(arguments);
    }
    #[cfg(not(windows))]
    {
        cmd.args(arguments.split_whitespace());
    }
}

/// Message a host should show for `state`, if any. Crashes are never silent.
pub fn state_notification(kind: ProductKind, state: RunningState) -> Option<Notification> {
    match state {
        RunningState::StoppedUnexpectedly => Some(Notification::error(
            format!("{} stopped unexpectedly", kind.display_name()),
            "The process exited without being asked to. Check its logs and start it again.",
        )),
        RunningState::Running => Some(Notification::success(
            format!("{} started", kind.display_name()),
            "",
        )),
        RunningState::NotRunning | RunningState::Starting => None,
    }
}

pub(crate) fn platform_executable(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{stem}.exe")
    } else {
        stem.to_owned()
    }
}

pub(crate) fn install_cache(rel: impl AsRef<Path>) -> CacheLocation {
    CacheLocation::Install(rel.as_ref().to_path_buf())
}
