use std::path::PathBuf;

use tokio::sync::mpsc;

use super::{
    ManagedProcess, ProcessError, ProcessProfile, RunningState, StartupDetection,
    SupervisorOptions, install_cache, platform_executable,
};
use crate::install::lock::InstallLocks;
use crate::product::ProductKind;

pub const SERVER_EXECUTABLE_STEM: &str = "SPT.Server";
pub const SERVER_STARTED_MARKER: &str = "Server is running";

pub fn server_profile() -> ProcessProfile {
    ProcessProfile {
        kind: ProductKind::Server,
        executable_name: platform_executable(SERVER_EXECUTABLE_STEM),
        detection: StartupDetection::OutputMarker(SERVER_STARTED_MARKER.to_owned()),
        cache: vec![install_cache("user/cache")],
        capture_output: true,
    }
}

/// The game server: output is captured and startup is detected from its log.
#[derive(Clone)]
pub struct ServerProcess {
    inner: ManagedProcess,
}

impl ServerProcess {
    pub fn new(server_dir: impl Into<PathBuf>, locks: Option<InstallLocks>) -> Self {
        Self::with_profile(server_profile(), server_dir, SupervisorOptions::default(), locks)
    }

    pub fn with_profile(
        profile: ProcessProfile,
        server_dir: impl Into<PathBuf>,
        options: SupervisorOptions,
        locks: Option<InstallLocks>,
    ) -> Self {
        Self {
            inner: ManagedProcess::new(profile, server_dir, options, locks),
        }
    }

    pub fn process(&self) -> &ManagedProcess {
        &self.inner
    }

    pub fn state(&self) -> RunningState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunningState> {
        self.inner.subscribe()
    }

    /// Fires once per launch when the startup marker shows up in the output.
    pub fn subscribe_started(&self) -> mpsc::UnboundedReceiver<()> {
        self.inner.subscribe_started()
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        self.inner.start(None).await
    }

    /// Refuses to launch while an unmanaged server holds the port.
    pub async fn start_exclusive(&self) -> Result<(), ProcessError> {
        if self.inner.state() < RunningState::Starting && self.inner.is_unmanaged_instance_running()
        {
            return Err(ProcessError::AlreadyRunning(ProductKind::Server));
        }
        self.inner.start(None).await
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.inner.stop().await
    }

    pub fn clear_cache(&self) -> Result<Vec<PathBuf>, ProcessError> {
        self.inner.clear_cache()
    }

    pub fn is_unmanaged_instance_running(&self) -> bool {
        self.inner.is_unmanaged_instance_running()
    }

    pub fn attach_output(&self) -> mpsc::UnboundedReceiver<String> {
        self.inner.attach_output()
    }

    pub fn detach_output(&self) {
        self.inner.detach_output();
    }

    /// Lines captured while no listener was attached, oldest first.
    pub fn take_buffered_output(&self) -> Vec<String> {
        self.inner.drain_output()
    }
}
