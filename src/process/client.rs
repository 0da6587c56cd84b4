use std::path::PathBuf;
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{
    CacheLocation, ManagedProcess, ProcessError, ProcessProfile, RunningState, StartupDetection,
    SupervisorOptions, install_cache, platform_executable,
};
use crate::env;
use crate::install::lock::InstallLocks;
use crate::product::ProductKind;

pub const CLIENT_EXECUTABLE_STEM: &str = "EscapeFromTarkov";
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(3);

pub fn client_profile(local_cache: PathBuf) -> ProcessProfile {
    ProcessProfile {
        kind: ProductKind::Client,
        executable_name: platform_executable(CLIENT_EXECUTABLE_STEM),
        detection: StartupDetection::Settle(DEFAULT_SETTLE),
        cache: vec![install_cache("cache"), CacheLocation::Absolute(local_cache)],
        capture_output: false,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConnectConfig<'a> {
    backend_url: &'a str,
    version: &'a str,
}

/// Launch arguments pointing the client at a backend with an existing session.
pub fn connect_arguments(backend_url: &str, session_id: &str) -> String {
    let config = ConnectConfig {
        backend_url: backend_url.trim_end_matches('/'),
        version: "live",
    };
    // Serializing two string fields cannot fail.
    let json = serde_json::to_string(&config).unwrap_or_default();
    format!("-token={session_id} -config={json}")
}

#[derive(Clone)]
pub struct ClientProcess {
    inner: ManagedProcess,
    local_cache: PathBuf,
}

impl ClientProcess {
    pub fn new(client_dir: impl Into<PathBuf>, locks: Option<InstallLocks>) -> Self {
        let local_cache = env::client_temp_cache_dir();
        Self::with_profile(
            client_profile(local_cache.clone()),
            local_cache,
            client_dir,
            SupervisorOptions::default(),
            locks,
        )
    }

    pub fn with_profile(
        profile: ProcessProfile,
        local_cache: PathBuf,
        client_dir: impl Into<PathBuf>,
        options: SupervisorOptions,
        locks: Option<InstallLocks>,
    ) -> Self {
        Self {
            inner: ManagedProcess::new(profile, client_dir, options, locks),
            local_cache,
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

    pub async fn start(&self, arguments: Option<&str>) -> Result<(), ProcessError> {
        self.inner.start(arguments).await
    }

    pub async fn connect(&self, backend_url: &str, session_id: &str) -> Result<(), ProcessError> {
        info!("client: connecting to {backend_url}");
        let args = connect_arguments(backend_url, session_id);
        self.inner.start(Some(&args)).await
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.inner.stop().await
    }

    /// Install cache plus the temp cache.
    pub fn clear_cache(&self) -> Result<Vec<PathBuf>, ProcessError> {
        self.inner.clear_cache()
    }

    /// Only the temp cache outside the install directory.
    pub fn clear_local_cache(&self) -> Result<Vec<PathBuf>, ProcessError> {
        self.inner
            .remove_cache_dirs(std::slice::from_ref(&self.local_cache))
    }

    pub fn is_unmanaged_instance_running(&self) -> bool {
        self.inner.is_unmanaged_instance_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_arguments_embed_backend_config() {
        let args = connect_arguments("http://127.0.0.1:6969/", "abc123");
        assert_eq!(
            args,
            r#"-token=abc123 -config={"BackendUrl":"http://127.0.0.1:6969","Version":"live"}"#
        );
    }

    #[test]
    fn client_profile_uses_settle_detection() {
        let profile = client_profile(PathBuf::from("/tmp/local"));
        assert!(matches!(profile.detection, StartupDetection::Settle(d) if d == DEFAULT_SETTLE));
        assert!(!profile.capture_output);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::process::server::{ServerProcess, server_profile};
        use crate::process::test_support::{fast_options, wait_for_state, write_script};

        fn settle_profile(name: &str, local_cache: PathBuf) -> ProcessProfile {
            let mut profile = client_profile(local_cache);
            profile.executable_name = name.into();
            profile.detection = StartupDetection::Settle(Duration::from_millis(200));
            profile
        }

        #[test]
        fn clearing_one_kind_leaves_the_other_alone() {
            let root = tempfile::tempdir().expect("tempdir");
            let client_dir = root.path().join("client");
            let server_dir = root.path().join("server");
            let local = root.path().join("temp-cache");
            for dir in [
                client_dir.join("cache"),
                server_dir.join("user/cache"),
                local.clone(),
            ] {
                std::fs::create_dir_all(&dir).expect("mkdir");
                std::fs::write(dir.join("entry.bin"), b"x").expect("write");
            }

            let client = ClientProcess::with_profile(
                client_profile(local.clone()),
                local.clone(),
                &client_dir,
                fast_options(),
                None,
            );
            let server =
                ServerProcess::with_profile(server_profile(), &server_dir, fast_options(), None);

            let removed = client.clear_cache().expect("client clear");
            assert_eq!(removed.len(), 2);
            assert!(!client_dir.join("cache").exists());
            assert!(!local.exists());
            assert!(server_dir.join("user/cache/entry.bin").exists());

            std::fs::create_dir_all(client_dir.join("cache")).expect("mkdir");
            server.clear_cache().expect("server clear");
            assert!(!server_dir.join("user/cache").exists());
            assert!(client_dir.join("cache").exists());
        }

        #[test]
        fn local_cache_clear_keeps_install_cache() {
            let root = tempfile::tempdir().expect("tempdir");
            let local = root.path().join("temp-cache");
            std::fs::create_dir_all(root.path().join("cache")).expect("mkdir");
            std::fs::create_dir_all(&local).expect("mkdir");

            let client = ClientProcess::with_profile(
                client_profile(local.clone()),
                local.clone(),
                root.path(),
                fast_options(),
                None,
            );
            assert_eq!(client.clear_local_cache().expect("clear"), vec![local.clone()]);
            assert!(!local.exists());
            assert!(root.path().join("cache").exists());
        }

        #[tokio::test]
        async fn settle_period_marks_client_running() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "client.sh", "exec sleep 30");
            let local = dir.path().join("temp-cache");
            let client = ClientProcess::with_profile(
                settle_profile("client.sh", local.clone()),
                local,
                dir.path(),
                fast_options(),
                None,
            );
            let mut states = client.subscribe();

            client
                .connect("http://127.0.0.1:6969", "session")
                .await
                .expect("connect");
            let seen = wait_for_state(&mut states, RunningState::Running).await;
            assert_eq!(seen, vec![RunningState::Starting, RunningState::Running]);

            client.stop().await.expect("stop");
            assert_eq!(client.state(), RunningState::NotRunning);
        }
    }
}
