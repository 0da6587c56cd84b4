use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{info, warn};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::mirrors::{Mirror, MirrorSet, SourceAttempt};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patcher not found at {}", .0.display())]
    MissingPatcher(PathBuf),
    #[error("no patch mirrors for {from} -> {to}")]
    NoMirrors { from: String, to: String },
    #[error("patcher failed on all {} mirrors", .attempts.len())]
    Exhausted { attempts: Vec<SourceAttempt> },
    #[error("patching cancelled")]
    Cancelled,
}

/// Run `<patcher> <install_dir> <mirror_url>` for each mirror until one succeeds.
pub async fn apply_patch(
    patcher: &Path,
    install_dir: &Path,
    mirrors: &MirrorSet,
    cancel: &CancellationToken,
) -> Result<Mirror, PatchError> {
    if !patcher.exists() {
        return Err(PatchError::MissingPatcher(patcher.to_path_buf()));
    }
    let mut attempts = Vec::new();
    for mirror in mirrors.iter() {
        if cancel.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        info!(
            "patch: running {} on {} with {}",
            patcher.display(),
            install_dir.display(),
            mirror.label
        );
        let mut cmd = Command::new(patcher);
        cmd.arg(install_dir)
            .arg(&mirror.url)
            .current_dir(install_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(PatchError::Cancelled),
            output = cmd.output() => output,
        };
        let error = match result {
            Ok(output) if output.status.success() => {
                info!("patch: applied from {}", mirror.label);
                return Ok(mirror.clone());
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = stderr.lines().last().unwrap_or_default().trim();
                if detail.is_empty() {
                    format!("patcher exited with {}", output.status)
                } else {
                    format!("patcher exited with {}: {detail}", output.status)
                }
            }
            Err(err) => format!("failed to run patcher: {err}"),
        };
        warn!("patch: {} failed: {error}", mirror.label);
        attempts.push(SourceAttempt {
            label: mirror.label.clone(),
            url: mirror.url.clone(),
            error,
        });
    }
    Err(PatchError::Exhausted { attempts })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::test_support::write_script;

    const PATCHER: &str = r#"case "$2" in
  *bad*) echo "mirror unreachable" >&2; exit 4 ;;
esac
echo "$2" > "$1/patched.txt""#;

    #[tokio::test]
    async fn tries_mirrors_until_the_patcher_succeeds() {
        let tools = tempfile::tempdir().expect("tempdir");
        let install = tempfile::tempdir().expect("tempdir");
        write_script(tools.path(), "patcher", PATCHER);
        let mirrors = MirrorSet::new(vec![
            Mirror::new("first", "https://bad.example/patch"),
            Mirror::new("second", "https://good.example/patch"),
        ]);

        let used = apply_patch(
            &tools.path().join("patcher"),
            install.path(),
            &mirrors,
            &CancellationToken::new(),
        )
        .await
        .expect("patch");

        assert_eq!(used.label, "second");
        let written = std::fs::read_to_string(install.path().join("patched.txt")).expect("read");
        assert_eq!(written.trim(), "https://good.example/patch");
    }

    #[tokio::test]
    async fn reports_every_failed_mirror() {
        let tools = tempfile::tempdir().expect("tempdir");
        let install = tempfile::tempdir().expect("tempdir");
        write_script(tools.path(), "patcher", PATCHER);
        let mirrors = MirrorSet::new(vec![
            Mirror::new("a", "https://bad-a/patch"),
            Mirror::new("b", "https://bad-b/patch"),
        ]);

        let err = apply_patch(
            &tools.path().join("patcher"),
            install.path(),
            &mirrors,
            &CancellationToken::new(),
        )
        .await
        .expect_err("all fail");

        match err {
            PatchError::Exhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].error.contains("mirror unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_patcher_fails_fast() {
        let install = tempfile::tempdir().expect("tempdir");
        let err = apply_patch(
            Path::new("/nonexistent/patcher"),
            install.path(),
            &MirrorSet::new(vec![Mirror::new("a", "https://a/patch")]),
            &CancellationToken::new(),
        )
        .await
        .expect_err("missing");
        assert!(matches!(err, PatchError::MissingPatcher(_)));
    }
}
