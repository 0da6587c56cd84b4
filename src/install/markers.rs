use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::product::ProductKind;

pub const MARKER_DIR: &str = ".launcher";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionMarker {
    pub version: String,
    /// Game (or client) version the installed release declared compatibility with.
    #[serde(default)]
    pub compatible_with: Option<String>,
    pub installed_at: DateTime<Utc>,
}

impl VersionMarker {
    pub fn new(version: impl Into<String>, compatible_with: Option<String>) -> Self {
        Self {
            version: version.into(),
            compatible_with,
            installed_at: Utc::now(),
        }
    }
}

pub fn marker_dir(dest: &Path) -> PathBuf {
    dest.join(MARKER_DIR)
}

pub fn marker_path(dest: &Path, product: ProductKind) -> PathBuf {
    marker_dir(dest).join(format!("{product}.version"))
}

pub fn incomplete_path(dest: &Path, product: ProductKind) -> PathBuf {
    marker_dir(dest).join(format!("{product}.incomplete"))
}

/// The recorded marker; unreadable or malformed markers count as absent.
pub fn read_marker(dest: &Path, product: ProductKind) -> Option<VersionMarker> {
    let path = marker_path(dest, product);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("markers: cannot read {}: {err}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(marker) => Some(marker),
        Err(err) => {
            warn!("markers: ignoring malformed {}: {err}", path.display());
            None
        }
    }
}

pub fn write_marker(dest: &Path, product: ProductKind, marker: &VersionMarker) -> io::Result<()> {
    let path = marker_path(dest, product);
    fs::create_dir_all(marker_dir(dest))?;
    let json = serde_json::to_string_pretty(marker).map_err(io::Error::other)?;
    let tmp = path.with_extension("version.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)
}

pub fn mark_incomplete(dest: &Path, product: ProductKind) -> io::Result<()> {
    fs::create_dir_all(marker_dir(dest))?;
    fs::write(incomplete_path(dest, product), Utc::now().to_rfc3339())
}

pub fn clear_incomplete(dest: &Path, product: ProductKind) -> io::Result<()> {
    match fs::remove_file(incomplete_path(dest, product)) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

pub fn is_incomplete(dest: &Path, product: ProductKind) -> bool {
    incomplete_path(dest, product).exists()
}

/// Installed version, or `None` when missing or marked incomplete.
pub fn installed_version(dest: &Path, product: ProductKind) -> Option<String> {
    if is_incomplete(dest, product) {
        return None;
    }
    read_marker(dest, product).map(|marker| marker.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_survives_a_write_read_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = VersionMarker::new("3.10.1", Some("0.16.1.3.35392".into()));
        write_marker(dir.path(), ProductKind::Server, &marker).expect("write");

        assert_eq!(read_marker(dir.path(), ProductKind::Server), Some(marker));
        assert_eq!(
            installed_version(dir.path(), ProductKind::Server).as_deref(),
            Some("3.10.1")
        );
        assert_eq!(installed_version(dir.path(), ProductKind::Client), None);
    }

    #[test]
    fn incomplete_marker_hides_the_installed_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_marker(dir.path(), ProductKind::Client, &VersionMarker::new("1.0.0", None))
            .expect("write");
        mark_incomplete(dir.path(), ProductKind::Client).expect("mark");

        assert!(is_incomplete(dir.path(), ProductKind::Client));
        assert_eq!(installed_version(dir.path(), ProductKind::Client), None);

        clear_incomplete(dir.path(), ProductKind::Client).expect("clear");
        clear_incomplete(dir.path(), ProductKind::Client).expect("clear twice");
        assert_eq!(
            installed_version(dir.path(), ProductKind::Client).as_deref(),
            Some("1.0.0")
        );
    }

    #[test]
    fn malformed_marker_reads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(marker_dir(dir.path())).expect("mkdir");
        fs::write(marker_path(dir.path(), ProductKind::Game), "not json").expect("write");
        assert_eq!(read_marker(dir.path(), ProductKind::Game), None);
    }
}
