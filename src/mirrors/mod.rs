use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::product::ProductKind;
use crate::releases::version::same_version;
use crate::transfer::{Downloader, TransferError, verify_sha256_file};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mirror {
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Mirror {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            sha256: None,
        }
    }
}

/// Ordered download sources; iteration order is attempt order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorSet {
    mirrors: Vec<Mirror>,
    /// Set when the primary asset URL must not be tried.
    pub replaces_primary: bool,
}

impl MirrorSet {
    pub fn new(mirrors: Vec<Mirror>) -> Self {
        Self {
            mirrors,
            replaces_primary: false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mirror> {
        self.mirrors.iter()
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    /// The attempt sequence for a release: primary asset first unless superseded,
    /// then the mirrors in listed order without repeating a URL.
    pub fn with_primary(&self, primary: Mirror) -> MirrorSet {
        let mut out: Vec<Mirror> = Vec::with_capacity(self.mirrors.len() + 1);
        if !self.replaces_primary {
            out.push(primary);
        }
        for mirror in &self.mirrors {
            if !out.iter().any(|m| m.url == mirror.url) {
                out.push(mirror.clone());
            }
        }
        MirrorSet::new(out)
    }
}

impl FromIterator<Mirror> for MirrorSet {
    fn from_iter<I: IntoIterator<Item = Mirror>>(iter: I) -> Self {
        MirrorSet::new(iter.into_iter().collect())
    }
}

/// Source of alternate download locations. A miss means "primary only".
pub trait MirrorLookup: Send + Sync {
    fn mirrors_for_version(&self, product: ProductKind, version: &str) -> MirrorSet;

    /// Patch sources for moving a base game from `from` down to `to`.
    fn patch_mirrors(&self, from: &str, to: &str) -> MirrorSet;
}

/// Lookup that never has alternates.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMirrors;

impl MirrorLookup for NoMirrors {
    fn mirrors_for_version(&self, _product: ProductKind, _version: &str) -> MirrorSet {
        MirrorSet::default()
    }

    fn patch_mirrors(&self, _from: &str, _to: &str) -> MirrorSet {
        MirrorSet::default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionMirrors {
    pub product: ProductKind,
    pub version: String,
    #[serde(default)]
    pub replace_primary: bool,
    pub mirrors: Vec<Mirror>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchMirrors {
    pub from: String,
    pub to: String,
    pub mirrors: Vec<Mirror>,
}

/// JSON mirror index published next to the release feeds.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorIndex {
    #[serde(default)]
    pub versions: Vec<VersionMirrors>,
    #[serde(default)]
    pub patches: Vec<PatchMirrors>,
}

impl MirrorIndex {
    /// Fetch the index; any failure yields an empty index.
    pub async fn fetch(client: &Client, url: &str) -> MirrorIndex {
        let response = client
            .get(url)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        let response = match response {
            Ok(resp) => resp,
            Err(err) => {
                warn!("mirrors: index {url} unavailable ({err}); using primary sources only");
                return MirrorIndex::default();
            }
        };
        match response.json::<MirrorIndex>().await {
            Ok(index) => {
                info!(
                    "mirrors: loaded {} version entries and {} patch entries",
                    index.versions.len(),
                    index.patches.len()
                );
                index
            }
            Err(err) => {
                warn!("mirrors: index parse error ({err}); using primary sources only");
                MirrorIndex::default()
            }
        }
    }
}

impl MirrorLookup for MirrorIndex {
    fn mirrors_for_version(&self, product: ProductKind, version: &str) -> MirrorSet {
        self.versions
            .iter()
            .find(|entry| entry.product == product && same_version(&entry.version, version))
            .map(|entry| MirrorSet {
                mirrors: entry.mirrors.clone(),
                replaces_primary: entry.replace_primary,
            })
            .unwrap_or_default()
    }

    fn patch_mirrors(&self, from: &str, to: &str) -> MirrorSet {
        self.patches
            .iter()
            .find(|entry| same_version(&entry.from, from) && same_version(&entry.to, to))
            .map(|entry| MirrorSet::new(entry.mirrors.clone()))
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceAttempt {
    pub label: String,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no download sources available")]
    NoSources,
    #[error("all {} download sources failed", .attempts.len())]
    Exhausted { attempts: Vec<SourceAttempt> },
    #[error("download cancelled")]
    Cancelled,
}

/// The source that produced the file, plus what failed before it.
#[derive(Clone, Debug)]
pub struct SelectedSource {
    pub mirror: Mirror,
    pub bytes: u64,
    pub failures: Vec<SourceAttempt>,
}

/// Try each source in order until one downloads (and verifies) into `dest`.
pub async fn download_with_fallback(
    downloader: &Downloader,
    sources: &MirrorSet,
    dest: &Path,
    progress: &mut (dyn FnMut(f32) + Send),
    cancel: &CancellationToken,
) -> Result<SelectedSource, SelectorError> {
    if sources.is_empty() {
        return Err(SelectorError::NoSources);
    }
    let mut failures = Vec::new();
    for mirror in sources.iter() {
        info!("mirrors: trying {} ({})", mirror.label, mirror.url);
        let outcome = match downloader
            .download_with_retry(&mirror.url, dest, progress, cancel)
            .await
        {
            Ok(bytes) => match mirror.sha256.as_deref() {
                Some(expected) => verify_sha256_file(dest, expected).await.map(|_| bytes),
                None => Ok(bytes),
            },
            Err(err) => Err(err),
        };
        match outcome {
            Ok(bytes) => {
                return Ok(SelectedSource {
                    mirror: mirror.clone(),
                    bytes,
                    failures,
                });
            }
            Err(TransferError::Cancelled) => return Err(SelectorError::Cancelled),
            Err(err) => {
                warn!("mirrors: {} failed: {err}", mirror.label);
                let _ = tokio::fs::remove_file(dest).await;
                failures.push(SourceAttempt {
                    label: mirror.label.clone(),
                    url: mirror.url.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    Err(SelectorError::Exhausted { attempts: failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Route, TestServer};

    #[test]
    fn primary_goes_first_unless_replaced() {
        let set = MirrorSet::new(vec![
            Mirror::new("cdn", "https://cdn/a.zip"),
            Mirror::new("dup", "https://primary/a.zip"),
        ]);
        let order: Vec<_> = set
            .with_primary(Mirror::new("primary", "https://primary/a.zip"))
            .iter()
            .map(|m| m.label.clone())
            .collect();
        assert_eq!(order, vec!["primary", "cdn"]);

        let mut replacing = set.clone();
        replacing.replaces_primary = true;
        let order: Vec<_> = replacing
            .with_primary(Mirror::new("primary", "https://elsewhere/a.zip"))
            .iter()
            .map(|m| m.label.clone())
            .collect();
        assert_eq!(order, vec!["cdn", "dup"]);
    }

    #[test]
    fn index_lookup_misses_are_empty() {
        let index: MirrorIndex = serde_json::from_str(
            r#"{
                "versions": [
                    {"product": "client", "version": "3.10.0", "mirrors": [
                        {"label": "eu", "url": "https://eu/c.zip"},
                        {"label": "us", "url": "https://us/c.zip", "sha256": "ab"}
                    ]}
                ],
                "patches": [
                    {"from": "0.16.1.3.35392", "to": "0.16.0.0.1", "mirrors": [
                        {"label": "p1", "url": "https://p1/patch"}
                    ]}
                ]
            }"#,
        )
        .expect("index parses");

        let hit = index.mirrors_for_version(ProductKind::Client, "v3.10.0");
        let labels: Vec<_> = hit.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["eu", "us"]);
        assert!(index.mirrors_for_version(ProductKind::Server, "3.10.0").is_empty());
        assert_eq!(index.patch_mirrors("0.16.1.3.35392", "0.16.0.0.1").len(), 1);
        assert!(index.patch_mirrors("1", "2").is_empty());
    }

    #[tokio::test]
    async fn falls_through_to_the_last_working_source() {
        let server = TestServer::start(vec![
            ("/a.zip", Route::status(404)),
            ("/b.zip", Route::status(403)),
            ("/c.zip", Route::ok(b"payload-from-c".to_vec())),
        ])
        .await;
        let sources: MirrorSet = ["a", "b", "c"]
            .iter()
            .map(|name| Mirror::new(*name, server.url(&format!("/{name}.zip"))))
            .collect();
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("pkg.zip");
        let mut sink = |_: f32| {};

        let selected = download_with_fallback(
            &Downloader::new(),
            &sources,
            &dest,
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .expect("third source works");

        assert_eq!(selected.mirror.label, "c");
        assert_eq!(selected.failures.len(), 2);
        assert_eq!(std::fs::read(&dest).expect("read"), b"payload-from-c");
        assert_eq!(server.hits("/a.zip"), 1);
        assert_eq!(server.hits("/b.zip"), 1);
        assert_eq!(server.hits("/c.zip"), 1);
    }

    #[tokio::test]
    async fn checksum_mismatch_moves_to_next_source() {
        let server = TestServer::start(vec![
            ("/bad.zip", Route::ok(b"tampered".to_vec())),
            ("/good.zip", Route::ok(b"abc".to_vec())),
        ])
        .await;
        let mut bad = Mirror::new("bad", server.url("/bad.zip"));
        bad.sha256 = Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into());
        let mut good = Mirror::new("good", server.url("/good.zip"));
        good.sha256 = bad.sha256.clone();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = |_: f32| {};

        let selected = download_with_fallback(
            &Downloader::new(),
            &MirrorSet::new(vec![bad, good]),
            &dir.path().join("pkg"),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .expect("good source verifies");

        assert_eq!(selected.mirror.label, "good");
        assert!(selected.failures[0].error.contains("checksum"));
    }

    #[tokio::test]
    async fn reports_every_failed_attempt_when_exhausted() {
        let server = TestServer::start(vec![]).await;
        let sources = MirrorSet::new(vec![
            Mirror::new("one", server.url("/one")),
            Mirror::new("two", server.url("/two")),
        ]);
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("pkg");
        let mut sink = |_: f32| {};

        let err = download_with_fallback(
            &Downloader::new(),
            &sources,
            &dest,
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .expect_err("nothing works");

        match err {
            SelectorError::Exhausted { attempts } => {
                let labels: Vec<_> = attempts.iter().map(|a| a.label.as_str()).collect();
                assert_eq!(labels, vec!["one", "two"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!dest.exists());
        assert!(matches!(
            download_with_fallback(
                &Downloader::new(),
                &MirrorSet::default(),
                &dest,
                &mut sink,
                &CancellationToken::new(),
            )
            .await,
            Err(SelectorError::NoSources)
        ));
    }
}
