use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::config::FeedConfig;
use crate::product::ProductKind;
use crate::transfer::ArchiveKind;

pub mod compat;
pub mod version;

pub use compat::parse_compatible_version;

const PAGE_SIZE: usize = 50;
const MAX_PAGES: u32 = 40;

#[derive(Debug, Clone, Deserialize)]
struct FeedRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<FeedAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct FeedAsset {
    name: String,
    #[serde(default)]
    size: u64,
    browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub tag: String,
    pub name: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub assets: Vec<ReleaseAsset>,
    pub draft: bool,
    pub prerelease: bool,
}

impl From<FeedRelease> for ReleaseDescriptor {
    fn from(release: FeedRelease) -> Self {
        Self {
            name: release
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| release.tag_name.clone()),
            tag: release.tag_name,
            body: release.body.unwrap_or_default(),
            created_at: release.created_at,
            published_at: release.published_at,
            assets: release
                .assets
                .into_iter()
                .map(|asset| ReleaseAsset {
                    name: asset.name,
                    url: asset.browser_download_url,
                    size: asset.size,
                })
                .collect(),
            draft: release.draft,
            prerelease: release.prerelease,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityTag {
    pub release_version: String,
    pub compatible_version: String,
}

/// A release that passed filtering and can be installed.
#[derive(Debug, Clone)]
pub struct ReleaseCandidate {
    pub release: ReleaseDescriptor,
    pub tag: CompatibilityTag,
    pub asset: ReleaseAsset,
    pub archive: ArchiveKind,
}

impl ReleaseCandidate {
    pub fn version(&self) -> &str {
        &self.tag.release_version
    }

    pub fn compatible_version(&self) -> &str {
        &self.tag.compatible_version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Draft,
    Prerelease,
    UnparseableBody,
    NoArchiveAsset,
    NoReleaseVersion,
}

/// Raw feed contents. `error` is set when the feed could not be read.
#[derive(Debug, Clone, Default)]
pub struct FeedFetch {
    pub releases: Vec<ReleaseDescriptor>,
    pub pages: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub candidates: Vec<ReleaseCandidate>,
    pub rejected: Vec<(String, Rejection)>,
    pub error: Option<String>,
}

impl Resolution {
    /// Newest entry of the feed; feeds are newest first.
    pub fn latest(&self) -> Option<&ReleaseCandidate> {
        self.candidates.first()
    }

    pub fn find(&self, release_version: &str) -> Option<&ReleaseCandidate> {
        self.candidates
            .iter()
            .find(|c| version::same_version(c.version(), release_version))
    }

    /// First candidate declaring compatibility with `compatible_version`.
    pub fn first_compatible_with(&self, compatible_version: &str) -> Option<&ReleaseCandidate> {
        self.candidates
            .iter()
            .find(|c| version::same_version(c.compatible_version(), compatible_version))
    }
}

pub struct ReleaseResolver {
    client: Client,
}

impl ReleaseResolver {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("spt-launcher/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("releases: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Read every page of a feed. Never fails; problems land in `FeedFetch::error`.
    pub async fn fetch_releases(&self, feed: &FeedConfig) -> FeedFetch {
        let mut fetch = FeedFetch::default();
        let base = feed.api_base.trim_end_matches('/');
        for page in 1..=MAX_PAGES {
            let url = format!(
                "{base}/repos/{}/{}/releases?page={page}&limit={PAGE_SIZE}",
                feed.owner, feed.repo
            );
            debug!("releases: GET {url}");
            let batch = match self.fetch_page(&url).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("releases: feed {}/{} unavailable: {err}", feed.owner, feed.repo);
                    return FeedFetch {
                        releases: Vec::new(),
                        pages: fetch.pages,
                        error: Some(err),
                    };
                }
            };
            fetch.pages = page;
            let count = batch.len();
            fetch
                .releases
                .extend(batch.into_iter().map(ReleaseDescriptor::from));
            if count < PAGE_SIZE {
                break;
            }
        }
        info!(
            "releases: {} entries from {}/{} over {} page(s)",
            fetch.releases.len(),
            feed.owner,
            feed.repo,
            fetch.pages
        );
        fetch
    }

    /// Fetch a feed and keep only installable, compatibility-tagged releases.
    pub async fn resolve(&self, feed: &FeedConfig, product: ProductKind) -> Resolution {
        let fetch = self.fetch_releases(feed).await;
        let mut resolution = resolve_releases(fetch.releases, product, feed);
        resolution.error = fetch.error;
        resolution
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<FeedRelease>, String> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("feed returned HTTP {}", response.status().as_u16()));
        }
        response
            .json::<Vec<FeedRelease>>()
            .await
            .map_err(|e| format!("feed parse error: {e}"))
    }
}

impl Default for ReleaseResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter feed entries in order. Rejected releases are logged, never surfaced as errors.
pub fn resolve_releases(
    releases: Vec<ReleaseDescriptor>,
    product: ProductKind,
    feed: &FeedConfig,
) -> Resolution {
    let mut resolution = Resolution::default();
    for release in releases {
        let label = release.tag.clone();
        match classify(release, product, feed) {
            Ok(candidate) => resolution.candidates.push(candidate),
            Err(reason) => {
                warn!("releases: skipping {product} release {label}: {reason:?}");
                resolution.rejected.push((label, reason));
            }
        }
    }
    resolution
}

pub fn classify(
    release: ReleaseDescriptor,
    product: ProductKind,
    feed: &FeedConfig,
) -> Result<ReleaseCandidate, Rejection> {
    if release.draft {
        return Err(Rejection::Draft);
    }
    if release.prerelease && !feed.include_prereleases {
        return Err(Rejection::Prerelease);
    }
    let compatible_version =
        parse_compatible_version(&release.body, product).ok_or(Rejection::UnparseableBody)?;
    let release_version = compat::release_version_from(&release.name)
        .or_else(|| compat::release_version_from(&release.tag))
        .ok_or(Rejection::NoReleaseVersion)?;
    let (asset, archive) = release
        .assets
        .iter()
        .find_map(|asset| {
            let lower = asset.name.to_ascii_lowercase();
            let matches = feed
                .asset_suffixes
                .iter()
                .any(|suffix| lower.ends_with(&suffix.to_ascii_lowercase()));
            if !matches {
                return None;
            }
            ArchiveKind::from_name(&asset.name).map(|kind| (asset.clone(), kind))
        })
        .ok_or(Rejection::NoArchiveAsset)?;

    Ok(ReleaseCandidate {
        tag: CompatibilityTag {
            release_version,
            compatible_version,
        },
        asset,
        archive,
        release,
    })
}
