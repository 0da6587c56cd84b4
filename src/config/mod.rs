use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::env;
use crate::product::ProductKind;

/// One release feed on a Gitea/GitHub compatible API.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub include_prereleases: bool,
    #[serde(default = "default_asset_suffixes")]
    pub asset_suffixes: Vec<String>,
}

impl FeedConfig {
    pub fn new(api_base: &str, owner: &str, repo: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_owned(),
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            include_prereleases: false,
            asset_suffixes: default_asset_suffixes(),
        }
    }
}

fn default_asset_suffixes() -> Vec<String> {
    vec![".zip".into(), ".tar.gz".into(), ".tgz".into()]
}

fn default_true() -> bool {
    true
}

fn default_update_interval() -> u32 {
    6
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastChecked {
    pub client: Option<DateTime<Utc>>,
    pub server: Option<DateTime<Utc>>,
    pub mods: Option<DateTime<Utc>>,
}

impl LastChecked {
    pub fn get(&self, product: ProductKind) -> Option<DateTime<Utc>> {
        match product {
            ProductKind::Client => self.client,
            ProductKind::Server => self.server,
            ProductKind::Mods => self.mods,
            ProductKind::Game => None,
        }
    }

    /// Record a feed read. The base game has no feed and is ignored.
    pub fn set(&mut self, product: ProductKind, at: DateTime<Utc>) {
        match product {
            ProductKind::Client => self.client = Some(at),
            ProductKind::Server => self.server = Some(at),
            ProductKind::Mods => self.mods = Some(at),
            ProductKind::Game => {}
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LauncherConfig {
    pub client_dir: PathBuf,
    pub server_dir: PathBuf,
    /// Launcher-owned copy of the base game.
    pub game_dir: PathBuf,
    /// Vendor installation the base game is copied from.
    #[serde(default)]
    pub vendor_game_dir: Option<PathBuf>,
    #[serde(default)]
    pub vendor_game_version: Option<String>,
    pub client_feed: FeedConfig,
    pub server_feed: FeedConfig,
    #[serde(default)]
    pub mods_feed: Option<FeedConfig>,
    #[serde(default)]
    pub mirror_index_url: Option<String>,
    #[serde(default)]
    pub patcher_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub check_for_updates: bool,
    /// Minimum hours between two feed reads of the same product by an update check.
    #[serde(default = "default_update_interval")]
    pub update_check_interval_hours: u32,
    #[serde(default)]
    pub copy_settings: bool,
    #[serde(default)]
    pub last_checked: LastChecked,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            client_dir: env::default_client_dir(),
            server_dir: env::default_server_dir(),
            game_dir: env::default_game_dir(),
            vendor_game_dir: None,
            vendor_game_version: None,
            client_feed: FeedConfig::new("https://dev.sp-tarkov.com/api/v1", "SPT", "Modules"),
            server_feed: FeedConfig::new("https://dev.sp-tarkov.com/api/v1", "SPT", "Server"),
            mods_feed: None,
            mirror_index_url: None,
            patcher_path: None,
            check_for_updates: true,
            update_check_interval_hours: default_update_interval(),
            copy_settings: false,
            last_checked: LastChecked::default(),
        }
    }
}

/// Snapshot plus the revision it was published under.
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    pub revision: u64,
    pub config: Arc<LauncherConfig>,
}

/// Injected, versioned configuration handle.
///
/// Cloning shares the same underlying value; `update` notifies every subscriber.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(config: LauncherConfig) -> Self {
        let (tx, _) = watch::channel(ConfigSnapshot {
            revision: 0,
            config: Arc::new(config),
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<LauncherConfig> {
        self.tx.borrow().config.clone()
    }

    pub fn revision(&self) -> u64 {
        self.tx.borrow().revision
    }

    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut LauncherConfig),
    {
        self.tx.send_modify(|snapshot| {
            let mut next = (*snapshot.config).clone();
            mutate(&mut next);
            snapshot.revision += 1;
            snapshot.config = Arc::new(next);
            debug!("config: updated to revision {}", snapshot.revision);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_bumps_revision_and_notifies() {
        let store = ConfigStore::new(LauncherConfig::default());
        let mut rx = store.subscribe();
        assert_eq!(store.revision(), 0);

        store.update(|cfg| cfg.copy_settings = true);

        assert_eq!(store.revision(), 1);
        assert!(store.current().copy_settings);
        assert!(rx.has_changed().unwrap_or(false));
        assert_eq!(rx.borrow_and_update().revision, 1);
    }

    #[test]
    fn snapshots_are_not_mutated_by_later_updates() {
        let store = ConfigStore::new(LauncherConfig::default());
        let before = store.current();
        store.update(|cfg| cfg.check_for_updates = false);
        assert!(before.check_for_updates);
        assert!(!store.current().check_for_updates);
    }

    #[test]
    fn parses_minimal_json_with_defaults() {
        let json = r#"{
            "client_dir": "/games/client",
            "server_dir": "/games/server",
            "game_dir": "/games/base",
            "client_feed": {"api_base": "http://x", "owner": "o", "repo": "c"},
            "server_feed": {"api_base": "http://x", "owner": "o", "repo": "s"}
        }"#;
        let cfg: LauncherConfig = serde_json::from_str(json).expect("config parses");
        assert!(cfg.check_for_updates);
        assert_eq!(cfg.update_check_interval_hours, 6);
        assert!(!cfg.copy_settings);
        assert_eq!(cfg.client_feed.asset_suffixes, default_asset_suffixes());
        assert!(cfg.mods_feed.is_none());
    }
}
