use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, FeedConfig, LauncherConfig};
use crate::mirrors::{
    Mirror, MirrorIndex, MirrorLookup, NoMirrors, SelectorError, SourceAttempt,
    download_with_fallback,
};
use crate::notify::Notification;
use crate::product::ProductKind;
use crate::releases::version::{compare_versions, same_version};
use crate::releases::{ReleaseCandidate, ReleaseResolver, Resolution};
use crate::transfer::{Downloader, TransferError, extract_archive};
use crate::util::MonotonicProgress;

pub mod files;
pub mod lock;
pub mod markers;
pub mod patcher;
pub mod state;

pub use lock::{InstallGuard, InstallLocks};
pub use markers::VersionMarker;
pub use patcher::PatchError;
pub use state::{
    FailureReason, InstallEvent, InstallOutcome, InstallPhase, InstallProcessState,
    InstallRequest, Operation, UpdateCheck, VersionTarget,
};

/// Subdirectory of the client install that receives the mod set.
pub const MODS_SUBDIR: &str = "BepInEx/plugins";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("cancelled")]
    Cancelled,
    #[error("no installable release: {0}")]
    NoReleases(String),
    #[error("no working download source")]
    NoSources(Vec<SourceAttempt>),
    #[error("{} is not installed", .0.display_name())]
    NotInstalled(ProductKind),
    #[error("an install of the {0} is already running")]
    AlreadyInProgress(ProductKind),
    #[error(transparent)]
    Extract(TransferError),
    #[error(transparent)]
    Patch(PatchError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl InstallError {
    fn from_extract(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => InstallError::Cancelled,
            other => InstallError::Extract(other),
        }
    }

    pub fn into_outcome(self) -> InstallOutcome {
        let reason = match self {
            InstallError::Cancelled => return InstallOutcome::Cancelled,
            InstallError::NoReleases(detail) => FailureReason::NoReleases(detail),
            InstallError::NoSources(attempts) => FailureReason::NoSources(attempts),
            InstallError::NotInstalled(product) => FailureReason::NotInstalled(product),
            InstallError::AlreadyInProgress(product) => FailureReason::AlreadyInProgress(product),
            InstallError::Extract(err) => FailureReason::Extract(err.to_string()),
            InstallError::Patch(err) => FailureReason::Patch(err.to_string()),
            InstallError::Configuration(detail) => FailureReason::Configuration(detail),
            InstallError::Io(err) => FailureReason::Io(err.to_string()),
        };
        InstallOutcome::Failed(reason)
    }
}

impl From<SelectorError> for InstallError {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::NoSources => InstallError::NoSources(Vec::new()),
            SelectorError::Exhausted { attempts } => InstallError::NoSources(attempts),
            SelectorError::Cancelled => InstallError::Cancelled,
        }
    }
}

impl From<PatchError> for InstallError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Cancelled => InstallError::Cancelled,
            other => InstallError::Patch(other),
        }
    }
}

/// Scratch space inside a destination; removed after every run.
fn work_dir(dest: &Path) -> PathBuf {
    markers::marker_dir(dest)
}

fn settings_backup_dir(dest: &Path, product: ProductKind) -> PathBuf {
    work_dir(dest).join(format!("settings-{product}"))
}

pub fn destination_for(config: &LauncherConfig, product: ProductKind) -> PathBuf {
    match product {
        ProductKind::Client => config.client_dir.clone(),
        ProductKind::Server => config.server_dir.clone(),
        ProductKind::Game => config.game_dir.clone(),
        ProductKind::Mods if config.client_dir.as_os_str().is_empty() => PathBuf::new(),
        ProductKind::Mods => config.client_dir.join(MODS_SUBDIR),
    }
}

pub fn feed_for(config: &LauncherConfig, product: ProductKind) -> Option<&FeedConfig> {
    match product {
        ProductKind::Client => Some(&config.client_feed),
        ProductKind::Server => Some(&config.server_feed),
        ProductKind::Mods => config.mods_feed.as_ref(),
        ProductKind::Game => None,
    }
}

struct Run<'a> {
    events: &'a UnboundedSender<InstallEvent>,
    state: InstallProcessState,
    scratch: Vec<PathBuf>,
}

impl Run<'_> {
    fn enter(&mut self, phase: InstallPhase) {
        info!("install: {} -> {:?}", self.state.operation, phase);
        self.state.phase = phase;
        let _ = self.events.send(InstallEvent::Phase {
            operation: self.state.operation,
            phase,
        });
    }

    fn cleanup(&mut self) {
        for path in self.scratch.drain(..) {
            let result = if path.is_dir() {
                files::remove_dir_if_exists(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(err) = result
                && err.kind() != io::ErrorKind::NotFound
            {
                warn!("install: could not remove {}: {err}", path.display());
            }
        }
    }
}

/// Runs install and update requests. A run holds the lock of every product tree it writes.
pub struct Orchestrator {
    config: ConfigStore,
    downloader: Downloader,
    resolver: ReleaseResolver,
    mirrors: Arc<dyn MirrorLookup>,
    locks: InstallLocks,
}

impl Orchestrator {
    pub fn new(
        config: ConfigStore,
        downloader: Downloader,
        resolver: ReleaseResolver,
        mirrors: Arc<dyn MirrorLookup>,
        locks: InstallLocks,
    ) -> Self {
        Self {
            config,
            downloader,
            resolver,
            mirrors,
            locks,
        }
    }

    /// Default clients plus the configured mirror index, if any.
    pub async fn from_config(config: ConfigStore, locks: InstallLocks) -> Self {
        let downloader = Downloader::new();
        let index_url = config.current().mirror_index_url.clone();
        let mirrors: Arc<dyn MirrorLookup> = match index_url {
            Some(url) => Arc::new(MirrorIndex::fetch(downloader.client(), &url).await),
            None => Arc::new(NoMirrors),
        };
        Self::new(config, downloader, ReleaseResolver::new(), mirrors, locks)
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn locks(&self) -> &InstallLocks {
        &self.locks
    }

    pub fn installed_version(&self, product: ProductKind) -> Option<String> {
        let config = self.config.current();
        markers::installed_version(&destination_for(&config, product), product)
    }

    /// Installable releases for `product`, newest first.
    pub async fn releases(&self, product: ProductKind) -> Result<Resolution, InstallError> {
        let config = self.config.current();
        let feed = feed_for(&config, product).ok_or_else(|| {
            InstallError::Configuration(format!("no release feed configured for the {product}"))
        })?;
        let resolution = self.resolver.resolve(feed, product).await;
        if resolution.error.is_none() {
            self.touch_last_checked(product);
        }
        Ok(resolution)
    }

    /// Execute one request to a terminal outcome. Every event goes to `events`.
    pub async fn run(
        &self,
        request: InstallRequest,
        events: &UnboundedSender<InstallEvent>,
        cancel: &CancellationToken,
    ) -> InstallOutcome {
        let operation = request.operation;
        let product = operation.product();
        let _guards = match self.locks.try_acquire_all(operation.locked_products()) {
            Ok(guards) => guards,
            Err(busy) => {
                warn!("install: {operation} refused, {busy} is busy");
                return finish(
                    events,
                    operation,
                    InstallError::AlreadyInProgress(busy).into_outcome(),
                );
            }
        };

        let config = self.config.current();
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| destination_for(&config, product));
        let copy_settings = request.copy_settings.unwrap_or(config.copy_settings);
        let mut run = Run {
            events,
            state: InstallProcessState::new(&request, destination, copy_settings),
            scratch: Vec::new(),
        };

        let result = if run.state.destination.as_os_str().is_empty() {
            Err(InstallError::Configuration(format!(
                "no install directory configured for the {product}"
            )))
        } else if operation == Operation::InstallGameCopy {
            self.copy_game(&mut run, &config, cancel).await
        } else {
            self.install_release(&mut run, &config, cancel).await
        };
        run.cleanup();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("install: {operation} ended: {err}");
                err.into_outcome()
            }
        };
        finish(events, operation, outcome)
    }

    async fn install_release(
        &self,
        run: &mut Run<'_>,
        config: &LauncherConfig,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, InstallError> {
        let product = run.state.product();
        let dest = run.state.destination.clone();

        run.enter(InstallPhase::ResolvingVersion);
        let feed = feed_for(config, product).ok_or_else(|| {
            InstallError::Configuration(format!("no release feed configured for the {product}"))
        })?;
        let client_game_version = detect_installed(config, &mut run.state);
        if run.state.operation.is_update() && run.state.installed_version.is_none() {
            return Err(InstallError::NotInstalled(product));
        }
        if product == ProductKind::Mods && run.state.installed_client_version.is_none() {
            return Err(InstallError::NotInstalled(ProductKind::Client));
        }

        let resolution = self.resolver.resolve(feed, product).await;
        if resolution.error.is_none() {
            self.touch_last_checked(product);
        }
        let candidate = select_candidate(&resolution, &run.state, client_game_version.as_deref())?
            .clone();
        let version = candidate.version().to_owned();
        let compatible = candidate.compatible_version().to_owned();
        info!(
            "install: {product} {version} (works with {compatible}) selected from {} candidates",
            resolution.candidates.len()
        );
        run.state.resolved_version = Some(version.clone());
        run.state.compatible_version = Some(compatible.clone());
        if product == ProductKind::Client {
            run.state.needs_patch = needs_downgrade(run.state.installed_game_version.as_deref(), &compatible);
        }

        if let Some(installed) = run.state.installed_version.clone() {
            let ahead = run.state.operation.is_update()
                && run.state.requested == VersionTarget::Latest
                && compare_versions(&installed, &version) == Ordering::Greater;
            if same_version(&installed, &version) || ahead {
                info!("install: {product} already at {installed}");
                return Ok(InstallOutcome::AlreadyCurrent { version: installed });
            }
        }

        run.enter(InstallPhase::SelectingMirror);
        let sources = self
            .mirrors
            .mirrors_for_version(product, &version)
            .with_primary(Mirror::new("primary", &candidate.asset.url));
        if sources.is_empty() {
            return Err(InstallError::NoSources(Vec::new()));
        }
        info!("install: {} source(s) for {product} {version}", sources.len());

        run.enter(InstallPhase::Downloading);
        let archive_path = work_dir(&dest)
            .join("download")
            .join(format!("{product}-{version}{}", candidate.archive.extension()));
        run.scratch.push(archive_path.clone());
        let selected = {
            let events = run.events;
            let mut sink = |fraction: f32| {
                let _ = events.send(InstallEvent::DownloadProgress(fraction));
            };
            let mut gate = MonotonicProgress::new(&mut sink);
            let mut progress = |fraction: f32| gate.report(fraction);
            download_with_fallback(&self.downloader, &sources, &archive_path, &mut progress, cancel)
                .await?
        };
        info!(
            "install: downloaded {} bytes from {}",
            selected.bytes, selected.mirror.label
        );
        run.state.chosen_mirror = Some(selected.mirror);

        run.enter(InstallPhase::Extracting);
        let staging = work_dir(&dest).join(format!("staging-{product}"));
        files::remove_dir_if_exists(&staging)?;
        run.scratch.push(staging.clone());
        let written = {
            let tx = run.events.clone();
            let token = cancel.clone();
            let archive = archive_path.clone();
            let target = staging.clone();
            let kind = candidate.archive;
            tokio::task::spawn_blocking(move || {
                let mut sink = move |fraction: f32| {
                    let _ = tx.send(InstallEvent::ExtractProgress(fraction));
                };
                extract_archive(&archive, &target, kind, &mut sink, &token)
            })
            .await
            .map_err(|err| {
                InstallError::Extract(TransferError::Archive(format!(
                    "extraction task failed: {err}"
                )))
            })?
            .map_err(InstallError::from_extract)?
        };
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        if run.state.copy_settings {
            backup_settings(&dest, product)?;
        }
        markers::mark_incomplete(&dest, product)?;
        let moved = files::move_tree(&staging, &dest)?;
        info!("install: placed {moved} of {written} files into {}", dest.display());

        if run.state.needs_patch {
            run.enter(InstallPhase::Patching);
            self.patch_base_game(run, config, &compatible, cancel).await?;
        }

        run.enter(InstallPhase::Finalizing);
        if run.state.copy_settings {
            restore_settings(&dest, product)?;
        }
        markers::write_marker(&dest, product, &VersionMarker::new(&version, Some(compatible)))?;
        markers::clear_incomplete(&dest, product)?;
        Ok(InstallOutcome::Completed { version })
    }

    async fn patch_base_game(
        &self,
        run: &mut Run<'_>,
        config: &LauncherConfig,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let patcher = config.patcher_path.clone().ok_or_else(|| {
            InstallError::Configuration("a downgrade patch is required but no patcher is configured".into())
        })?;
        if config.game_dir.as_os_str().is_empty() {
            return Err(InstallError::Configuration(
                "a downgrade patch is required but no base game directory is configured".into(),
            ));
        }
        let from = run.state.installed_game_version.clone().unwrap_or_default();
        let mirrors = self.mirrors.patch_mirrors(&from, target);
        if mirrors.is_empty() {
            return Err(PatchError::NoMirrors {
                from,
                to: target.to_owned(),
            }
            .into());
        }
        info!("install: downgrading base game {from} -> {target}");
        patcher::apply_patch(&patcher, &config.game_dir, &mirrors, cancel).await?;
        markers::write_marker(
            &config.game_dir,
            ProductKind::Game,
            &VersionMarker::new(target, None),
        )?;
        run.state.installed_game_version = Some(target.to_owned());
        Ok(())
    }

    async fn copy_game(
        &self,
        run: &mut Run<'_>,
        config: &LauncherConfig,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, InstallError> {
        let dest = run.state.destination.clone();
        run.enter(InstallPhase::ResolvingVersion);
        run.state.using_vendor_install = true;
        let vendor = config
            .vendor_game_dir
            .clone()
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| InstallError::Configuration("no vendor game directory configured".into()))?;
        if !vendor.is_dir() {
            return Err(InstallError::Configuration(format!(
                "vendor game directory {} does not exist",
                vendor.display()
            )));
        }
        let version = match &run.state.requested {
            VersionTarget::Exact(version) => version.clone(),
            VersionTarget::Latest => config.vendor_game_version.clone().ok_or_else(|| {
                InstallError::Configuration("vendor game version is unknown".into())
            })?,
        };
        run.state.resolved_version = Some(version.clone());
        run.state.installed_version = markers::installed_version(&dest, ProductKind::Game);
        if let Some(installed) = run.state.installed_version.clone()
            && same_version(&installed, &version)
        {
            info!("install: base game already at {installed}");
            return Ok(InstallOutcome::AlreadyCurrent { version: installed });
        }

        run.enter(InstallPhase::Extracting);
        markers::mark_incomplete(&dest, ProductKind::Game)?;
        let copied = {
            let tx = run.events.clone();
            let token = cancel.clone();
            let target = dest.clone();
            tokio::task::spawn_blocking(move || {
                let mut sink = move |fraction: f32| {
                    let _ = tx.send(InstallEvent::ExtractProgress(fraction));
                };
                files::copy_tree(&vendor, &target, &mut sink, &token)
            })
            .await
            .map_err(|err| InstallError::Io(io::Error::other(err)))?
        };
        let copied = match copied {
            Ok(copied) => copied,
            Err(_) if cancel.is_cancelled() => return Err(InstallError::Cancelled),
            Err(err) => return Err(err.into()),
        };
        info!("install: copied {copied} base game files into {}", dest.display());

        run.enter(InstallPhase::Finalizing);
        markers::write_marker(&dest, ProductKind::Game, &VersionMarker::new(&version, None))?;
        markers::clear_incomplete(&dest, ProductKind::Game)?;
        Ok(InstallOutcome::Completed { version })
    }

    /// Whether the feed offers a newer release than the installed one that still fits what
    /// is installed around it.
    ///
    /// Returns `Disabled` when update checks are off. A feed read within the configured
    /// interval is not repeated unless `force` is set.
    pub async fn check_for_update(
        &self,
        product: ProductKind,
        force: bool,
    ) -> Result<UpdateCheck, InstallError> {
        let config = self.config.current();
        if !config.check_for_updates {
            debug!("updates: checks are disabled");
            return Ok(UpdateCheck::Disabled);
        }
        let interval = TimeDelta::hours(i64::from(config.update_check_interval_hours));
        if !force
            && let Some(last_checked) = config.last_checked.get(product)
            && Utc::now() - last_checked < interval
        {
            debug!("updates: {product} feed read at {last_checked}, skipping");
            return Ok(UpdateCheck::Skipped { last_checked });
        }

        let operation = match product {
            ProductKind::Client => Operation::UpdateClient,
            ProductKind::Server => Operation::UpdateServer,
            ProductKind::Mods => Operation::InstallMods,
            ProductKind::Game => Operation::InstallGameCopy,
        };
        let mut state = InstallProcessState::new(
            &InstallRequest::new(operation),
            destination_for(&config, product),
            false,
        );
        let client_game_version = detect_installed(&config, &mut state);
        let Some(installed) = state.installed_version.clone() else {
            return Ok(UpdateCheck::NotInstalled);
        };

        let resolution = self.releases(product).await?;
        if let Some(err) = &resolution.error {
            return Err(InstallError::NoReleases(err.clone()));
        }
        let latest = select_candidate(&resolution, &state, client_game_version.as_deref())?
            .version()
            .to_owned();
        if compare_versions(&latest, &installed) == Ordering::Greater {
            info!("updates: {product} {latest} available (installed {installed})");
            Ok(UpdateCheck::Available { installed, latest })
        } else {
            Ok(UpdateCheck::UpToDate { installed })
        }
    }

    fn touch_last_checked(&self, product: ProductKind) {
        let now = Utc::now();
        self.config.update(|config| config.last_checked.set(product, now));
    }
}

/// Record the installed versions around `state`'s product. Returns the game version the
/// installed client was built for.
fn detect_installed(config: &LauncherConfig, state: &mut InstallProcessState) -> Option<String> {
    state.installed_version = markers::installed_version(&state.destination, state.product());
    let client_marker = if markers::is_incomplete(&config.client_dir, ProductKind::Client) {
        None
    } else {
        markers::read_marker(&config.client_dir, ProductKind::Client)
    };
    state.installed_client_version = client_marker.as_ref().map(|m| m.version.clone());
    state.installed_game_version = markers::installed_version(&config.game_dir, ProductKind::Game)
        .or_else(|| config.vendor_game_version.clone());
    client_marker.and_then(|m| m.compatible_with)
}

/// Pick the release a request targets.
///
/// `Latest` prefers the first entry compatible with what is installed: the client's game
/// version for the server, the client release for mods, and the base game for the client.
/// A client with no compatible entry falls back to the newest one and is patched later.
fn select_candidate<'r>(
    resolution: &'r Resolution,
    state: &InstallProcessState,
    client_game_version: Option<&str>,
) -> Result<&'r ReleaseCandidate, InstallError> {
    let product = state.product();
    let Some(latest) = resolution.latest() else {
        let detail = match &resolution.error {
            Some(err) => err.clone(),
            None => format!(
                "{} {product} release(s) rejected, none usable",
                resolution.rejected.len()
            ),
        };
        return Err(InstallError::NoReleases(detail));
    };
    if let VersionTarget::Exact(version) = &state.requested {
        return resolution
            .find(version)
            .ok_or_else(|| InstallError::NoReleases(format!("{product} release {version} not found")));
    }
    let pinned = match product {
        ProductKind::Server => client_game_version,
        ProductKind::Mods => state.installed_client_version.as_deref(),
        ProductKind::Client => state.installed_game_version.as_deref(),
        ProductKind::Game => None,
    };
    let Some(pinned) = pinned else {
        return Ok(latest);
    };
    match resolution.first_compatible_with(pinned) {
        Some(candidate) => Ok(candidate),
        None if product == ProductKind::Client => Ok(latest),
        None => Err(InstallError::NoReleases(format!(
            "no {product} release works with version {pinned}"
        ))),
    }
}

fn needs_downgrade(game_version: Option<&str>, compatible: &str) -> bool {
    let Some(game) = game_version else {
        return false;
    };
    match compare_versions(game, compatible) {
        Ordering::Greater => true,
        Ordering::Less => {
            warn!("install: base game {game} is older than the required {compatible}");
            false
        }
        Ordering::Equal => false,
    }
}

/// Keeps an existing backup: it belongs to an interrupted run and holds the user's files.
fn backup_settings(dest: &Path, product: ProductKind) -> Result<(), InstallError> {
    let Some(subdir) = product.settings_subdir() else {
        return Ok(());
    };
    let source = dest.join(subdir);
    let backup = settings_backup_dir(dest, product);
    if !source.is_dir() || backup.exists() {
        return Ok(());
    }
    let copied = files::copy_tree(&source, &backup, &mut |_| {}, &CancellationToken::new())?;
    info!("install: saved {copied} settings files from {}", source.display());
    Ok(())
}

fn restore_settings(dest: &Path, product: ProductKind) -> Result<(), InstallError> {
    let Some(subdir) = product.settings_subdir() else {
        return Ok(());
    };
    let backup = settings_backup_dir(dest, product);
    if !backup.is_dir() {
        return Ok(());
    }
    let restored =
        files::copy_tree(&backup, &dest.join(subdir), &mut |_| {}, &CancellationToken::new())?;
    files::remove_dir_if_exists(&backup)?;
    info!("install: restored {restored} settings files");
    Ok(())
}

fn notification_for(operation: Operation, outcome: &InstallOutcome) -> Notification {
    let name = operation.product().display_name();
    match outcome {
        InstallOutcome::Completed { version } => Notification::success(
            format!("{name} ready"),
            format!("Installed version {version}."),
        ),
        InstallOutcome::AlreadyCurrent { version } => Notification::info(
            format!("{name} up to date"),
            format!("Version {version} is already installed."),
        ),
        InstallOutcome::Cancelled => Notification::warning(
            format!("{name} cancelled"),
            format!("The {operation} run was cancelled."),
        ),
        InstallOutcome::Failed(reason) => {
            Notification::error(format!("{name} failed"), reason.to_string())
        }
    }
}

fn finish(
    events: &UnboundedSender<InstallEvent>,
    operation: Operation,
    outcome: InstallOutcome,
) -> InstallOutcome {
    let phase = outcome.terminal_phase();
    match &outcome {
        InstallOutcome::Failed(reason) => warn!("install: {operation} failed: {reason}"),
        other => info!("install: {operation} finished: {other:?}"),
    }
    let _ = events.send(InstallEvent::Phase { operation, phase });
    let _ = events.send(InstallEvent::Notification(notification_for(operation, &outcome)));
    let _ = events.send(InstallEvent::Finished(outcome.clone()));
    outcome
}
