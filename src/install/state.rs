use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::mirrors::{Mirror, SourceAttempt};
use crate::notify::Notification;
use crate::product::ProductKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Copy the vendor game installation into the launcher's base-game directory.
    InstallGameCopy,
    InstallClient,
    InstallServer,
    InstallMods,
    UpdateClient,
    UpdateServer,
}

impl Operation {
    pub fn product(self) -> ProductKind {
        match self {
            Operation::InstallGameCopy => ProductKind::Game,
            Operation::InstallClient | Operation::UpdateClient => ProductKind::Client,
            Operation::InstallServer | Operation::UpdateServer => ProductKind::Server,
            Operation::InstallMods => ProductKind::Mods,
        }
    }

    /// Products whose directories the operation may write; a run holds a lock on each.
    ///
    /// Client runs can patch the base game, and the mod set lives inside the client tree.
    pub fn locked_products(self) -> &'static [ProductKind] {
        match self {
            Operation::InstallGameCopy => &[ProductKind::Game],
            Operation::InstallClient | Operation::UpdateClient => {
                &[ProductKind::Client, ProductKind::Game]
            }
            Operation::InstallServer | Operation::UpdateServer => &[ProductKind::Server],
            Operation::InstallMods => &[ProductKind::Client, ProductKind::Mods],
        }
    }

    pub fn is_update(self) -> bool {
        matches!(self, Operation::UpdateClient | Operation::UpdateServer)
    }

    pub fn label(self) -> &'static str {
        match self {
            Operation::InstallGameCopy => "install game copy",
            Operation::InstallClient => "install client",
            Operation::InstallServer => "install server",
            Operation::InstallMods => "install mods",
            Operation::UpdateClient => "update client",
            Operation::UpdateServer => "update server",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum VersionTarget {
    #[default]
    Latest,
    /// A release version as it appears in the feed, e.g. "3.10.1".
    Exact(String),
}

#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub operation: Operation,
    pub target: VersionTarget,
    /// Overrides the configured install directory for the product.
    pub destination: Option<PathBuf>,
    /// Overrides the configured copy-settings flag.
    pub copy_settings: Option<bool>,
}

impl InstallRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            target: VersionTarget::Latest,
            destination: None,
            copy_settings: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.target = VersionTarget::Exact(version.into());
        self
    }

    pub fn destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    pub fn copy_settings(mut self, copy: bool) -> Self {
        self.copy_settings = Some(copy);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallPhase {
    Idle,
    ResolvingVersion,
    SelectingMirror,
    Downloading,
    Extracting,
    Patching,
    Finalizing,
    Complete,
    Failed,
    Cancelled,
}

impl InstallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstallPhase::Complete | InstallPhase::Failed | InstallPhase::Cancelled
        )
    }
}

/// Working state of one run. Created per run, never shared between runs.
#[derive(Clone, Debug)]
pub struct InstallProcessState {
    pub operation: Operation,
    pub requested: VersionTarget,
    pub phase: InstallPhase,
    pub destination: PathBuf,
    pub resolved_version: Option<String>,
    pub compatible_version: Option<String>,
    pub installed_version: Option<String>,
    pub installed_client_version: Option<String>,
    pub installed_game_version: Option<String>,
    pub chosen_mirror: Option<Mirror>,
    pub using_vendor_install: bool,
    pub copy_settings: bool,
    pub needs_patch: bool,
}

impl InstallProcessState {
    pub fn new(request: &InstallRequest, destination: PathBuf, copy_settings: bool) -> Self {
        Self {
            operation: request.operation,
            requested: request.target.clone(),
            phase: InstallPhase::Idle,
            destination,
            resolved_version: None,
            compatible_version: None,
            installed_version: None,
            installed_client_version: None,
            installed_game_version: None,
            chosen_mirror: None,
            using_vendor_install: false,
            copy_settings,
            needs_patch: false,
        }
    }

    pub fn product(&self) -> ProductKind {
        self.operation.product()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The feed had no usable release (or none matching the request).
    NoReleases(String),
    /// Every download source failed, or none existed.
    NoSources(Vec<SourceAttempt>),
    /// An update was requested for a product that is not installed.
    NotInstalled(ProductKind),
    AlreadyInProgress(ProductKind),
    Extract(String),
    Patch(String),
    Configuration(String),
    Io(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoReleases(detail) => write!(f, "no installable release: {detail}"),
            FailureReason::NoSources(attempts) if attempts.is_empty() => {
                f.write_str("no download sources available")
            }
            FailureReason::NoSources(attempts) => {
                write!(f, "all {} download sources failed", attempts.len())
            }
            FailureReason::NotInstalled(product) => {
                write!(f, "{} is not installed", product.display_name())
            }
            FailureReason::AlreadyInProgress(product) => {
                write!(f, "an install of the {product} is already running")
            }
            FailureReason::Extract(detail) => write!(f, "extraction failed: {detail}"),
            FailureReason::Patch(detail) => write!(f, "patching failed: {detail}"),
            FailureReason::Configuration(detail) => write!(f, "configuration error: {detail}"),
            FailureReason::Io(detail) => write!(f, "file system error: {detail}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Completed { version: String },
    /// Nothing to do: the destination already holds the target version.
    AlreadyCurrent { version: String },
    Cancelled,
    Failed(FailureReason),
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InstallOutcome::Completed { .. } | InstallOutcome::AlreadyCurrent { .. }
        )
    }

    pub fn terminal_phase(&self) -> InstallPhase {
        match self {
            InstallOutcome::Completed { .. } | InstallOutcome::AlreadyCurrent { .. } => {
                InstallPhase::Complete
            }
            InstallOutcome::Cancelled => InstallPhase::Cancelled,
            InstallOutcome::Failed(_) => InstallPhase::Failed,
        }
    }
}

/// Answer of `Orchestrator::check_for_update`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Update checks are switched off in the configuration.
    Disabled,
    /// The feed was read less than the check interval ago.
    Skipped { last_checked: DateTime<Utc> },
    NotInstalled,
    UpToDate { installed: String },
    Available { installed: String, latest: String },
}

/// Everything a host can observe about a run, in emission order.
#[derive(Clone, Debug)]
pub enum InstallEvent {
    Phase {
        operation: Operation,
        phase: InstallPhase,
    },
    DownloadProgress(f32),
    ExtractProgress(f32),
    Notification(Notification),
    Finished(InstallOutcome),
}
