use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use spt_launcher::install::{InstallEvent, InstallLocks, InstallOutcome, InstallPhase, UpdateCheck};
use spt_launcher::notify::Severity;
use spt_launcher::process::profile_api::ProfileApi;
use spt_launcher::process::state_notification;
use spt_launcher::{
    ClientProcess, ConfigStore, InstallRequest, LauncherConfig, Operation, Orchestrator,
    ProductKind, RunningState, ServerProcess, env,
};

const DEFAULT_BACKEND: &str = "http://127.0.0.1:6969";

#[derive(Parser, Debug)]
#[command(
    name = "spt-launcher",
    author,
    version,
    about = "Headless launcher for installing, updating and running SPT"
)]
struct Cli {
    /// Configuration file (defaults to the launcher's app directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installable releases from a feed.
    Releases { product: FeedProduct },
    Install {
        product: InstallProduct,
        /// Exact release version instead of the latest compatible one.
        #[arg(long)]
        version: Option<String>,
        /// Keep existing settings files across the reinstall.
        #[arg(long)]
        copy_settings: bool,
    },
    Update {
        product: UpdateProduct,
    },
    /// Ask the feeds whether installed products have newer compatible releases.
    CheckUpdates {
        /// Read the feeds even if they were read recently.
        #[arg(long)]
        force: bool,
    },
    /// Start the server and stream its output until Ctrl+C.
    RunServer,
    /// Start the client, optionally connected to a backend.
    RunClient {
        #[arg(long)]
        backend: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Log in (registering if needed) to obtain a session.
        #[arg(long)]
        username: Option<String>,
    },
    ClearCache {
        kind: CacheKind,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FeedProduct {
    Client,
    Server,
    Mods,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum InstallProduct {
    Client,
    Server,
    Game,
    Mods,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum UpdateProduct {
    Client,
    Server,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CacheKind {
    Client,
    /// Only the client's temp cache.
    ClientLocal,
    Server,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(env::default_config_path);
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let store = ConfigStore::new(config);
    let revision = store.revision();

    let result = run(cli.command, &store).await;

    if store.revision() != revision
        && let Err(err) = save_config(&config_path, &store.current())
    {
        warn!("config: {err}");
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, store: &ConfigStore) -> Result<(), String> {
    let locks = InstallLocks::new();
    match command {
        Command::Releases { product } => {
            let product = match product {
                FeedProduct::Client => ProductKind::Client,
                FeedProduct::Server => ProductKind::Server,
                FeedProduct::Mods => ProductKind::Mods,
            };
            let orchestrator = Orchestrator::from_config(store.clone(), locks).await;
            let resolution = orchestrator
                .releases(product)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(err) = &resolution.error {
                return Err(format!("release feed unavailable: {err}"));
            }
            let installed = orchestrator.installed_version(product);
            for candidate in &resolution.candidates {
                let mark = match &installed {
                    Some(v) if v == candidate.version() => " (installed)",
                    _ => "",
                };
                println!(
                    "{:<12} works with {:<18} {}{mark}",
                    candidate.version(),
                    candidate.compatible_version(),
                    candidate.asset.name
                );
            }
            for (tag, reason) in &resolution.rejected {
                info!("releases: skipped {tag} ({reason:?})");
            }
            Ok(())
        }
        Command::Install {
            product,
            version,
            copy_settings,
        } => {
            let operation = match product {
                InstallProduct::Client => Operation::InstallClient,
                InstallProduct::Server => Operation::InstallServer,
                InstallProduct::Game => Operation::InstallGameCopy,
                InstallProduct::Mods => Operation::InstallMods,
            };
            let mut request = InstallRequest::new(operation);
            if let Some(version) = version {
                request = request.version(version);
            }
            if copy_settings {
                request = request.copy_settings(true);
            }
            run_install(store, locks, request).await
        }
        Command::Update { product } => {
            let operation = match product {
                UpdateProduct::Client => Operation::UpdateClient,
                UpdateProduct::Server => Operation::UpdateServer,
            };
            run_install(store, locks, InstallRequest::new(operation)).await
        }
        Command::CheckUpdates { force } => {
            let orchestrator = Orchestrator::from_config(store.clone(), locks).await;
            let mut products = vec![ProductKind::Client, ProductKind::Server];
            if store.current().mods_feed.is_some() {
                products.push(ProductKind::Mods);
            }
            for product in products {
                let check = orchestrator
                    .check_for_update(product, force)
                    .await
                    .map_err(|e| e.to_string())?;
                match check {
                    UpdateCheck::Disabled => {
                        println!("update checks are disabled in the configuration");
                        break;
                    }
                    UpdateCheck::Skipped { last_checked } => {
                        println!("{product}: feed read at {last_checked}, pass --force to read it again")
                    }
                    UpdateCheck::NotInstalled => println!("{product}: not installed"),
                    UpdateCheck::UpToDate { installed } => println!("{product}: {installed} is current"),
                    UpdateCheck::Available { installed, latest } => {
                        println!("{product}: {latest} available (installed {installed})")
                    }
                }
            }
            Ok(())
        }
        Command::RunServer => {
            let config = store.current();
            let server = ServerProcess::new(config.server_dir.clone(), Some(locks));
            run_server(&server).await
        }
        Command::RunClient {
            backend,
            session,
            username,
        } => {
            let config = store.current();
            let client = ClientProcess::new(config.client_dir.clone(), Some(locks));
            let backend = backend.unwrap_or_else(|| DEFAULT_BACKEND.to_owned());
            let session = match (session, username) {
                (Some(session), _) => Some(session),
                (None, Some(username)) => {
                    let api = ProfileApi::new(reqwest::Client::new(), &backend);
                    api.ensure_session(&username, "Standard")
                        .await
                        .map_err(|e| e.to_string())?
                }
                (None, None) => None,
            };
            run_client(&client, &backend, session.as_deref()).await
        }
        Command::ClearCache { kind } => {
            let config = store.current();
            let removed = match kind {
                CacheKind::Client => ClientProcess::new(config.client_dir.clone(), Some(locks))
                    .clear_cache(),
                CacheKind::ClientLocal => {
                    ClientProcess::new(config.client_dir.clone(), Some(locks)).clear_local_cache()
                }
                CacheKind::Server => ServerProcess::new(config.server_dir.clone(), Some(locks))
                    .clear_cache(),
            }
            .map_err(|e| e.to_string())?;
            if removed.is_empty() {
                println!("nothing to clear");
            }
            for path in removed {
                println!("removed {}", path.display());
            }
            Ok(())
        }
    }
}

async fn run_install(
    store: &ConfigStore,
    locks: InstallLocks,
    request: InstallRequest,
) -> Result<(), String> {
    let orchestrator = Orchestrator::from_config(store.clone(), locks).await;
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("install: cancelling");
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut last_tenth = [-1i32; 2];
        while let Some(event) = rx.recv().await {
            match event {
                InstallEvent::Phase { phase, .. } if !phase.is_terminal() => {
                    println!("== {}", phase_label(phase));
                }
                InstallEvent::DownloadProgress(f) => print_progress("download", f, &mut last_tenth[0]),
                InstallEvent::ExtractProgress(f) => print_progress("extract", f, &mut last_tenth[1]),
                InstallEvent::Notification(note) => {
                    println!("[{}] {}: {}", severity_tag(note.severity), note.title, note.message);
                }
                _ => {}
            }
        }
    });

    let outcome = orchestrator.run(request, &tx, &cancel).await;
    drop(tx);
    let _ = printer.await;
    match outcome {
        InstallOutcome::Completed { .. } | InstallOutcome::AlreadyCurrent { .. } => Ok(()),
        InstallOutcome::Cancelled => Err("cancelled".into()),
        InstallOutcome::Failed(reason) => Err(reason.to_string()),
    }
}

fn severity_tag(severity: Severity) -> &'static str {
    match severity {
        Severity::Success => "ok",
        Severity::Info => "info",
        Severity::Warning => "warn",
        Severity::Error => "error",
    }
}

fn print_progress(channel: &str, fraction: f32, last_tenth: &mut i32) {
    let tenth = (fraction * 10.0).floor() as i32;
    if tenth > *last_tenth {
        *last_tenth = tenth;
        println!("   {channel} {:>3.0}%", fraction * 100.0);
    }
}

fn phase_label(phase: InstallPhase) -> &'static str {
    match phase {
        InstallPhase::Idle => "idle",
        InstallPhase::ResolvingVersion => "resolving version",
        InstallPhase::SelectingMirror => "selecting mirror",
        InstallPhase::Downloading => "downloading",
        InstallPhase::Extracting => "extracting",
        InstallPhase::Patching => "patching",
        InstallPhase::Finalizing => "finalizing",
        InstallPhase::Complete => "complete",
        InstallPhase::Failed => "failed",
        InstallPhase::Cancelled => "cancelled",
    }
}

async fn run_server(server: &ServerProcess) -> Result<(), String> {
    let mut states = server.subscribe();
    let mut lines = server.attach_output();
    server.start_exclusive().await.map_err(|e| e.to_string())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(line) = lines.recv() => println!("{line}"),
            Some(state) = states.recv() => {
                if let Some(note) = state_notification(ProductKind::Server, state) {
                    println!("[{}] {}", severity_tag(note.severity), note.title);
                }
                if state < RunningState::Starting {
                    return match state {
                        RunningState::StoppedUnexpectedly => Err("server stopped unexpectedly".into()),
                        _ => Ok(()),
                    };
                }
            }
        }
    }
    server.stop().await.map_err(|e| e.to_string())
}

async fn run_client(
    client: &ClientProcess,
    backend: &str,
    session: Option<&str>,
) -> Result<(), String> {
    if client.is_unmanaged_instance_running() {
        return Err("the game client is already running".into());
    }
    let mut states = client.subscribe();
    match session {
        Some(session) => client.connect(backend, session).await,
        None => client.start(None).await,
    }
    .map_err(|e| e.to_string())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(state) = states.recv() => {
                if let Some(note) = state_notification(ProductKind::Client, state) {
                    println!("[{}] {}", severity_tag(note.severity), note.title);
                }
                if state < RunningState::Starting {
                    return match state {
                        RunningState::StoppedUnexpectedly => Err("client stopped unexpectedly".into()),
                        _ => Ok(()),
                    };
                }
            }
        }
    }
    client.stop().await.map_err(|e| e.to_string())
}

fn load_config(path: &Path) -> Result<LauncherConfig, String> {
    if !path.exists() {
        info!("config: {} not found, using defaults", path.display());
        return Ok(LauncherConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid config {}: {e}", path.display()))
}

fn save_config(path: &Path, config: &LauncherConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| e.to_string())?;
    fs::write(path, json).map_err(|e| format!("failed to write {}: {e}", path.display()))
}
