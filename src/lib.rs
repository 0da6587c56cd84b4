//! Core of the SPT launcher: a supervisor for the game client and server processes and
//! an install/update pipeline built from a release resolver, a mirror selector and a
//! transfer engine.

pub mod config;
pub mod env;
pub mod install;
pub mod mirrors;
pub mod notify;
pub mod process;
pub mod product;
pub mod releases;
pub mod transfer;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::{ConfigStore, LauncherConfig};
pub use install::{InstallEvent, InstallOutcome, InstallRequest, Operation, Orchestrator};
pub use process::{ClientProcess, RunningState, ServerProcess};
pub use product::ProductKind;
