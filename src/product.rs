use std::fmt;

use serde::{Deserialize, Serialize};

/// Something the launcher installs and tracks with a version marker.
///
/// The declaration order is the order install locks are taken in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Client,
    Server,
    Mods,
    /// Launcher-owned copy of the vendor game.
    Game,
}

impl ProductKind {
    pub fn label(self) -> &'static str {
        match self {
            ProductKind::Client => "client",
            ProductKind::Server => "server",
            ProductKind::Mods => "mods",
            ProductKind::Game => "game",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProductKind::Client => "Game client",
            ProductKind::Server => "Game server",
            ProductKind::Mods => "Mod set",
            ProductKind::Game => "Base game",
        }
    }

    /// Directory (relative to the install root) carried over on reinstall.
    pub fn settings_subdir(self) -> Option<&'static str> {
        match self {
            ProductKind::Client => Some("BepInEx/config"),
            ProductKind::Server => Some("user"),
            ProductKind::Mods | ProductKind::Game => None,
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
