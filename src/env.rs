use std::env;
use std::path::PathBuf;

/// Returns the root directory used by the launcher for its own state.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("spt-launcher")
}

pub fn default_config_path() -> PathBuf {
    default_app_dir().join("config.json")
}

pub fn default_client_dir() -> PathBuf {
    default_app_dir().join("client")
}

pub fn default_server_dir() -> PathBuf {
    default_app_dir().join("server")
}

pub fn default_game_dir() -> PathBuf {
    default_app_dir().join("game")
}

/// Temp cache the game client writes outside its install directory.
pub fn client_temp_cache_dir() -> PathBuf {
    env::temp_dir()
        .join("Battlestate Games")
        .join("EscapeFromTarkov")
}
