use crate::vault::config::env_keys;
use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VaultpipePaths {
    pub home: PathBuf,
    pub bookmarks_dir: PathBuf,
    pub config_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_path(var: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => None,
    }
}

pub fn resolve_paths() -> Result<VaultpipePaths> {
    let home = match env_path(env_keys::HOME) {
        Some(path) => path,
        None => required_home_dir()?.join(".vaultpipe"),
    };
    let bookmarks_dir =
        env_path(env_keys::BOOKMARK_DIR).unwrap_or_else(|| home.join("bookmarks"));
    let config_file =
        env_path(env_keys::CONFIG_PATH).unwrap_or_else(|| home.join("config.toml"));

    Ok(VaultpipePaths {
        home,
        bookmarks_dir,
        config_file,
    })
}
