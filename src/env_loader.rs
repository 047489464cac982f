use crate::vault::config::env_keys;
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;

const ENV_PREFIX: &str = "VAULTPIPE_";

fn fallback_dotenv_path(
    vaultpipe_home: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    match vaultpipe_home {
        Some(home) => Some(home.join(".env")),
        None => Some(home_dir?.join(".vaultpipe/.env")),
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os(env_keys::HOME).map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

fn unknown_keys<I>(keys: I, known: &[&str]) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    keys.into_iter()
        .filter(|key| key.starts_with(ENV_PREFIX) && !known.contains(&key.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `VAULTPIPE_*` variables in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    unknown_keys(
        env::vars_os().filter_map(|(key, _)| key.into_string().ok()),
        env_keys::ALL,
    )
}
