use crate::vault::config::env_keys;
use std::env;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    fn default_directive(self) -> &'static str {
        match self {
            Self::Quiet => "vaultpipe=warn",
            Self::Normal => "vaultpipe=info",
            Self::Verbose => "vaultpipe=debug",
        }
    }
}

fn filter_for(verbosity: Verbosity) -> EnvFilter {
    let from_vaultpipe_log = env::var(env_keys::LOG)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok());
    from_vaultpipe_log
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(verbosity.default_directive()))
}

/// Installs the stderr subscriber. Safe to call more than once.
pub fn init(verbosity: Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
