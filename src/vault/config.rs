use crate::error::VaultpipeError;
use crate::vault::paths::VaultpipePaths;
use crate::vault::transport;
use crate::vault::util::parse_byte_size;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 128 * MIB;
pub const MAX_PART_SIZE: u64 = 4096 * MIB;

/// Environment variables vaultpipe reads. Anything else with the
/// `VAULTPIPE_` prefix is reported as unknown at startup.
pub mod env_keys {
    pub const HOME: &str = "VAULTPIPE_HOME";
    pub const BOOKMARK_DIR: &str = "VAULTPIPE_BOOKMARK_DIR";
    pub const CONFIG_PATH: &str = "VAULTPIPE_CONFIG_PATH";
    pub const LOG: &str = "VAULTPIPE_LOG";
    pub const PART_SIZE: &str = "VAULTPIPE_PART_SIZE";
    pub const PIPE_BLOCK_SIZE: &str = "VAULTPIPE_PIPE_BLOCK_SIZE";
    pub const PIPE_DEPTH: &str = "VAULTPIPE_PIPE_DEPTH";
    pub const VERBOSE: &str = "VAULTPIPE_VERBOSE";
    pub const BACKEND: &str = "VAULTPIPE_BACKEND";
    pub const REGION: &str = "VAULTPIPE_REGION";
    pub const ENDPOINT: &str = "VAULTPIPE_ENDPOINT";
    pub const STORE_DIR: &str = "VAULTPIPE_STORE_DIR";
    pub const REQUEST_TIMEOUT_SECS: &str = "VAULTPIPE_REQUEST_TIMEOUT_SECS";

    pub const ALL: &[&str] = &[
        HOME,
        BOOKMARK_DIR,
        CONFIG_PATH,
        LOG,
        PART_SIZE,
        PIPE_BLOCK_SIZE,
        PIPE_DEPTH,
        VERBOSE,
        BACKEND,
        REGION,
        ENDPOINT,
        STORE_DIR,
        REQUEST_TIMEOUT_SECS,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Glacier,
    Local,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Glacier => "glacier",
            Self::Local => "local",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "glacier" => Some(Self::Glacier),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub part_size: u64,
    pub pipe_block_size: usize,
    pub pipe_depth: usize,
    pub verbose: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            pipe_block_size: transport::DEFAULT_BLOCK_SIZE,
            pipe_depth: transport::DEFAULT_DEPTH,
            verbose: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub region: String,
    pub endpoint: Option<String>,
    pub local_root: Option<PathBuf>,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Glacier,
            region: "us-east-1".to_string(),
            endpoint: None,
            local_root: None,
            request_timeout_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultpipeConfig {
    pub upload: UploadConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialVaultpipeConfig {
    upload: Option<UploadConfig>,
    store: Option<StoreConfig>,
}

/// Values supplied on the command line; they win over file and env.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub part_size: Option<u64>,
    pub backend: Option<StoreBackend>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub verbose: Option<bool>,
}

fn env_trimmed(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn env_or_size(var: &str, fallback: u64) -> Result<u64> {
    match env_trimmed(var) {
        Some(raw) => parse_byte_size(&raw).map_err(|err| anyhow!("{var}: {err}")),
        None => Ok(fallback),
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env_trimmed(var) {
        Some(v) => v.parse::<usize>().ok().unwrap_or(fallback),
        None => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env_trimmed(var) {
        Some(v) => v.parse::<u64>().ok().unwrap_or(fallback),
        None => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env_trimmed(var).as_deref() {
        Some("1" | "true" | "TRUE" | "yes" | "on") => true,
        Some("0" | "false" | "FALSE" | "no" | "off") => false,
        _ => fallback,
    }
}

/// Part sizes must be 1 MiB times a power of two, at most 4 GiB, so that
/// chunk boundaries line up with tree-hash leaves.
pub fn validate_part_size(size: u64) -> Result<()> {
    if size < MIB || size > MAX_PART_SIZE || size % MIB != 0 || !(size / MIB).is_power_of_two() {
        return Err(VaultpipeError::InvalidConfig(format!(
            "part size {size} must be 1 MiB multiplied by a power of two, up to 4 GiB"
        ))
        .into());
    }
    Ok(())
}

pub fn validate(cfg: &VaultpipeConfig) -> Result<()> {
    validate_part_size(cfg.upload.part_size)?;
    if usize::try_from(cfg.upload.part_size).is_err() {
        return Err(VaultpipeError::InvalidConfig(format!(
            "part size {} does not fit in memory on this platform",
            cfg.upload.part_size
        ))
        .into());
    }
    if cfg.upload.pipe_block_size == 0 {
        return Err(VaultpipeError::InvalidConfig("pipe block size must be >= 1".into()).into());
    }
    if cfg.upload.pipe_depth == 0 {
        return Err(VaultpipeError::InvalidConfig("pipe depth must be >= 1".into()).into());
    }
    if cfg.store.region.trim().is_empty() {
        return Err(VaultpipeError::InvalidConfig("region cannot be empty".into()).into());
    }
    if cfg.store.request_timeout_secs == 0 {
        return Err(
            VaultpipeError::InvalidConfig("request timeout must be >= 1 second".into()).into(),
        );
    }
    if cfg.store.backend == StoreBackend::Local && cfg.store.local_root.is_none() {
        return Err(VaultpipeError::InvalidConfig(
            "local backend requires a store directory (--store-dir or VAULTPIPE_STORE_DIR)".into(),
        )
        .into());
    }
    Ok(())
}

fn merge_file_config(base: &mut VaultpipeConfig, paths: &VaultpipePaths) -> Result<()> {
    let path = &paths.config_file;
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialVaultpipeConfig = toml::from_str(&raw).map_err(|err| {
        VaultpipeError::InvalidConfig(format!("failed to parse {}: {err}", path.display()))
    })?;
    if let Some(upload) = parsed.upload {
        base.upload = upload;
    }
    if let Some(store) = parsed.store {
        base.store = store;
    }
    Ok(())
}

fn merge_env(cfg: &mut VaultpipeConfig) -> Result<()> {
    cfg.upload.part_size = env_or_size(env_keys::PART_SIZE, cfg.upload.part_size)?;
    cfg.upload.pipe_block_size = env_or_size(
        env_keys::PIPE_BLOCK_SIZE,
        cfg.upload.pipe_block_size as u64,
    )? as usize;
    cfg.upload.pipe_depth = env_or_usize(env_keys::PIPE_DEPTH, cfg.upload.pipe_depth);
    cfg.upload.verbose = env_or_bool(env_keys::VERBOSE, cfg.upload.verbose);

    if let Some(raw) = env_trimmed(env_keys::BACKEND) {
        cfg.store.backend = StoreBackend::parse(&raw).ok_or_else(|| {
            VaultpipeError::InvalidConfig(format!(
                "{}: unknown backend `{raw}`; use `glacier` or `local`",
                env_keys::BACKEND
            ))
        })?;
    }
    if let Some(region) = env_trimmed(env_keys::REGION) {
        cfg.store.region = region;
    }
    if let Some(endpoint) = env_trimmed(env_keys::ENDPOINT) {
        cfg.store.endpoint = Some(endpoint);
    }
    if let Some(dir) = env_trimmed(env_keys::STORE_DIR) {
        cfg.store.local_root = Some(PathBuf::from(dir));
    }
    cfg.store.request_timeout_secs = env_or_u64(
        env_keys::REQUEST_TIMEOUT_SECS,
        cfg.store.request_timeout_secs,
    );
    Ok(())
}

fn apply_overrides(cfg: &mut VaultpipeConfig, overrides: &ConfigOverrides) {
    if let Some(part_size) = overrides.part_size {
        cfg.upload.part_size = part_size;
    }
    if let Some(verbose) = overrides.verbose {
        cfg.upload.verbose = verbose;
    }
    if let Some(backend) = overrides.backend {
        cfg.store.backend = backend;
    }
    if let Some(region) = &overrides.region {
        cfg.store.region = region.clone();
    }
    if let Some(endpoint) = &overrides.endpoint {
        cfg.store.endpoint = Some(endpoint.clone());
    }
    if let Some(dir) = &overrides.store_dir {
        cfg.store.local_root = Some(dir.clone());
    }
}

pub fn load_config(paths: &VaultpipePaths, overrides: &ConfigOverrides) -> Result<VaultpipeConfig> {
    let mut cfg = VaultpipeConfig::default();
    merge_file_config(&mut cfg, paths)?;
    merge_env(&mut cfg)?;
    apply_overrides(&mut cfg, overrides);
    validate(&cfg)?;
    Ok(cfg)
}
