//! Configuration for aware paths and engine settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AWARE_HOME)
//! 2. Config file (.aware/config.yaml)
//! 3. Defaults (~/.aware, built-in policy, sample network)
//!
//! Config file discovery:
//! - Searches current directory and parents for .aware/config.yaml
//! - Paths in config file are relative to the project root (the parent of .aware/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::audit_store::AuditBackend;
use crate::core::bus::DEFAULT_MAX_CASCADE_DEPTH;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .aware/)
    pub home: Option<String>,
    /// Base policy document replacing the built-in defaults
    pub policy_defaults: Option<String>,
    /// Site policy layered over the defaults
    pub policy: Option<String>,
    /// Network topology document
    pub network: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub backend: Option<AuditBackend>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub max_cascade_depth: Option<usize>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to aware home (audit trail, timelines)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub policy_defaults: Option<PathBuf>,
    pub policy: Option<PathBuf>,
    pub network: Option<PathBuf>,
    pub audit_backend: AuditBackend,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_cascade_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
        }
    }
}

impl ResolvedConfig {
    /// Directory holding the persisted audit trail
    pub fn audit_dir(&self) -> PathBuf {
        self.home.join("audit")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".aware").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine a parsed config file with the environment
fn resolve(config: ConfigFile, config_path: Option<PathBuf>, default_home: PathBuf) -> ResolvedConfig {
    let aware_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    // Project root is the parent of .aware/
    let base_dir = aware_dir.parent().unwrap_or(Path::new("."));

    let home = if let Ok(env_home) = std::env::var("AWARE_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = config.paths.home {
        resolve_path(aware_dir, home_path)
    } else {
        default_home
    };

    let resolve_opt = |p: &Option<String>| p.as_deref().map(|p| resolve_path(base_dir, p));

    ResolvedConfig {
        home,
        policy_defaults: resolve_opt(&config.paths.policy_defaults),
        policy: resolve_opt(&config.paths.policy),
        network: resolve_opt(&config.paths.network),
        audit_backend: config
            .audit
            .and_then(|a| a.backend)
            .unwrap_or_default(),
        engine: EngineSettings {
            max_cascade_depth: config
                .engine
                .and_then(|e| e.max_cascade_depth)
                .unwrap_or(DEFAULT_MAX_CASCADE_DEPTH),
        },
        config_file: config_path,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".aware");

    match find_config_file() {
        Some(config_path) => {
            let config = load_config_file(&config_path)?;
            Ok(resolve(config, Some(config_path), default_home))
        }
        None => Ok(resolve(ConfigFile::default(), None, default_home)),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the aware home directory
pub fn aware_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the audit directory ($AWARE_HOME/audit)
pub fn audit_dir() -> Result<PathBuf> {
    Ok(config()?.audit_dir())
}
