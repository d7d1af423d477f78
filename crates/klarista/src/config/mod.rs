use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "klarista.toml";
pub const DEFAULT_STATE_KEY: &str = "klarista.state.tar";
pub const DEFAULT_BUCKET_SUFFIX: &str = "-state";

fn default_state_key() -> String {
    DEFAULT_STATE_KEY.into()
}

fn default_bucket_suffix() -> String {
    DEFAULT_BUCKET_SUFFIX.into()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_new_cluster_secs() -> u64 {
    180
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    S3,
    Local,
}

impl Default for StateBackendKind {
    fn default() -> Self {
        Self::S3
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub tmp_dir: Option<String>,
    pub tmp_dir_env: Option<String>,
    pub assets_dir: Option<String>,
    pub assets_dir_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct S3StateConfig {
    pub profile: Option<String>,
    pub profile_env: Option<String>,
    pub region: Option<String>,
    pub region_env: Option<String>,
    pub endpoint_url: Option<String>,
    pub endpoint_url_env: Option<String>,
    pub aws_bin: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocalStateConfig {
    pub root: Option<String>,
    pub root_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackendKind,
    #[serde(default = "default_state_key")]
    pub key: String,
    #[serde(default = "default_bucket_suffix")]
    pub bucket_suffix: String,
    pub s3: S3StateConfig,
    pub local: LocalStateConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::S3,
            key: default_state_key(),
            bucket_suffix: default_bucket_suffix(),
            s3: S3StateConfig::default(),
            local: LocalStateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub terraform: String,
    pub kops: String,
    pub kubectl: String,
    pub bash: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            terraform: "terraform".into(),
            kops: "kops".into(),
            kubectl: "kubectl".into(),
            bash: "bash".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_new_cluster_secs")]
    pub new_cluster_secs: u64,
    /// Give up after this many failed readiness checks; 0 waits forever.
    pub max_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            new_cluster_secs: default_new_cluster_secs(),
            max_attempts: 0,
        }
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn new_cluster_grace(&self) -> Duration {
        Duration::from_secs(self.new_cluster_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct KlaristaConfig {
    pub workspace: WorkspaceConfig,
    pub state: StateConfig,
    pub tools: ToolsConfig,
    pub wait: WaitConfig,
}

impl KlaristaConfig {
    /// Parent directory for per-cluster staging directories.
    pub fn tmp_dir(&self) -> PathBuf {
        resolve_string_field(
            self.workspace.tmp_dir.as_deref(),
            self.workspace.tmp_dir_env.as_deref(),
        )
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
    }

    pub fn assets_dir(&self) -> PathBuf {
        resolve_string_field(
            self.workspace.assets_dir.as_deref(),
            self.workspace.assets_dir_env.as_deref(),
        )
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("assets"))
    }

    pub fn local_state_root(&self) -> Result<PathBuf> {
        resolve_string_field(
            self.state.local.root.as_deref(),
            self.state.local.root_env.as_deref(),
        )
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::config("state.local.root is empty (state.backend = \"local\" needs a root)")
        })
    }
}

pub fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

// Literal value first, then the named env var.
pub fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    let direct = literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    direct.or_else(|| resolve_env_ref(env_key))
}

pub fn parse(raw: &str) -> Result<KlaristaConfig> {
    let cfg: KlaristaConfig = toml::from_str(raw)?;
    if cfg.state.key.trim().is_empty() {
        return Err(Error::config("state.key must not be empty"));
    }
    Ok(cfg)
}

/// Load an explicit config file, or `klarista.toml` from the working directory
/// when present, or the defaults.
pub fn load(path: Option<&Path>) -> Result<KlaristaConfig> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    if !path.is_file() {
        if required {
            return Err(Error::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(KlaristaConfig::default());
    }
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::io(format!("failed to read config {}: {e}", path.display())))?;
    tracing::debug!("loaded config from {}", path.display());
    parse(&raw).map_err(|e| e.context(format!("TOML parse error in {}", path.display())))
}
