//! Client configuration.

use crate::upload::transport::TransportMode;
use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use reel_core::{DEFAULT_CHUNK_SIZE, DEFAULT_CHUNKED_THRESHOLD, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Keys that may be set through `REEL_*` environment variables.
const ENV_KEYS: &[&str] = &[
    "server",
    "token",
    "chunk_size",
    "chunked_threshold",
    "retry_base_delay_ms",
    "resume_cache",
    "transport",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Bytes per chunk on the chunked path.
    pub chunk_size: u64,
    /// Files larger than this use the chunked path.
    pub chunked_threshold: u64,
    /// Backoff unit in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Resume cache location (default: next to the config file).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_cache: Option<PathBuf>,
    pub transport: TransportMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunked_threshold: DEFAULT_CHUNKED_THRESHOLD,
            retry_base_delay_ms: 1000,
            resume_cache: None,
            transport: TransportMode::Auto,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!("chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes");
        }
        Ok(())
    }

    /// Resume cache path, defaulting to `resume.json` beside the config file.
    pub fn resume_cache_path(&self, config_path: &Path) -> PathBuf {
        match &self.resume_cache {
            Some(path) => path.clone(),
            None => config_path
                .parent()
                .map(|dir| dir.join("resume.json"))
                .unwrap_or_else(|| PathBuf::from("resume.json")),
        }
    }
}

pub fn client_config_path(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }

    if let Some(path) = std::env::var_os("REEL_CLIENT_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(path) => PathBuf::from(path),
        None => {
            let home = std::env::var_os("HOME")
                .ok_or_else(|| anyhow::anyhow!("HOME not set; set REEL_CLIENT_CONFIG"))?;
            PathBuf::from(home).join(".config")
        }
    };

    Ok(base.join("reel").join("client.toml"))
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("REEL_").only(ENV_KEYS));

    let config: ClientConfig = figment
        .extract()
        .context("failed to load client configuration")?;
    config.validate()?;
    Ok(config)
}

pub async fn save_client_config(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = toml::to_string_pretty(config)?;

    tokio::fs::write(path, contents).await?;

    // The file holds a token.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    Ok(())
}

/// Token from the flag, or from stdin when asked.
pub fn read_token(token: Option<String>, token_stdin: bool) -> Result<String> {
    if let Some(token) = token {
        return Ok(token);
    }
    if token_stdin {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        let token = buf.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("token read from stdin is empty");
        }
        return Ok(token);
    }
    anyhow::bail!("token required: use --token or --token-stdin");
}

pub fn normalize_base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw).with_context(|| format!("invalid server URL: {raw}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("server URL must start with http:// or https://");
    }
    Ok(raw.trim_end_matches('/').to_string())
}
