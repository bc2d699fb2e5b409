//! Configuration management with XDG paths
//!
//! ~/.config/ntquery/config.json   - bridge URL, pacing, OAuth client (0600)
//! ~/.local/state/ntquery/         - Persisted client keys (store.json)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "ntquery";

pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:8787";

/// Get config directory (~/.config/ntquery/)
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join(APP_NAME))
}

/// Get state directory (~/.local/state/ntquery/)
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .context("Could not determine state directory")?;
    Ok(base.join(APP_NAME))
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Get persisted key store path
pub fn store_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("store.json"))
}

/// Ensure all directories exist
pub fn ensure_dirs() -> Result<()> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(state_dir()?)?;
    Ok(())
}

/// OAuth client used by the model-driven backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bridge endpoint as typed by the user
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    /// Minimum spacing between rendered blocks
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Connectivity auto-retry period
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Delay before the synthetic session-start block appears
    #[serde(default = "default_session_start_delay_ms")]
    pub session_start_delay_ms: u64,

    /// Number of documentation snippets put in the planner prompt
    #[serde(default = "default_doc_limit")]
    pub doc_limit: usize,

    /// Path or URL of an API.md describing the library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_source: Option<String>,

    /// OpenRouter key for the bridge's planning backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openrouter_api_key: Option<String>,

    #[serde(default = "default_code_assist_url")]
    pub code_assist_url: String,

    #[serde(default)]
    pub oauth: OAuthConfig,
}

fn default_bridge_url() -> String { DEFAULT_BRIDGE_URL.to_string() }
fn default_pacing_ms() -> u64 { 500 }
fn default_retry_interval_ms() -> u64 { 2000 }
fn default_session_start_delay_ms() -> u64 { 1000 }
fn default_doc_limit() -> usize { 8 }
fn default_code_assist_url() -> String { "https://cloudcode-pa.googleapis.com/v1internal".to_string() }
fn default_auth_url() -> String { "https://accounts.google.com/o/oauth2/v2/auth".to_string() }
fn default_token_url() -> String { "https://oauth2.googleapis.com/token".to_string() }
fn default_redirect_uri() -> String { "https://codeassist.google.com/authcode".to_string() }
fn default_scopes() -> Vec<String> {
    vec![
        "https://www.googleapis.com/auth/cloud-platform".to_string(),
        "https://www.googleapis.com/auth/userinfo.email".to_string(),
        "https://www.googleapis.com/auth/userinfo.profile".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            pacing_ms: default_pacing_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            session_start_delay_ms: default_session_start_delay_ms(),
            doc_limit: default_doc_limit(),
            docs_source: None,
            openrouter_api_key: None,
            code_assist_url: default_code_assist_url(),
            oauth: OAuthConfig::default(),
        }
    }
}

impl Config {
    /// Load config from disk, or return defaults; environment overrides apply
    pub fn load() -> Result<Self> {
        ensure_dirs()?;
        let mut cfg = Self::load_from(&config_path()?)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from an explicit path without touching the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to disk with secure permissions
    pub fn save(&self) -> Result<()> {
        ensure_dirs()?;
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, &content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Owner read/write only; the file can hold the OAuth secret and API key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Environment variables take precedence over the file
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("NTQUERY_BRIDGE_URL") {
            if !url.is_empty() {
                self.bridge_url = url;
            }
        }
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.is_empty() {
                self.openrouter_api_key = Some(key);
            }
        }
    }

    /// Set a single key by its user-facing name
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bridge" | "bridge_url" => self.bridge_url = normalize_endpoint(value),
            "pacing" | "pacing_ms" => {
                self.pacing_ms = value.parse().context("pacing_ms must be a number")?
            }
            "retry" | "retry_interval_ms" => {
                self.retry_interval_ms = value.parse().context("retry_interval_ms must be a number")?
            }
            "docs" | "docs_source" => self.docs_source = Some(value.to_string()),
            "doc_limit" => self.doc_limit = value.parse().context("doc_limit must be a number")?,
            "openrouter.key" | "openrouter_api_key" => {
                self.openrouter_api_key = Some(value.to_string())
            }
            "oauth.client_id" => self.oauth.client_id = value.to_string(),
            "oauth.client_secret" => self.oauth.client_secret = Some(value.to_string()),
            _ => anyhow::bail!(
                "Unknown config key: {}. Valid keys: bridge_url, pacing_ms, retry_interval_ms, \
                 docs_source, doc_limit, openrouter_api_key, oauth.client_id, oauth.client_secret",
                key
            ),
        }
        Ok(())
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Auto-retry period, clamped to 2..=5 seconds
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.clamp(2000, 5000))
    }

    pub fn session_start_delay(&self) -> Duration {
        Duration::from_millis(self.session_start_delay_ms)
    }
}

/// Trim whitespace and a trailing slash from an endpoint
pub fn normalize_endpoint(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let cfg = Config::default();
        assert_eq!(cfg.bridge_url, DEFAULT_BRIDGE_URL);
        assert_eq!(cfg.pacing(), Duration::from_millis(500));
        assert_eq!(cfg.doc_limit, 8);
        assert!(cfg.openrouter_api_key.is_none());
    }

    #[test]
    fn test_files_live_in_config_and_state_dirs() {
        let config = config_path().unwrap();
        let store = store_path().unwrap();
        assert!(config.ends_with("ntquery/config.json"));
        assert!(store.ends_with("ntquery/store.json"));
        assert_eq!(config.parent().unwrap(), config_dir().unwrap());
        assert_eq!(store.parent().unwrap(), state_dir().unwrap());
    }

    #[test]
    fn test_retry_interval_is_clamped() {
        let mut cfg = Config::default();
        cfg.retry_interval_ms = 100;
        assert_eq!(cfg.retry_interval(), Duration::from_secs(2));
        cfg.retry_interval_ms = 60_000;
        assert_eq!(cfg.retry_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"bridge_url": "http://10.0.0.2:9000"}"#).unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.bridge_url, "http://10.0.0.2:9000");
        assert_eq!(cfg.pacing_ms, 500);
        assert_eq!(cfg.oauth.token_url, default_token_url());
    }

    #[test]
    fn test_set_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = Config::default();
        cfg.set("bridge", " http://localhost:8787/ ").unwrap();
        cfg.set("pacing", "250").unwrap();
        assert!(cfg.set("nonsense", "1").is_err());
        cfg.save_to(&path).unwrap();

        let back = Config::load_from(&path).unwrap();
        assert_eq!(back.bridge_url, "http://localhost:8787");
        assert_eq!(back.pacing_ms, 250);
    }
}
