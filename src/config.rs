use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Minimum time between two watcher events for the same path.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Capacity of the watcher's event queue.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Drop and recreate the cache before the boot refresh.
    #[serde(default = "default_true")]
    pub reset_cache_on_start: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            event_buffer: default_event_buffer(),
            reset_cache_on_start: true,
        }
    }
}

impl GeneralConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    1000
}
fn default_event_buffer() -> usize {
    2
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Custom path for token storage
    pub token_path: Option<PathBuf>,
}

impl AuthConfig {
    /// Only commands that talk to Box need credentials.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            anyhow::bail!("auth.client_id must not be empty");
        }
        if self.client_secret.is_empty() {
            anyhow::bail!("auth.client_secret must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Local sync root [default: ~/Box Sync]
    pub local_root: Option<PathBuf>,
    /// Name of the sync folder directly under the Box account root.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// Cache database [default: ~/.boxsync_cache.db]
    pub db_path: Option<PathBuf>,
    /// Glob patterns matched against base names: `*`, `?` and `[...]`.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Literal paths excluded together with everything below them.
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: None,
            remote_root: default_remote_root(),
            db_path: None,
            exclude: default_exclude(),
            exclude_paths: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn local_root(&self) -> Result<PathBuf> {
        match &self.local_root {
            Some(p) => Ok(p.clone()),
            None => {
                let home = dirs::home_dir().context("Could not determine home directory")?;
                Ok(home.join(default_remote_root()))
            }
        }
    }
}

fn default_remote_root() -> String {
    "Box Sync".into()
}
fn default_exclude() -> Vec<String> {
    vec![format!("*{}", crate::box_api::TEMP_SUFFIX)]
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("boxsync").join("config.toml"))
}

/// Load the config file. A missing file at the default location yields the
/// defaults; a missing file given explicitly is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path()?, false),
    };

    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    if config.general.event_buffer == 0 {
        anyhow::bail!("general.event_buffer must be at least 1");
    }
    for pattern in &config.sync.exclude {
        crate::sync::exclude::validate_pattern(pattern)?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.general.debounce(), Duration::from_secs(1));
        assert_eq!(cfg.general.event_buffer, 2);
        assert!(cfg.general.reset_cache_on_start);
        assert_eq!(cfg.sync.remote_root, "Box Sync");
        assert_eq!(cfg.sync.exclude, vec!["*.boxsync.tmp".to_string()]);
        assert!(cfg.auth.validate().is_err());
    }

    #[test]
    fn full_file_parses() {
        let cfg = parse_config(
            r#"
            [general]
            debounce_ms = 250
            event_buffer = 8
            reset_cache_on_start = false

            [auth]
            client_id = "id"
            client_secret = "secret"
            token_path = "/tmp/tokens.json"

            [sync]
            local_root = "/home/me/Box"
            remote_root = "Work"
            db_path = "/tmp/cache.db"
            exclude = ["*.swp", ".DS_Store"]
            exclude_paths = ["/home/me/Box/build"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.general.debounce(), Duration::from_millis(250));
        assert!(!cfg.general.reset_cache_on_start);
        cfg.auth.validate().unwrap();
        assert_eq!(cfg.auth.token_path, Some(PathBuf::from("/tmp/tokens.json")));
        assert_eq!(cfg.sync.local_root().unwrap(), PathBuf::from("/home/me/Box"));
        assert_eq!(cfg.sync.remote_root, "Work");
        assert_eq!(cfg.sync.exclude.len(), 2);
        assert_eq!(cfg.sync.exclude_paths, vec![PathBuf::from("/home/me/Box/build")]);
    }

    #[test]
    fn rejects_unknown_keys_and_empty_buffer() {
        assert!(parse_config("[general]\ndebounce = 5\n").is_err());
        assert!(parse_config("[general]\nevent_buffer = 0\n").is_err());
        assert!(parse_config("[sync]\nexclude = [\"[oops\"]\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nremote_root = \"Team\"\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().sync.remote_root, "Team");
    }
}
