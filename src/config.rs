//! Runtime configuration consumed by the core.
//!
//! Resolution order for the config file:
//!   1. `--config` CLI flag
//!   2. `JOBWORKER_CONFIG` environment variable
//!   3. `$XDG_CONFIG_HOME/jobworker/config.toml`
//!   4. built-in defaults
//!
//! The cgroup root is additionally overridable by `JOBWORKER_CGROUP_ROOT`
//! and the `--cgroup-root` flag (applied by the CLI after load).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::Deserialize;

use crate::cgroup::DEFAULT_CGROUP_ROOT;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the per-job cgroup subtree.
    pub cgroup_root: PathBuf,
    /// Milliseconds between SIGTERM and SIGKILL in the stop protocol.
    pub stop_grace_ms: u64,
    /// Per-subscriber send-buffer bound, in chunks.
    pub subscriber_buffer: usize,
    /// Backlog in bytes beyond which a non-draining subscriber is dropped;
    /// 0 disables dropping.
    pub lag_threshold_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            stop_grace_ms: 5_000,
            subscriber_buffer: 64,
            lag_threshold_bytes: 128 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Load following the resolution chain. A file named by an explicit CLI
    /// flag must exist; a default-location file that is absent falls
    /// through to the built-in defaults.
    pub fn load(cli_path: Option<&str>) -> Result<Config> {
        let mut config = match resolve_config_path(cli_path) {
            Some(path) if path.exists() => Config::from_file(&path)?,
            Some(path) if cli_path.is_some() => {
                anyhow::bail!("config file not found: {}", path.display())
            }
            _ => Config::default(),
        };

        if let Ok(root) = std::env::var("JOBWORKER_CGROUP_ROOT")
            && !root.is_empty()
        {
            config.cgroup_root = PathBuf::from(root);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }
}

/// Resolve the config file path following the priority chain. `None` only
/// when no home directory can be determined.
pub fn resolve_config_path(cli_path: Option<&str>) -> Option<PathBuf> {
    // 1. CLI flag
    if let Some(path) = cli_path {
        return Some(PathBuf::from(path));
    }

    // 2. Environment variable
    if let Ok(path) = std::env::var("JOBWORKER_CONFIG")
        && !path.is_empty()
    {
        return Some(PathBuf::from(path));
    }

    // 3. XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Some(PathBuf::from(xdg).join("jobworker").join("config.toml"));
    }

    // 4. Default: platform config dir
    BaseDirs::new().map(|base| base.config_dir().join("jobworker").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_cli_flag_wins() {
        let path = resolve_config_path(Some("/tmp/my.toml")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/my.toml"));
    }

    #[test]
    fn resolve_env_then_xdg() {
        // One test covers both env steps of the chain so the mutations
        // cannot interleave across parallel test threads.
        // SAFETY: test-only; no other test in this crate mutates these vars.
        unsafe {
            std::env::set_var("JOBWORKER_CONFIG", "/tmp/env.toml");
            std::env::remove_var("XDG_CONFIG_HOME");
        }
        assert_eq!(
            resolve_config_path(None),
            Some(PathBuf::from("/tmp/env.toml"))
        );

        unsafe {
            std::env::remove_var("JOBWORKER_CONFIG");
            std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg");
        }
        assert_eq!(
            resolve_config_path(None),
            Some(PathBuf::from("/tmp/xdg/jobworker/config.toml"))
        );

        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
        assert_eq!(config.stop_grace(), Duration::from_millis(5_000));
        assert!(config.subscriber_buffer > 0);
    }

    #[test]
    fn partial_file_fills_missing_fields_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "stop_grace_ms = 250\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.stop_grace_ms, 250);
        assert_eq!(config.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "no_such_field = 1\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(Config::load(Some("/definitely/not/here.toml")).is_err());
    }
}
