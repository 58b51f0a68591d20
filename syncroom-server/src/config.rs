use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Service configuration, read from a YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Redis URL for the message bus. Without one the bus is in-process and
    /// cross-node sync is disabled.
    pub bus: Option<String>,
    /// Base URL of the account / metadata HTTP API. Without one the server
    /// uses fixed in-memory catalogs.
    pub api_base: Option<String>,
    /// Directory receiving the rolling log files.
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: None,
            api_base: None,
            log_dir: "log".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        serde_yaml::from_reader(file).context("failed to parse config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.bus.is_none());
        assert!(config.api_base.is_none());
        assert_eq!(config.log_dir, Path::new("log"));
    }

    #[test]
    fn config_fields_parse() {
        let config: Config = serde_yaml::from_str(
            "bus: redis://localhost:6379\napi_base: http://localhost:8080/api\nlog_dir: /var/log/syncroom\n",
        )
        .unwrap();
        assert_eq!(config.bus.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.api_base.as_deref(), Some("http://localhost:8080/api"));
        assert_eq!(config.log_dir, Path::new("/var/log/syncroom"));
    }
}
