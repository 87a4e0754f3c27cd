use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    /// Per-tool overrides keyed by tool name (`nmap`, `dig`, ...).
    pub tools: HashMap<String, ToolOverride>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory of static UI assets served as the fallback route.
    pub ui_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            ui_dir: "ui".into(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on scans in `running` at once. `None` means unbounded.
    pub max_concurrent_scans: Option<usize>,
    /// Capacity of the runner -> executor line channel.
    pub output_buffer: usize,
    /// Capacity of each live observer's queue before it is evicted.
    pub observer_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: None,
            output_buffer: 100,
            observer_buffer: 256,
        }
    }
}

/// Replaces the binary and/or timeout of one external tool.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolOverride {
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ToolOverride {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config: {}", path.display()))
            }
        };
        let cfg = Self::from_yaml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(cfg)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        // An empty document deserializes to unit, not a mapping.
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.executor.max_concurrent_scans == Some(0) {
            bail!("executor.max_concurrent_scans must be greater than 0");
        }
        if self.executor.output_buffer == 0 || self.executor.observer_buffer == 0 {
            bail!("executor buffers must be greater than 0");
        }
        for (tool, o) in &self.tools {
            if o.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
                bail!("tools.{tool}.command must not be empty");
            }
            if o.timeout_secs == Some(0) {
                bail!("tools.{tool}.timeout_secs must be greater than 0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path().join("nope.yaml")).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.server.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let cfg = Config::from_yaml(
            r#"
server:
  port: 9090
executor:
  max_concurrent_scans: 4
tools:
  nmap:
    command: /opt/nmap/bin/nmap
    timeout_secs: 600
"#,
        )
        .unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.executor.max_concurrent_scans, Some(4));
        assert_eq!(cfg.executor.output_buffer, 100);
        let nmap = &cfg.tools["nmap"];
        assert_eq!(nmap.command.as_deref(), Some("/opt/nmap/bin/nmap"));
        assert_eq!(nmap.timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn zero_limits_rejected() {
        assert!(Config::from_yaml("executor:\n  max_concurrent_scans: 0\n").is_err());
        assert!(Config::from_yaml("tools:\n  dig:\n    timeout_secs: 0\n").is_err());
    }

    #[test]
    fn malformed_file_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server: [not, a, map").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.yaml"));
    }
}
