//! Gateway configuration (`strand.toml`).

use std::path::Path;

use serde::Deserialize;

use strand_domain::config::{ConfigIssue, ConfigSeverity};
use strand_domain::EngineConfig;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    /// Engine constant overrides; anything omitted keeps its default.
    pub engine: EngineConfig,
    pub workpool: WorkpoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Default `RUST_LOG`-style filter when the env var is unset.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8639".into(),
            log_filter: "info,strand_gateway=debug".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkpoolConfig {
    /// Max concurrent stream handlers; 0 disables the pool (direct spawn).
    pub max_concurrent_streams: usize,
    /// Max concurrent tool executions; 0 disables the pool.
    pub max_concurrent_tools: usize,
}

impl Default for WorkpoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 0,
            max_concurrent_tools: 8,
        }
    }
}

impl GatewayConfig {
    /// Load from `path` when it exists, else defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = self.engine.validate();
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!("server.bind is not a socket address: {}", self.server.bind),
            });
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.server.bind, "127.0.0.1:8639");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = GatewayConfig::load(Path::new("/nonexistent/strand.toml")).unwrap();
        assert_eq!(config.engine.throttle_ms, 250);
    }

    #[test]
    fn partial_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[server]\nbind = \"0.0.0.0:9000\"\n\n[engine]\nthrottle_ms = 100\n"
        )
        .unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.engine.throttle_ms, 100);
        // Untouched engine defaults survive.
        assert_eq!(config.engine.timeout_interval_ms, 600_000);
    }

    #[test]
    fn bad_bind_is_an_error() {
        let config = GatewayConfig {
            server: ServerConfig {
                bind: "not-an-addr".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }
}
