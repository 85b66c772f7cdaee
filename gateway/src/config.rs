//! netdiag gateway configuration loading and parsing

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netdiag_tools::{Tool, ToolTable};

use crate::session::SessionConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/netdiag/config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// `[session]`, turned into a [`SessionConfig`] at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_invocations: usize,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
    #[serde(default = "default_teardown_grace")]
    pub teardown_grace_seconds: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            max_concurrent_invocations: default_max_concurrent(),
            write_timeout_seconds: default_write_timeout(),
            teardown_grace_seconds: default_teardown_grace(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(s: &SessionSettings) -> Self {
        SessionConfig {
            idle_timeout: Duration::from_secs(s.idle_timeout_seconds),
            max_concurrent: s.max_concurrent_invocations,
            write_timeout: Duration::from_secs(s.write_timeout_seconds),
            teardown_grace: Duration::from_secs(s.teardown_grace_seconds),
            event_buffer: s.event_buffer,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_command_timeout(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Optional executable overrides; unset tools keep the host default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    pub ping_path: Option<PathBuf>,
    pub dig_path: Option<PathBuf>,
    pub traceroute_path: Option<PathBuf>,
}

impl ToolsConfig {
    pub fn apply(&self, table: ToolTable) -> ToolTable {
        [
            (Tool::Ping, &self.ping_path),
            (Tool::Dig, &self.dig_path),
            (Tool::Traceroute, &self.traceroute_path),
        ]
        .into_iter()
        .fold(table, |table, (tool, path)| match path {
            Some(path) => table.with_executable(tool, path),
            None => table,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    5
}
fn default_write_timeout() -> u64 {
    10
}
fn default_teardown_grace() -> u64 {
    5
}
fn default_event_buffer() -> usize {
    64
}
fn default_command_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_requests_per_minute() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".into()
}

/// Where the configuration came from, reported once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// The path that was tried and not found.
    Defaults(PathBuf),
}

impl GatewayConfig {
    /// Parse from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply a `PORT` environment value, if any.
    pub fn apply_port_override(&mut self, port: Option<&str>) -> Result<()> {
        if let Some(port) = port.map(str::trim).filter(|p| !p.is_empty()) {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PORT value: {port}"))?;
        }
        Ok(())
    }

    /// Reject values that would leave the gateway unable to serve anything.
    pub fn validate(&self) -> Result<()> {
        if self.session.max_concurrent_invocations == 0 {
            bail!("session.max_concurrent_invocations must be at least 1");
        }
        if self.session.event_buffer == 0 {
            bail!("session.event_buffer must be at least 1");
        }
        if self.executor.timeout_seconds == 0 {
            bail!("executor.timeout_seconds must be at least 1");
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            bail!("rate_limit.requests_per_minute must be at least 1 when enabled");
        }
        Ok(())
    }
}

/// Load configuration from `NETDIAG_CONFIG` (or the default path), then
/// apply the `PORT` override.
pub fn load_config() -> Result<(GatewayConfig, ConfigSource)> {
    let config_path = PathBuf::from(
        std::env::var("NETDIAG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );

    let (mut config, source) = if config_path.exists() {
        (
            GatewayConfig::from_file(&config_path)?,
            ConfigSource::File(config_path),
        )
    } else {
        (GatewayConfig::default(), ConfigSource::Defaults(config_path))
    };

    config.apply_port_override(std::env::var("PORT").ok().as_deref())?;
    config.validate()?;
    Ok((config, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netdiag_tools::HostOs;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.session.max_concurrent_invocations, 5);
        assert_eq!(config.executor.timeout(), Duration::from_secs(60));
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.requests_per_minute, 10);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[server]
port = 9000

[session]
idle_timeout_seconds = 30
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.shutdown_timeout_seconds, 5);
        assert_eq!(config.session.idle_timeout_seconds, 30);
        assert_eq!(config.session.write_timeout_seconds, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
bind_address = "127.0.0.1"
port = 8081
shutdown_timeout_seconds = 3
allowed_origins = ["https://diag.example.com"]

[session]
idle_timeout_seconds = 120
max_concurrent_invocations = 2
write_timeout_seconds = 5
teardown_grace_seconds = 1
event_buffer = 16

[executor]
timeout_seconds = 20

[tools]
dig_path = "/opt/bind/bin/dig"

[rate_limit]
enabled = false
requests_per_minute = 100

[logging]
level = "debug"
format = "json"
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.allowed_origins, vec!["https://diag.example.com"]);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.logging.format, LogFormat::Json);

        let session = SessionConfig::from(&config.session);
        assert_eq!(session.max_concurrent, 2);
        assert_eq!(session.idle_timeout, Duration::from_secs(120));
        assert_eq!(session.teardown_grace, Duration::from_secs(1));

        let table = config.tools.apply(ToolTable::for_os(HostOs::Linux));
        assert_eq!(
            table.spec(Tool::Dig).unwrap().executable,
            PathBuf::from("/opt/bind/bin/dig")
        );
        assert_eq!(
            table.spec(Tool::Ping).unwrap().executable,
            PathBuf::from("/usr/bin/ping")
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[executor]\ntimeout_seconds = 15\n").unwrap();
        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.executor.timeout_seconds, 15);

        fs::write(&path, "[executor\n").unwrap();
        let err = GatewayConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_port_override() {
        let mut config = GatewayConfig::default();
        config.apply_port_override(None).unwrap();
        assert_eq!(config.server.port, 8080);
        config.apply_port_override(Some("9191")).unwrap();
        assert_eq!(config.server.port, 9191);
        assert!(config.apply_port_override(Some("not-a-port")).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = GatewayConfig::default();
        config.session.max_concurrent_invocations = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.rate_limit.requests_per_minute = 0;
        assert!(config.validate().is_err());
        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());
    }
}
