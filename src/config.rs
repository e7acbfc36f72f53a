//! Configuration model and JSON file loading.
//!
//! The config file is a single JSON object. Missing optional keys take the
//! documented defaults; unknown keys are ignored with a warning so older
//! deployments keep working across upgrades. Validation failures are
//! configuration errors and abort startup.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Wire convention for a stdio connection.
///
/// `Auto` writes header frames until the peer's first frame reveals its
/// dialect; `Header` and `Newline` force the initial write convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    #[default]
    Auto,
    Header,
    Newline,
}

/// How to launch and talk to one upstream MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unique namespace token. Must not contain the tool separator or `:`.
    pub id: String,
    /// Argv of the child process; the first element is the executable.
    pub command: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Deadline for spawn plus initialize handshake.
    #[serde(
        default = "defaults::startup_timeout",
        deserialize_with = "seconds::deserialize"
    )]
    pub startup_timeout: Duration,
    /// Grace period for each stage of the shutdown escalation.
    #[serde(
        default = "defaults::shutdown_grace",
        deserialize_with = "seconds::deserialize"
    )]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub stdio_mode: StdioMode,
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub servers: Vec<ServerConfig>,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Per-request deadline for upstream calls.
    #[serde(
        default = "defaults::response_timeout",
        deserialize_with = "seconds::deserialize"
    )]
    pub response_timeout: Duration,
    /// Optional shared token; when set, every client request must present it
    /// in `params.proxy.authToken`.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Per-key request quota per rolling minute. Absent means unlimited.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub structured_logging: bool,
    /// Liveness probe period. Zero disables probing and supervised restart.
    #[serde(default = "defaults::zero", deserialize_with = "seconds::deserialize")]
    pub healthcheck_interval: Duration,
    #[serde(
        default = "defaults::healthcheck_timeout",
        deserialize_with = "seconds::deserialize"
    )]
    pub healthcheck_timeout: Duration,
    /// Separator between server id and original name in exposed tool and
    /// prompt names. Some clients forbid `:` in identifiers; they get `__`.
    #[serde(default = "defaults::tool_separator")]
    pub tool_separator: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            log_level: defaults::log_level(),
            response_timeout: defaults::response_timeout(),
            auth_token: None,
            rate_limit_per_minute: None,
            structured_logging: false,
            healthcheck_interval: defaults::zero(),
            healthcheck_timeout: defaults::healthcheck_timeout(),
            tool_separator: defaults::tool_separator(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn log_level() -> String {
        "INFO".to_string()
    }
    pub fn response_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn startup_timeout() -> Duration {
        Duration::from_secs(20)
    }
    pub fn shutdown_grace() -> Duration {
        Duration::from_secs(3)
    }
    pub fn healthcheck_timeout() -> Duration {
        Duration::from_secs(5)
    }
    pub fn zero() -> Duration {
        Duration::ZERO
    }
    pub fn tool_separator() -> String {
        "::".to_string()
    }
}

/// Durations are JSON numbers in seconds; fractions are allowed.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Configuration loading and validation failures. These abort startup with
/// exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

const KNOWN_PROXY_KEYS: &[&str] = &[
    "servers",
    "log_level",
    "response_timeout",
    "auth_token",
    "rate_limit_per_minute",
    "structured_logging",
    "healthcheck_interval",
    "healthcheck_timeout",
    "tool_separator",
];

const KNOWN_SERVER_KEYS: &[&str] = &[
    "id",
    "command",
    "env",
    "startup_timeout",
    "shutdown_grace",
    "stdio_mode",
];

/// Load and validate a proxy configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: display.clone(),
        source,
    })?;

    warn_unknown_keys(&value);

    let config: ProxyConfig =
        serde_json::from_value(value).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
    validate(&config)?;
    Ok(config)
}

/// Validate a configuration, whether loaded from disk or built in code.
pub fn validate(config: &ProxyConfig) -> Result<(), ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::Invalid {
            reason: "at least one upstream server must be configured".to_string(),
        });
    }
    if config.tool_separator.is_empty() {
        return Err(ConfigError::Invalid {
            reason: "tool_separator must not be empty".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for server in &config.servers {
        if server.id.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "server id must not be empty".to_string(),
            });
        }
        if !seen.insert(server.id.as_str()) {
            return Err(ConfigError::Invalid {
                reason: format!("duplicate server id '{}'", server.id),
            });
        }
        // The id is embedded in exposed names and in relayed request ids, so
        // it must be free of both delimiters.
        if server.id.contains(&config.tool_separator) || server.id.contains(':') {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "server id '{}' must not contain '{}' or ':'",
                    server.id, config.tool_separator
                ),
            });
        }
        if server.command.is_empty() {
            return Err(ConfigError::Invalid {
                reason: format!("server '{}' has an empty command", server.id),
            });
        }
    }
    Ok(())
}

fn warn_unknown_keys(value: &Value) {
    let Some(root) = value.as_object() else {
        return;
    };
    for key in root.keys() {
        if !KNOWN_PROXY_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "ignoring unknown configuration key");
        }
    }
    if let Some(servers) = root.get("servers").and_then(Value::as_array) {
        for server in servers {
            let Some(obj) = server.as_object() else {
                continue;
            };
            for key in obj.keys() {
                if !KNOWN_SERVER_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "ignoring unknown server configuration key");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let file = write_config(r#"{"servers": [{"id": "echo", "command": ["echo-server"]}]}"#);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.response_timeout, Duration::from_secs(30));
        assert_eq!(config.healthcheck_interval, Duration::ZERO);
        assert!(!config.structured_logging);
        assert_eq!(config.tool_separator, "::");
        assert!(config.auth_token.is_none());
        assert!(config.rate_limit_per_minute.is_none());

        let server = &config.servers[0];
        assert_eq!(server.startup_timeout, Duration::from_secs(20));
        assert_eq!(server.shutdown_grace, Duration::from_secs(3));
        assert_eq!(server.stdio_mode, StdioMode::Auto);
    }

    #[test]
    fn test_fractional_durations() {
        let file = write_config(
            r#"{"response_timeout": 0.5,
                "servers": [{"id": "a", "command": ["a"], "startup_timeout": 1.25}]}"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.servers[0].startup_timeout, Duration::from_millis(1250));
    }

    #[test]
    fn test_stdio_mode_values() {
        let file = write_config(
            r#"{"servers": [
                {"id": "a", "command": ["a"], "stdio_mode": "newline"},
                {"id": "b", "command": ["b"], "stdio_mode": "header"}
            ]}"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers[0].stdio_mode, StdioMode::Newline);
        assert_eq!(config.servers[1].stdio_mode, StdioMode::Header);
    }

    #[test]
    fn test_invalid_stdio_mode_rejected() {
        let file = write_config(
            r#"{"servers": [{"id": "a", "command": ["a"], "stdio_mode": "content-length"}]}"#,
        );
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_empty_servers_rejected() {
        let file = write_config(r#"{"servers": []}"#);
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_duplicate_server_id_rejected() {
        let file = write_config(
            r#"{"servers": [
                {"id": "a", "command": ["x"]},
                {"id": "a", "command": ["y"]}
            ]}"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate server id"));
    }

    #[test]
    fn test_separator_in_server_id_rejected() {
        let file = write_config(r#"{"servers": [{"id": "a::b", "command": ["x"]}]}"#);
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_colon_in_server_id_rejected() {
        let file = write_config(r#"{"servers": [{"id": "a:b", "command": ["x"]}]}"#);
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_alternate_separator() {
        let file = write_config(
            r#"{"tool_separator": "__", "servers": [{"id": "fs", "command": ["x"]}]}"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.tool_separator, "__");
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let file = write_config(
            r#"{"experimental": true,
                "servers": [{"id": "a", "command": ["x"], "nice_to_have": 1}]}"#,
        );
        assert!(load_config(file.path()).is_ok());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let file = write_config(
            r#"{"response_timeout": -1, "servers": [{"id": "a", "command": ["x"]}]}"#,
        );
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/config.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
