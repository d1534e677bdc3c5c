use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use stream_relay_core::SessionConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PATH: &str = "/mcp";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Route serving POST, GET and DELETE for sessions.
    pub path: String,
    /// Bearer token required on the session route when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Interval between SSE keep-alive comments. 0 disables them.
    pub sse_keep_alive_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            api_key: None,
            sse_keep_alive_secs: 15,
            gc_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sse_keep_alive(&self) -> Option<Duration> {
        (self.sse_keep_alive_secs > 0).then(|| Duration::from_secs(self.sse_keep_alive_secs))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server.path.starts_with('/') {
            bail!("server.path must start with '/', got {:?}", self.server.path);
        }
        if matches!(self.server.path.as_str(), "/ready" | "/metrics") {
            bail!("server.path {:?} collides with a built-in route", self.server.path);
        }
        if self.session.max_subscribers == 0 {
            bail!("session.max_subscribers must be at least 1");
        }
        if self.session.event_buffer == 0 {
            bail!("session.event_buffer must be at least 1");
        }
        if matches!(self.server.api_key.as_deref(), Some("")) {
            bail!("server.api_key must not be empty");
        }
        Ok(())
    }

    /// TOML rendering with the API key masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut printable = self.clone();
        if printable.server.api_key.is_some() {
            printable.server.api_key = Some("<redacted>".to_string());
        }
        Ok(toml::to_string_pretty(&printable)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.server.path, "/mcp");
        assert_eq!(config.server.sse_keep_alive(), Some(Duration::from_secs(15)));
        assert_eq!(config.session.max_subscribers, 1);
        assert_eq!(config.session.idle_timeout(), None);
    }

    #[test]
    fn parses_full_file() {
        let config = Config::parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            path = "/rpc"
            api_key = "secret"
            sse_keep_alive_secs = 0
            gc_interval_secs = 5

            [session]
            event_buffer = 8
            max_subscribers = 2
            idle_timeout_secs = 600
            close_on_disconnect = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.server.path, "/rpc");
        assert_eq!(config.server.api_key.as_deref(), Some("secret"));
        assert_eq!(config.server.sse_keep_alive(), None);
        assert_eq!(config.server.gc_interval(), Duration::from_secs(5));
        assert_eq!(config.session.event_buffer, 8);
        assert_eq!(config.session.max_subscribers, 2);
        assert_eq!(config.session.idle_timeout(), Some(Duration::from_secs(600)));
        assert!(config.session.close_on_disconnect);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::parse("[session]\nidle_timeout_secs = 60\n").unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.session.event_buffer, 64);
        assert_eq!(config.session.idle_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::parse("[server]\npath = \"mcp\"\n").is_err());
        assert!(Config::parse("[server]\npath = \"/metrics\"\n").is_err());
        assert!(Config::parse("[server]\napi_key = \"\"\n").is_err());
        assert!(Config::parse("[session]\nmax_subscribers = 0\n").is_err());
        assert!(Config::parse("[session]\nevent_buffer = 0\n").is_err());
        assert!(Config::parse("[server]\nport = \"eighty\"\n").is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 4040").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 4040);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn redacted_toml_masks_api_key_and_round_trips() {
        let mut config = Config::default();
        config.server.api_key = Some("secret".to_string());

        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));

        let reparsed = Config::parse(&rendered).unwrap();
        assert_eq!(reparsed.session, config.session);
        assert_eq!(reparsed.server.port, config.server.port);
    }
}
