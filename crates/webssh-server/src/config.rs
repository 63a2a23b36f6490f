//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use webssh_core::{WebSshError, WebSshResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub ssh: SshSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path_prefix: default_path_prefix(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// `[terminal]` section: relay pacing and queue sizes.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,
    /// How long a new connection may take to send its start message.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    #[serde(default = "default_output_queue")]
    pub output_queue: usize,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            write_deadline_secs: default_write_deadline_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            command_queue: default_command_queue(),
            output_queue: default_output_queue(),
        }
    }
}

/// `[ssh]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 0 disables SSH-level keepalives.
    #[serde(default)]
    pub keepalive_interval_secs: u64,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: 0,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path_prefix() -> String {
    "/webssh/ws".to_string()
}
fn default_max_sessions() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_flush_interval_ms() -> u64 {
    20
}
fn default_keepalive_interval_secs() -> u64 {
    20
}
fn default_write_deadline_secs() -> u64 {
    25
}
fn default_start_timeout_secs() -> u64 {
    30
}
fn default_command_queue() -> usize {
    64
}
fn default_output_queue() -> usize {
    256
}
fn default_connect_timeout_secs() -> u64 {
    15
}

/// Per-session relay pacing, copied into every session at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Batching relay flush period.
    pub flush_interval: Duration,
    /// Keepalive ping period.
    pub keepalive_interval: Duration,
    /// Upper bound on a single ping send.
    pub write_deadline: Duration,
    /// Deadline for the session start message.
    pub start_timeout: Duration,
    /// Browser reader → input relay queue capacity.
    pub command_queue: usize,
    /// Output reader → batching relay queue capacity.
    pub output_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_section(&TerminalSection::default())
    }
}

impl RelaySettings {
    fn from_section(t: &TerminalSection) -> Self {
        Self {
            flush_interval: Duration::from_millis(t.flush_interval_ms.max(1)),
            keepalive_interval: Duration::from_secs(t.keepalive_interval_secs.max(1)),
            write_deadline: Duration::from_secs(t.write_deadline_secs.max(1)),
            start_timeout: Duration::from_secs(t.start_timeout_secs.max(1)),
            command_queue: t.command_queue.max(1),
            output_queue: t.output_queue.max(1),
        }
    }
}

/// SSH client tuning handed to the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self::from_section(&SshSection::default())
    }
}

impl SshSettings {
    fn from_section(s: &SshSection) -> Self {
        Self {
            connect_timeout: Duration::from_secs(s.connect_timeout_secs.max(1)),
            keepalive_interval: (s.keepalive_interval_secs > 0)
                .then(|| Duration::from_secs(s.keepalive_interval_secs)),
        }
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub max_sessions: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub path_prefix: String,
    pub max_sessions: usize,
    pub log_level: String,
    pub relay: RelaySettings,
    pub ssh: SshSettings,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> WebSshResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| WebSshError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(mut file_config: ConfigFile, cli: &CliOverrides) -> WebSshResult<Self> {
        if let Some(ms) = cli.flush_interval_ms {
            file_config.terminal.flush_interval_ms = ms;
        }

        let bind = cli.bind.clone().unwrap_or(file_config.server.bind);
        let port = cli.port.unwrap_or(file_config.server.port);
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| WebSshError::Other(format!("invalid bind address {bind:?}: {e}")))?;

        Ok(Self {
            listen_addr: SocketAddr::new(ip, port),
            path_prefix: normalize_prefix(&file_config.server.path_prefix),
            max_sessions: cli.max_sessions.unwrap_or(file_config.server.max_sessions),
            log_level: cli.log_level.clone().unwrap_or(file_config.log.level),
            relay: RelaySettings::from_section(&file_config.terminal),
            ssh: SshSettings::from_section(&file_config.ssh),
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Defaults always resolve: the default bind address is a literal IP.
        Self {
            listen_addr: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), default_port()),
            path_prefix: default_path_prefix(),
            max_sessions: default_max_sessions(),
            log_level: default_log_level(),
            relay: RelaySettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

/// Strip trailing slashes and ensure a leading one.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, &CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.path_prefix, "/webssh/ws");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.relay.flush_interval, Duration::from_millis(20));
        assert_eq!(cfg.relay.keepalive_interval, Duration::from_secs(20));
        assert_eq!(cfg.relay.write_deadline, Duration::from_secs(25));
        assert_eq!(cfg.relay.start_timeout, Duration::from_secs(30));
        assert_eq!(cfg.ssh.keepalive_interval, None);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = Path::new("/nonexistent/webssh/config.toml");
        let cfg = ServerConfig::load(Some(path), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.max_sessions, 256);
    }

    #[test]
    fn file_values_then_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind = "127.0.0.1"
port = 9000
path_prefix = "term/"

[log]
level = "debug"

[terminal]
flush_interval_ms = 50
keepalive_interval_secs = 5
start_timeout_secs = 10

[ssh]
connect_timeout_secs = 3
keepalive_interval_secs = 30
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(file.path()), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.path_prefix, "/term");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.relay.flush_interval, Duration::from_millis(50));
        assert_eq!(cfg.relay.keepalive_interval, Duration::from_secs(5));
        assert_eq!(cfg.relay.start_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ssh.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.ssh.keepalive_interval, Some(Duration::from_secs(30)));

        let cli = CliOverrides {
            port: Some(9100),
            log_level: Some("warn".into()),
            flush_interval_ms: Some(5),
            ..CliOverrides::default()
        };
        let cfg = ServerConfig::load(Some(file.path()), &cli).unwrap();
        assert_eq!(cfg.listen_addr.port(), 9100);
        assert_eq!(cfg.log_level, "warn");
        assert_eq!(cfg.relay.flush_interval, Duration::from_millis(5));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(ServerConfig::load(Some(file.path()), &CliOverrides::default()).is_err());
    }

    #[test]
    fn invalid_bind_is_an_error() {
        let cli = CliOverrides {
            bind: Some("not-an-ip".into()),
            ..CliOverrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), &cli).is_err());
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let mut file = ConfigFile::default();
        file.terminal.flush_interval_ms = 0;
        file.terminal.output_queue = 0;
        let cfg = ServerConfig::resolve(file, &CliOverrides::default()).unwrap();
        assert_eq!(cfg.relay.flush_interval, Duration::from_millis(1));
        assert_eq!(cfg.relay.output_queue, 1);
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/webssh/ws/"), "/webssh/ws");
        assert_eq!(normalize_prefix("ws"), "/ws");
    }
}
