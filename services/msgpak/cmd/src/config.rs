//! Configuration handling for the msgpak service.
//!
//! Values come from a YAML file (the `msgpak:` section), then `MSGPAK_*`
//! environment variables, then command line flags. `validate` runs last and
//! is the only check that stops the process.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use msgpak_session::{BrokerConfig, Credentials, IpAllowList, Role};
use msgpak_storage::QueueConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for this schema
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Environment variable with an unusable value
    #[error("invalid value for {var}: {value}")]
    Env { var: String, value: String },

    /// A setting is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Side this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept clients
    Server,
    /// Dial the server pool
    Client,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Transport credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// User name, 5 to 25 characters
    pub user: String,
    /// Password, 7 to 30 characters
    pub password: String,
}

/// Task queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Per-peer queue bound
    pub depth: usize,
    /// Commands the server may schedule; empty allows any valid command
    pub allowed_commands: Vec<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            depth: msgpak_storage::DEFAULT_QUEUE_DEPTH,
            allowed_commands: Vec::new(),
        }
    }
}

/// Admin endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// Whether to serve the endpoint
    pub enabled: bool,
    /// Listen address
    pub bind: SocketAddr,
    /// Allowed remote addresses; empty means loopback only
    pub allow_ips: Vec<String>,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 7001)),
            allow_ips: Vec::new(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to certificate chain (server)
    pub cert_file: String,
    /// Path to private key (server)
    pub key_file: String,
    /// Path to CA certificate (client)
    pub ca_file: String,
}

/// msgpak service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgPakConfig {
    /// Local identifier
    pub id: String,
    /// Server or client
    pub mode: Mode,
    /// Server listen address
    pub listen: SocketAddr,
    /// Client server pool, `host:port` entries
    pub servers: Vec<String>,
    /// Remote IPs the server accepts; empty accepts all
    pub allow_ips: Vec<String>,
    /// Transport credentials
    pub auth: AuthConfig,
    /// Long-lived shared key, 16 to 256 characters
    pub shared_key: String,
    /// Broadcast interval
    #[serde(with = "humantime_str")]
    pub message_interval: Duration,
    /// Watchdog interval
    #[serde(with = "humantime_str")]
    pub reconnect_interval: Duration,
    /// Key exchange timeout
    #[serde(with = "humantime_str")]
    pub handshake_timeout: Duration,
    /// Envelope size cap in bytes
    pub max_message_size: usize,
    /// Task queues
    pub queue: QueueSettings,
    /// Admin endpoint
    pub admin: AdminSettings,
    /// TLS
    pub tls: TlsConfig,
}

impl Default for MsgPakConfig {
    fn default() -> Self {
        Self {
            id: format!("msgpak-{}", uuid::Uuid::new_v4()),
            mode: Mode::Server,
            listen: SocketAddr::from(([0, 0, 0, 0], 7000)),
            servers: Vec::new(),
            allow_ips: Vec::new(),
            auth: AuthConfig::default(),
            shared_key: String::new(),
            message_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(60),
            max_message_size: msgpak_wire::DEFAULT_MAX_MESSAGE_SIZE,
            queue: QueueSettings::default(),
            admin: AdminSettings::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    msgpak: Option<MsgPakConfig>,
}

/// Durations as humantime strings ("60s", "5m")
mod humantime_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

const USER_LEN: (usize, usize) = (5, 25);
const PASSWORD_LEN: (usize, usize) = (7, 30);
const SHARED_KEY_LEN: (usize, usize) = (16, 256);
const MESSAGE_INTERVAL_SECS: (u64, u64) = (10, 3600);
const RECONNECT_INTERVAL_SECS: (u64, u64) = (30, 43200);
const HANDSHAKE_TIMEOUT_SECS: (u64, u64) = (5, 300);
const QUEUE_DEPTH: (usize, usize) = (1, 10_000);
const MESSAGE_SIZE: (usize, usize) = (1024, msgpak_wire::DEFAULT_MAX_MESSAGE_SIZE);

impl MsgPakConfig {
    /// Load configuration from file and environment variables. A missing
    /// file means defaults; an unparsable one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig =
                    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                        path: path.display().to_string(),
                        source,
                    })?;
                info!("Loaded configuration from {:?}", path);
                root.msgpak.unwrap_or_default()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        config.apply_environment_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply `MSGPAK_*` overrides from a variable lookup
    pub fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }
        fn duration(var: &str, value: String) -> Result<Duration, ConfigError> {
            humantime::parse_duration(value.trim()).map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }
        fn list(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        }

        if let Some(v) = lookup("MSGPAK_ID") {
            self.id = v;
            info!("ID overridden by environment: {}", self.id);
        }
        if let Some(v) = lookup("MSGPAK_MODE") {
            self.mode = parsed("MSGPAK_MODE", v)?;
        }
        if let Some(v) = lookup("MSGPAK_LISTEN") {
            self.listen = parsed("MSGPAK_LISTEN", v)?;
            info!("Listen address overridden by environment: {}", self.listen);
        }
        if let Some(v) = lookup("MSGPAK_SERVERS") {
            self.servers = list(&v);
        }
        if let Some(v) = lookup("MSGPAK_ALLOW_IPS") {
            self.allow_ips = list(&v);
        }
        if let Some(v) = lookup("MSGPAK_AUTH_USER") {
            self.auth.user = v;
        }
        if let Some(v) = lookup("MSGPAK_AUTH_PASSWORD") {
            self.auth.password = v;
        }
        if let Some(v) = lookup("MSGPAK_SHARED_KEY") {
            self.shared_key = v;
        }
        if let Some(v) = lookup("MSGPAK_MESSAGE_INTERVAL") {
            self.message_interval = duration("MSGPAK_MESSAGE_INTERVAL", v)?;
        }
        if let Some(v) = lookup("MSGPAK_RECONNECT_INTERVAL") {
            self.reconnect_interval = duration("MSGPAK_RECONNECT_INTERVAL", v)?;
        }
        if let Some(v) = lookup("MSGPAK_ADMIN_BIND") {
            self.admin.bind = parsed("MSGPAK_ADMIN_BIND", v)?;
            self.admin.enabled = true;
        }
        Ok(())
    }

    /// Check every setting against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.id.trim().is_empty() {
            return invalid("id must not be empty".into());
        }

        let user = self.auth.user.trim();
        if !within(user.chars().count(), USER_LEN) {
            return invalid(format!(
                "auth user must be {} to {} characters",
                USER_LEN.0, USER_LEN.1
            ));
        }
        // The password is used as given; only the emptiness check trims.
        let password_trimmed = self.auth.password.trim().chars().count();
        if password_trimmed == 0
            || password_trimmed < PASSWORD_LEN.0
            || self.auth.password.chars().count() > PASSWORD_LEN.1
        {
            return invalid(format!(
                "auth password must be {} to {} characters",
                PASSWORD_LEN.0, PASSWORD_LEN.1
            ));
        }

        if !within(self.shared_key.trim().chars().count(), SHARED_KEY_LEN) {
            return invalid(format!(
                "shared key must be {} to {} characters",
                SHARED_KEY_LEN.0, SHARED_KEY_LEN.1
            ));
        }

        check_secs("message interval", self.message_interval, MESSAGE_INTERVAL_SECS)?;
        check_secs(
            "reconnect interval",
            self.reconnect_interval,
            RECONNECT_INTERVAL_SECS,
        )?;
        check_secs("handshake timeout", self.handshake_timeout, HANDSHAKE_TIMEOUT_SECS)?;

        if !within(self.queue.depth, QUEUE_DEPTH) {
            return invalid(format!(
                "queue depth must be {} to {}",
                QUEUE_DEPTH.0, QUEUE_DEPTH.1
            ));
        }
        if !within(self.max_message_size, MESSAGE_SIZE) {
            return invalid(format!(
                "max message size must be {} to {} bytes",
                MESSAGE_SIZE.0, MESSAGE_SIZE.1
            ));
        }
        for cmd in &self.queue.allowed_commands {
            msgpak_wire::validate_task_command(cmd, &[])
                .map_err(|e| ConfigError::Invalid(format!("allowed command {:?}: {}", cmd, e)))?;
        }

        IpAllowList::parse(&self.allow_ips).map_err(ConfigError::Invalid)?;
        IpAllowList::parse(&self.admin.allow_ips).map_err(ConfigError::Invalid)?;

        if self.mode == Mode::Client {
            if self.servers.is_empty() {
                return invalid("client mode needs at least one server".into());
            }
            for server in &self.servers {
                if !is_host_port(server) {
                    return invalid(format!("server {:?} is not host:port", server));
                }
            }
        }

        if self.tls.enabled {
            match self.mode {
                Mode::Server if self.tls.cert_file.is_empty() || self.tls.key_file.is_empty() => {
                    return invalid("TLS enabled but cert_file or key_file is missing".into());
                }
                Mode::Client if self.tls.ca_file.is_empty() => {
                    return invalid("TLS enabled but ca_file is missing".into());
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Broker settings derived from this configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            id: self.id.trim().to_string(),
            role: match self.mode {
                Mode::Server => Role::Server,
                Mode::Client => Role::Client,
            },
            shared_key: self.shared_key.trim().to_string(),
            credentials: Credentials {
                user: self.auth.user.trim().to_string(),
                password: self.auth.password.clone(),
            },
            message_interval: self.message_interval,
            reconnect_interval: self.reconnect_interval,
            handshake_timeout: self.handshake_timeout,
            max_message_size: self.max_message_size,
            queue: QueueConfig {
                max_depth: self.queue.depth,
                max_message_size: self.max_message_size,
                allowed_commands: self.queue.allowed_commands.clone(),
            },
        }
    }
}

fn within(n: usize, (min, max): (usize, usize)) -> bool {
    n >= min && n <= max
}

fn check_secs(name: &str, value: Duration, (min, max): (u64, u64)) -> Result<(), ConfigError> {
    if value < Duration::from_secs(min) || value > Duration::from_secs(max) {
        return Err(ConfigError::Invalid(format!(
            "{} must be between {}s and {}s, got {}",
            name,
            min,
            max,
            humantime::format_duration(value)
        )));
    }
    Ok(())
}

fn is_host_port(address: &str) -> bool {
    match address.trim().rsplit_once(':') {
        Some((host, port)) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            !host.is_empty() && port.parse::<u16>().map(|p| p > 0).unwrap_or(false)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid() -> MsgPakConfig {
        MsgPakConfig {
            id: "srv-1".into(),
            auth: AuthConfig {
                user: "operator".into(),
                password: "s3cret-pass".into(),
            },
            shared_key: "long-lived-key-0123456789".into(),
            ..MsgPakConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = MsgPakConfig::default();
        assert!(config.id.starts_with("msgpak-"));
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.message_interval, Duration::from_secs(60));
        assert_eq!(config.queue.depth, 100);
        assert!(!config.admin.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
msgpak:
  id: client-7
  mode: client
  servers:
    - 10.0.0.1:7000
    - "[::1]:7000"
  auth:
    user: operator
    password: s3cret-pass
  shared_key: long-lived-key-0123456789
  message_interval: 30s
  reconnect_interval: 2m
  queue:
    depth: 5
    allowed_commands: [REFRESH, REPORT]
  admin:
    enabled: true
    bind: 127.0.0.1:9001
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MsgPakConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.id, "client-7");
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.message_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_interval, Duration::from_secs(120));
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
        assert_eq!(config.queue.depth, 5);
        assert!(config.admin.enabled);
        config.validate().unwrap();

        let broker = config.broker_config();
        assert_eq!(broker.role, Role::Client);
        assert_eq!(broker.queue.allowed_commands, vec!["REFRESH", "REPORT"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MsgPakConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.mode, Mode::Server);
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"msgpak:\n  message_interval: soon\n")
            .unwrap();
        assert!(matches!(
            MsgPakConfig::load_from_file(temp_file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MSGPAK_MODE", "client"),
            ("MSGPAK_SERVERS", "a.example:7000, b.example:7000,"),
            ("MSGPAK_MESSAGE_INTERVAL", "15s"),
            ("MSGPAK_ADMIN_BIND", "127.0.0.1:9100"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config
            .apply_environment_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.servers, vec!["a.example:7000", "b.example:7000"]);
        assert_eq!(config.message_interval, Duration::from_secs(15));
        assert!(config.admin.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_environment_value() {
        let mut config = valid();
        let err = config
            .apply_environment_overrides(|k| (k == "MSGPAK_LISTEN").then(|| "nowhere".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation_ranges() {
        valid().validate().unwrap();

        let cases: Vec<Box<dyn Fn(&mut MsgPakConfig)>> = vec![
            Box::new(|c: &mut MsgPakConfig| c.id = "  ".into()),
            Box::new(|c: &mut MsgPakConfig| c.auth.user = "abc".into()),
            Box::new(|c: &mut MsgPakConfig| c.auth.user = "u".repeat(26)),
            Box::new(|c: &mut MsgPakConfig| c.auth.password = "short".into()),
            Box::new(|c: &mut MsgPakConfig| c.auth.password = "  pass  ".into()),
            Box::new(|c: &mut MsgPakConfig| c.auth.password = "p".repeat(31)),
            Box::new(|c: &mut MsgPakConfig| c.shared_key = "too-short".into()),
            Box::new(|c: &mut MsgPakConfig| c.message_interval = Duration::from_secs(5)),
            Box::new(|c: &mut MsgPakConfig| c.message_interval = Duration::from_secs(3601)),
            Box::new(|c: &mut MsgPakConfig| c.reconnect_interval = Duration::from_secs(29)),
            Box::new(|c: &mut MsgPakConfig| c.handshake_timeout = Duration::from_secs(301)),
            Box::new(|c: &mut MsgPakConfig| c.queue.depth = 0),
            Box::new(|c: &mut MsgPakConfig| c.max_message_size = 100),
            Box::new(|c: &mut MsgPakConfig| c.queue.allowed_commands = vec!["DO:THIS".into()]),
            Box::new(|c: &mut MsgPakConfig| c.allow_ips = vec!["not-an-ip".into()]),
            Box::new(|c: &mut MsgPakConfig| c.mode = Mode::Client),
            Box::new(|c: &mut MsgPakConfig| {
                c.mode = Mode::Client;
                c.servers = vec!["nohost".into()];
            }),
            Box::new(|c: &mut MsgPakConfig| c.tls.enabled = true),
        ];

        for (i, mutate) in cases.iter().enumerate() {
            let mut config = valid();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "case {} should be rejected",
                i
            );
        }
    }

    #[test]
    fn test_allowed_commands_must_be_schedulable() {
        let mut config = valid();
        config.queue.allowed_commands = vec!["REPORT".into(), "DO:THIS".into()];
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("DO:THIS"), "{}", msg),
            other => panic!("expected rejection, got {:?}", other),
        }

        config.queue.allowed_commands = vec!["REPORT".into(), "REFRESH".into()];
        config.validate().unwrap();
    }

    #[test]
    fn test_password_is_not_trimmed() {
        let mut config = valid();
        config.auth.password = " s3cret-pass ".into();
        config.validate().unwrap();
        assert_eq!(config.broker_config().credentials.password, " s3cret-pass ");
    }

    #[test]
    fn test_host_port() {
        assert!(is_host_port("example.org:7000"));
        assert!(is_host_port("[::1]:7000"));
        assert!(!is_host_port("example.org"));
        assert!(!is_host_port(":7000"));
        assert!(!is_host_port("example.org:0"));
    }
}
