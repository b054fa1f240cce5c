//! Configuration loading for fanproxy nodes.
//!
//! Configuration is loaded from a TOML file with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `/etc/fanproxy/config.toml` (system)
//! 3. Built-in defaults
//!
//! Every section is optional, a missing section takes its defaults.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0:?}")]
    NotFound(PathBuf),
    #[error("Failed to read config file {0:?}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

const SYSTEM_CONFIG: &str = "/etc/fanproxy/config.toml";

/// Node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

/// Identity and listener of this node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name used as the loop-prevention marker when the inbound call carries no authority.
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Address the proxy listens on (default: 0.0.0.0:50000).
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Binary `FileDescriptorSet` describing every proxied service.
    #[serde(default)]
    pub descriptor_set: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            listen: default_listen(),
            descriptor_set: None,
        }
    }
}

fn default_node_name() -> String {
    "localhost".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

/// The fixed service port every member node listens on.
pub const DEFAULT_PORT: u16 = 50000;

/// How forwarded calls reach member nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Port dialed on every target (default: 50000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Dial timeout in milliseconds (default: 5000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per forwarded call timeout in milliseconds. Unset means no timeout.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Overrides the TLS server name checked against target certificates.
    #[serde(default)]
    pub domain_name: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: None,
            domain_name: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Unix sockets of the services served by this node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    /// Fully qualified service name -> socket path.
    #[serde(default)]
    pub sockets: HashMap<String, PathBuf>,
    /// Socket used for services without an entry in `sockets`.
    #[serde(default)]
    pub default_socket: Option<PathBuf>,
}

impl LocalConfig {
    /// The socket serving `service`, if any.
    pub fn socket_for(&self, service: &str) -> Option<&Path> {
        self.sockets
            .get(service)
            .or(self.default_socket.as_ref())
            .map(PathBuf::as_path)
    }
}

/// PEM files backing the certificate provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Dial mode used for forwarded calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialMode {
    /// `target:port` over mutual TLS.
    #[default]
    Network,
    /// The local unix socket of the called service.
    Local,
}

/// Interceptor and executor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Only calls whose path starts with this prefix are proxied (e.g. `/node.`).
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub mode: DialMode,
    /// Upper bound on concurrently running fan-out calls. Unset means one task per target.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Capacity of the channel feeding a relayed response stream (default: 16).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            scope: None,
            mode: DialMode::default(),
            max_concurrency: None,
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_stream_buffer() -> usize {
    16
}

/// Field names describing an aggregatable reply.
///
/// A reply is aggregatable when it has a repeated message field (`response_field`) whose
/// elements carry a message field (`metadata_field`) with a string field (`hostname_field`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_response_field")]
    pub response_field: String,
    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,
    #[serde(default = "default_hostname_field")]
    pub hostname_field: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            response_field: default_response_field(),
            metadata_field: default_metadata_field(),
            hostname_field: default_hostname_field(),
        }
    }
}

fn default_response_field() -> String {
    "response".to_string()
}

fn default_metadata_field() -> String {
    "metadata".to_string()
}

fn default_hostname_field() -> String {
    "hostname".to_string()
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided, it must exist)
    /// 2. `/etc/fanproxy/config.toml`
    /// 3. Defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            return Self::load_from_file(path);
        }

        let system_config = Path::new(SYSTEM_CONFIG);
        if system_config.exists() {
            return Self::load_from_file(system_config);
        }

        Ok(Self::default())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.node.listen.port(), 50000);
        assert_eq!(config.network.port, 50000);
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.network.call_timeout(), None);
        assert_eq!(config.proxy.mode, DialMode::Network);
        assert_eq!(config.proxy.max_concurrency, None);
        assert_eq!(config.aggregation.response_field, "response");
        assert_eq!(config.aggregation.metadata_field, "metadata");
        assert_eq!(config.aggregation.hostname_field, "hostname");
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [node]
            name = "cp-1"
        "#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.node.name, "cp-1");
        // Defaults preserved
        assert_eq!(config.network.port, 50000);
        assert_eq!(config.proxy.stream_buffer, 16);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [node]
            name = "cp-1"
            listen = "127.0.0.1:6000"
            descriptor_set = "/var/lib/fanproxy/api.bin"

            [network]
            port = 6000
            connect_timeout_ms = 250
            call_timeout_ms = 10000
            domain_name = "cluster.local"

            [local]
            default_socket = "/run/api.sock"

            [local.sockets]
            "node.NodeService" = "/run/node.sock"

            [tls]
            ca = "/etc/fanproxy/ca.pem"
            cert = "/etc/fanproxy/node.pem"
            key = "/etc/fanproxy/node-key.pem"

            [proxy]
            scope = "/node."
            mode = "local"
            max_concurrency = 8

            [aggregation]
            response_field = "messages"
        "#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.node.listen, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.network.call_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.network.domain_name.as_deref(), Some("cluster.local"));
        assert_eq!(
            config.local.socket_for("node.NodeService"),
            Some(Path::new("/run/node.sock"))
        );
        assert_eq!(
            config.local.socket_for("other.Service"),
            Some(Path::new("/run/api.sock"))
        );
        assert_eq!(config.proxy.scope.as_deref(), Some("/node."));
        assert_eq!(config.proxy.mode, DialMode::Local);
        assert_eq!(config.proxy.max_concurrency, Some(8));
        assert_eq!(config.aggregation.response_field, "messages");
        assert_eq!(config.aggregation.metadata_field, "metadata");
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let result = Config::load(Some(Path::new("/definitely/not/here.toml")));

        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
