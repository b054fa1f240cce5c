//! # Connection Factory
//!
//! Turns a [`Target`] into a live client handle. Two dialers exist:
//!
//! * [`NetworkConnector`] dials `target:port` over mutual TLS. This is the production mode.
//! * [`LocalConnector`] ignores the target and dials the unix socket of the called service,
//!   which is useful on a single node and in tests.
//!
//! Every dialer produces a [`ProxyChannel`], a boxed `tower` service, so the rest of the proxy
//! does not care how bytes reach a node.
use crate::BoxError;
use crate::config::{DialMode, LocalConfig, NetworkConfig};
use crate::fanout::TargetError;
use crate::local;
use crate::target::Target;
use crate::tls::Credentials;
use futures_util::future::join_all;
use std::future::Future;
use std::time::Duration;
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::transport::Endpoint;
use tower::ServiceExt;
use tower::util::BoxCloneService;
use tracing::{debug, warn};

/// A client connection to one node.
pub type ProxyChannel = BoxCloneService<http::Request<Body>, http::Response<Body>, ChannelError>;

/// Transport failure of a [`ProxyChannel`].
///
/// A concrete type rather than `BoxError`, so that `tonic` clients over the channel can convert
/// it into their own error type.
#[derive(Debug)]
pub struct ChannelError(pub BoxError);

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("Failed to configure TLS: {0}")]
    Tls(#[source] tonic::transport::Error),
    #[error("Failed to connect: {0}")]
    ConnectionFailed(#[source] BoxError),
    #[error("No local socket is configured for service '{0}'")]
    NoLocalSocket(String),
}

/// A live connection to one target, with the metadata every call through it carries.
///
/// Lives for a single fan-out operation.
#[derive(Clone)]
pub struct ProxyClient {
    pub target: Target,
    pub channel: ProxyChannel,
    pub metadata: MetadataMap,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("target", &self.target)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Produces client handles for targets.
pub trait Connector: Send + Sync + 'static {
    /// Dials `target` for a call to `service` (the fully qualified service name).
    fn connect(
        &self,
        target: &Target,
        service: &str,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<ProxyChannel, ConnectError>> + Send;
}

/// Dials `target:port` over mutual TLS.
#[derive(Debug, Clone)]
pub struct NetworkConnector {
    port: u16,
    connect_timeout: Duration,
    call_timeout: Option<Duration>,
}

impl NetworkConnector {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            port: config.port,
            connect_timeout: config.connect_timeout(),
            call_timeout: config.call_timeout(),
        }
    }
}

impl Connector for NetworkConnector {
    async fn connect(
        &self,
        target: &Target,
        _service: &str,
        credentials: &Credentials,
    ) -> Result<ProxyChannel, ConnectError> {
        let address = format!("https://{}", target.authority(self.port));

        let mut endpoint = Endpoint::from_shared(address.clone())
            .map_err(|source| ConnectError::InvalidAddress { address, source })?
            .connect_timeout(self.connect_timeout)
            .tls_config(credentials.client_tls_config())
            .map_err(ConnectError::Tls)?;

        if let Some(timeout) = self.call_timeout {
            endpoint = endpoint.timeout(timeout);
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ConnectError::ConnectionFailed(e.into()))?;

        Ok(BoxCloneService::new(channel.map_err(|e| ChannelError(e.into()))))
    }
}

/// Dials the unix socket serving the called service, whatever the target.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    sockets: LocalConfig,
    connect_timeout: Duration,
}

impl LocalConnector {
    pub fn new(sockets: LocalConfig, connect_timeout: Duration) -> Self {
        Self {
            sockets,
            connect_timeout,
        }
    }
}

impl Connector for LocalConnector {
    async fn connect(
        &self,
        _target: &Target,
        service: &str,
        _credentials: &Credentials,
    ) -> Result<ProxyChannel, ConnectError> {
        let path = self
            .sockets
            .socket_for(service)
            .ok_or_else(|| ConnectError::NoLocalSocket(service.to_string()))?;

        let channel = local::unix_endpoint()
            .connect_timeout(self.connect_timeout)
            .connect_with_connector(local::unix_connector(path.to_path_buf()))
            .await
            .map_err(|e| ConnectError::ConnectionFailed(e.into()))?;

        Ok(BoxCloneService::new(channel.map_err(|e| ChannelError(e.into()))))
    }
}

/// The connector selected by configuration.
#[derive(Debug, Clone)]
pub enum AnyConnector {
    Network(NetworkConnector),
    Local(LocalConnector),
}

impl AnyConnector {
    pub fn from_config(mode: DialMode, network: &NetworkConfig, local: &LocalConfig) -> Self {
        match mode {
            DialMode::Network => Self::Network(NetworkConnector::new(network)),
            DialMode::Local => Self::Local(LocalConnector::new(
                local.clone(),
                network.connect_timeout(),
            )),
        }
    }
}

impl Connector for AnyConnector {
    async fn connect(
        &self,
        target: &Target,
        service: &str,
        credentials: &Credentials,
    ) -> Result<ProxyChannel, ConnectError> {
        match self {
            Self::Network(connector) => connector.connect(target, service, credentials).await,
            Self::Local(connector) => connector.connect(target, service, credentials).await,
        }
    }
}

/// Dials every target concurrently.
///
/// Returns the clients that connected, in request order, and one [`TargetError`] per target
/// that did not. A failed dial never aborts the batch.
pub async fn dial_all<C: Connector>(
    connector: &C,
    targets: Vec<Target>,
    service: &str,
    credentials: &Credentials,
    outgoing: &MetadataMap,
) -> (Vec<ProxyClient>, Vec<TargetError>) {
    let dials = targets.into_iter().map(|target| async move {
        let result = connector.connect(&target, service, credentials).await;
        (target, result)
    });

    let mut clients = Vec::new();
    let mut errors = Vec::new();

    for (target, result) in join_all(dials).await {
        match result {
            Ok(channel) => {
                debug!(%target, "connected");
                clients.push(ProxyClient {
                    target,
                    channel,
                    metadata: outgoing.clone(),
                });
            }
            Err(err) => {
                warn!(%target, error = %err, "failed to dial target");
                errors.push(TargetError::dial(target, err));
            }
        }
    }

    (clients, errors)
}
