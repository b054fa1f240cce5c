//! # Interceptor
//!
//! Decides, for each inbound call, whether this node serves it or forwards it.
//!
//! ```text
//!  inbound call
//!      |
//!  in scope? ---- no ----> local
//!      | yes
//!  `proxyfrom` set? -- yes --> local
//!      | no
//!  fetch CA + certificate ---- failure ----> UNAVAILABLE
//!      |
//!  forward to the resolved targets
//! ```
//!
//! The `proxyfrom` check is what prevents loops: a forwarded call always carries the marker,
//! so the node receiving it serves it locally even when it would otherwise proxy it.
use crate::config::Config;
use crate::connect::Connector;
use crate::methods::MethodTable;
use crate::router::{Forward, ProxyRouter};
use crate::target::{self, CallKind};
use crate::tls::{CertificateProvider, Credentials};
use std::sync::Arc;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::{debug, info, warn};

/// What the interceptor saw of an inbound call.
#[derive(Debug, Clone, Copy)]
pub struct InboundCall<'a> {
    /// The wire method name, e.g. `/node.NodeService/Version`.
    pub path: &'a str,
    pub metadata: &'a MetadataMap,
    /// The HTTP/2 `:authority` (or `host` header).
    pub authority: Option<&'a str>,
}

/// Outcome of the interceptor.
#[derive(Debug)]
pub enum Decision {
    /// Serve the call on this node.
    Local,
    /// Send the call to other nodes.
    Forward(Forward),
}

/// Interceptor state: scope, identity, credentials and the router.
pub struct Proxy<C> {
    scope: Option<String>,
    node_name: String,
    domain_name: Option<String>,
    provider: Arc<dyn CertificateProvider>,
    router: ProxyRouter<C>,
}

impl<C> std::fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("scope", &self.scope)
            .field("node_name", &self.node_name)
            .field("domain_name", &self.domain_name)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Proxy<C> {
    pub fn new(router: ProxyRouter<C>, provider: Arc<dyn CertificateProvider>) -> Self {
        Self {
            scope: None,
            node_name: "localhost".to_string(),
            domain_name: None,
            provider,
            router,
        }
    }

    /// Wires a proxy from configuration.
    pub fn from_config(
        config: &Config,
        methods: MethodTable,
        connector: C,
        provider: Arc<dyn CertificateProvider>,
    ) -> Self {
        let router = ProxyRouter::new(methods, connector)
            .with_max_concurrency(config.proxy.max_concurrency)
            .with_stream_buffer(config.proxy.stream_buffer);

        Self::new(router, provider)
            .with_scope(config.proxy.scope.clone())
            .with_node_name(config.node.name.clone())
            .with_domain_name(config.network.domain_name.clone())
    }

    /// Only calls whose path starts with `scope` are considered for forwarding.
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Marker value used when an inbound call carries no authority.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_domain_name(mut self, domain_name: Option<String>) -> Self {
        self.domain_name = domain_name;
        self
    }

    pub fn router(&self) -> &ProxyRouter<C> {
        &self.router
    }

    fn in_scope(&self, path: &str) -> bool {
        self.scope
            .as_deref()
            .is_none_or(|prefix| path.starts_with(prefix))
    }

    /// Runs the interceptor for one call.
    ///
    /// Fails only when credentials for a forwarded call cannot be obtained. That failure is
    /// final for the call.
    pub fn decide(&self, call: InboundCall<'_>) -> Result<Decision, Status> {
        if !self.in_scope(call.path) {
            debug!(method = call.path, "handling request");
            return Ok(Decision::Local);
        }

        if target::is_forwarded(call.metadata) {
            debug!(method = call.path, "handling request");
            return Ok(Decision::Local);
        }

        let credentials = Credentials::mutual(self.provider.as_ref(), self.domain_name.clone())
            .map_err(|err| {
                warn!(method = call.path, error = %err, "failed to load proxy credentials");
                Status::unavailable(err.to_string())
            })?;

        let kind = self
            .router
            .methods()
            .get(call.path)
            .map_or(CallKind::Unary, |method| method.kind());
        let targets = target::resolve_targets(call.metadata, call.authority, kind);

        let identity = call
            .authority
            .map(target::host_of)
            .filter(|host| !host.is_empty())
            .unwrap_or(self.node_name.as_str());

        info!(
            method = call.path,
            targets = targets.len(),
            "proxy request"
        );

        Ok(Decision::Forward(Forward {
            targets,
            credentials,
            outgoing: target::outgoing_metadata(identity),
        }))
    }
}
