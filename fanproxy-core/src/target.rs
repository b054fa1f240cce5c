//! # Target Resolution
//!
//! Decides which member nodes an inbound call is dispatched to, and builds the metadata every
//! forwarded call carries.
//!
//! Targets are read from the `targets` metadata. Each value may itself be a comma separated
//! list. Without any target the call goes to the node named by the inbound `:authority`.
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use tonic::metadata::{MetadataMap, MetadataValue};
use tracing::debug;

/// Inbound metadata key listing the nodes a call fans out to.
pub const TARGETS_KEY: &str = "targets";

/// Loop-prevention marker. A call carrying it is always served by the node receiving it.
pub const PROXY_FROM_KEY: &str = "proxyfrom";

/// A member node, addressed by hostname or IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target(String);

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `host:port` form used for dialing. Bare IPv6 literals are bracketed.
    pub fn authority(&self, port: u16) -> String {
        if Ipv6Addr::from_str(&self.0).is_ok() {
            format!("[{}]:{}", self.0, port)
        } else {
            format!("{}:{}", self.0, port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Shape of an inbound call as far as target selection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    /// Server, client or bidirectional streaming.
    Streaming,
}

impl CallKind {
    /// Whether a call of this kind may be dispatched to more than one node.
    ///
    /// Streams are never merged, so a streaming call always talks to a single target.
    pub fn supports_multiple_targets(self) -> bool {
        matches!(self, CallKind::Unary)
    }
}

/// Resolves the targets of an inbound call.
pub fn resolve_targets(
    metadata: &MetadataMap,
    authority: Option<&str>,
    kind: CallKind,
) -> Vec<Target> {
    let mut targets: Vec<Target> = metadata
        .get_all(TARGETS_KEY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(Target::from)
        .collect();

    // A present but blank `targets` key is an empty list, not a request for the default.
    if !metadata.contains_key(TARGETS_KEY) {
        targets.extend(authority.map(host_of).filter(|h| !h.is_empty()).map(Target::from));
    }

    if !kind.supports_multiple_targets() && targets.len() > 1 {
        debug!(
            requested = targets.len(),
            target = %targets[0],
            "streaming call truncated to its first target"
        );
        targets.truncate(1);
    }

    targets
}

/// Whether the call was already forwarded by another node.
pub fn is_forwarded(metadata: &MetadataMap) -> bool {
    metadata.contains_key(PROXY_FROM_KEY)
}

/// Fresh metadata for a forwarded call: only the loop-prevention marker, set to `identity`.
pub fn outgoing_metadata(identity: &str) -> MetadataMap {
    let value = MetadataValue::try_from(identity)
        .unwrap_or_else(|_| MetadataValue::from_static("unknown"));

    let mut metadata = MetadataMap::new();
    metadata.insert(PROXY_FROM_KEY, value);
    metadata
}

/// Host part of an authority (`host`, `host:port`, `[v6]:port`).
pub fn host_of(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority
            .find(']')
            .map(|end| &authority[..=end])
            .unwrap_or(authority);
    }

    match authority.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => authority,
    }
}
