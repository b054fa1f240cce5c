//! # Method Table
//!
//! Maps wire method names (`/package.Service/Method`) to the way the proxy routes them.
//!
//! The table is built once at startup from a protobuf `FileDescriptorSet`. Two kinds of
//! methods never make it into the table:
//!
//! * deprecated methods;
//! * unary methods whose reply does not have the aggregatable shape (see
//!   [`crate::aggregate::AggregateShape`]).
//!
//! Calls to such methods are not fanned out, the proxy treats them as unknown.
use crate::aggregate::AggregateShape;
use crate::config::AggregationConfig;
use crate::grpc::client::http_path;
use crate::target::CallKind;
use prost_reflect::{DescriptorPool, MethodDescriptor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum DescriptorError {
    #[error("Failed to read descriptor file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode descriptor set: {0}")]
    Decode(#[from] prost_reflect::DescriptorError),
    #[error("Service '{0}' not found")]
    ServiceNotFound(String),
    #[error("Method '{0}' not found")]
    MethodNotFound(String),
    #[error("Invalid method path. Expected format 'package.Service/Method', got '{0}'")]
    InvalidFormat(String),
}

/// Loads a binary `FileDescriptorSet` from disk.
pub fn load_descriptor_pool(path: impl AsRef<Path>) -> Result<DescriptorPool, DescriptorError> {
    let bytes = std::fs::read(path)?;
    Ok(DescriptorPool::decode(bytes.as_slice())?)
}

/// Resolves `package.Service/Method` into a method descriptor.
pub fn find_method(pool: &DescriptorPool, method_path: &str) -> Result<MethodDescriptor, DescriptorError> {
    let (service_name, method_name) = method_path
        .trim_start_matches('/')
        .split_once('/')
        .ok_or_else(|| DescriptorError::InvalidFormat(method_path.to_string()))?;

    let service = pool
        .get_service_by_name(service_name)
        .ok_or_else(|| DescriptorError::ServiceNotFound(service_name.to_string()))?;

    service
        .methods()
        .find(|m| m.name() == method_name)
        .ok_or_else(|| DescriptorError::MethodNotFound(method_name.to_string()))
}

/// How a method is proxied.
#[derive(Debug, Clone)]
pub enum RoutedMethod {
    /// Fanned out to every target, replies are aggregated.
    Unary {
        method: MethodDescriptor,
        shape: AggregateShape,
    },
    /// Relayed to a single target.
    Streaming { method: MethodDescriptor },
}

impl RoutedMethod {
    pub fn descriptor(&self) -> &MethodDescriptor {
        match self {
            RoutedMethod::Unary { method, .. } | RoutedMethod::Streaming { method } => method,
        }
    }

    pub fn kind(&self) -> CallKind {
        match self {
            RoutedMethod::Unary { .. } => CallKind::Unary,
            RoutedMethod::Streaming { .. } => CallKind::Streaming,
        }
    }

    /// Fully qualified name of the service owning the method.
    pub fn service(&self) -> &str {
        self.descriptor().parent_service().full_name()
    }
}

fn is_deprecated(method: &MethodDescriptor) -> bool {
    method
        .method_descriptor_proto()
        .options
        .as_ref()
        .and_then(|options| options.deprecated)
        .unwrap_or(false)
}

/// Wire method name -> routed method.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, RoutedMethod>,
}

impl MethodTable {
    /// Walks every service of `pool`.
    pub fn build(pool: &DescriptorPool, config: &AggregationConfig) -> Self {
        let mut methods = HashMap::new();

        for service in pool.services() {
            for method in service.methods() {
                let path = http_path(&method).to_string();

                if is_deprecated(&method) {
                    debug!(method = %path, "skipping deprecated method");
                    continue;
                }

                let routed = if method.is_client_streaming() || method.is_server_streaming() {
                    RoutedMethod::Streaming { method }
                } else {
                    match AggregateShape::resolve(&method.output(), config) {
                        Ok(shape) => RoutedMethod::Unary { method, shape },
                        Err(err) => {
                            warn!(method = %path, error = %err, "method reply cannot be aggregated, skipping");
                            continue;
                        }
                    }
                };

                methods.insert(path, routed);
            }
        }

        debug!(methods = methods.len(), "method table built");
        Self { methods }
    }

    pub fn get(&self, path: &str) -> Option<&RoutedMethod> {
        self.methods.get(path)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Every routable wire name, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}
