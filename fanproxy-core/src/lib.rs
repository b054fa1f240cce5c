//! # Fanproxy Core
//!
//! `fanproxy-core` is the runtime behind the `fanproxy` node daemon. It lets one control node
//! issue a single logical gRPC call that is dispatched concurrently to an arbitrary set of
//! member nodes, and folds the per-node replies into one aggregated response.
//!
//! ## Key Components
//!
//! * **[`proxy::Proxy`]:** The interceptor. It decides, per inbound call, whether the call is
//!   served locally or forwarded, fetches mutual-TLS credentials for the forwarded hop and
//!   prevents forwarding loops through the `proxyfrom` marker.
//! * **[`server::ProxyService`]:** A `tower` service wrapping the local handler with the
//!   interceptor, ready to be served by `tonic::transport::Server`.
//! * **[`router::ProxyRouter`]:** Maps a wire method name to a routed method, dials every
//!   target, fans the call out and aggregates the replies.
//! * **[`fanout::fan_out`]:** The concurrent executor. One task per target and a single join point.
//! * **[`relay::relay`]:** The single-target copy loop used by streaming calls.
//!
//! ## Schemas
//!
//! The proxy is not generated per service. Every routable method is discovered once at
//! startup from a protobuf `FileDescriptorSet` (see [`methods::MethodTable`]), and messages
//! travel through the proxy as `prost_reflect::DynamicMessage` values using the
//! [`grpc::codec::DynamicCodec`].
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod aggregate;
pub mod config;
pub mod connect;
pub mod fanout;
pub mod grpc;
pub mod local;
pub mod methods;
pub mod proxy;
pub mod relay;
pub mod router;
pub mod server;
pub mod target;
pub mod tls;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
