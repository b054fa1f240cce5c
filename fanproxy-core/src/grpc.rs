//! # Generic gRPC Transport
//!
//! This module contains the low-level building blocks for moving messages through the proxy
//! without compile-time knowledge of their Protobuf types.
//!
//! * [`codec::DynamicCodec`] carries `prost_reflect::DynamicMessage` values, which is how the
//!   proxy itself forwards and aggregates calls.
//! * [`codec::JsonCodec`] and [`client::GrpcClient`] carry `serde_json::Value` payloads and
//!   power the `fanproxy call` command.
pub mod client;
pub mod codec;
