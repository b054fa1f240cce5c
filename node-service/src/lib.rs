//! # Node Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide the `node.NodeService`
//! schema used to integration test the `fanproxy` runtime.
//! It is not intended for production use.
//!
//! The schema is assembled directly as a `FileDescriptorSet` so the tests do not
//! depend on `protoc` being installed. It is equivalent to:
//!
//! ```proto
//! syntax = "proto3";
//! package node;
//!
//! message NodeMetadata { string hostname = 1; string error = 2; }
//! message VersionRequest {}
//! message Version { NodeMetadata metadata = 1; string tag = 2; }
//! message VersionResponse { repeated Version response = 1; }
//! message PingReply { string message = 1; }
//! message LogsRequest { int32 lines = 1; }
//! message LogEntry { NodeMetadata metadata = 1; string line = 2; }
//!
//! service NodeService {
//!   rpc Version(VersionRequest) returns (VersionResponse);
//!   rpc LegacyVersion(VersionRequest) returns (VersionResponse) { option deprecated = true; }
//!   rpc Ping(VersionRequest) returns (PingReply);
//!   rpc Logs(LogsRequest) returns (stream LogEntry);
//!   rpc Collect(stream LogEntry) returns (stream LogEntry);
//! }
//! ```
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, MethodOptions, ServiceDescriptorProto,
    field_descriptor_proto::{Label, Type},
};

pub const SERVICE: &str = "node.NodeService";

pub const VERSION_PATH: &str = "/node.NodeService/Version";
pub const LEGACY_VERSION_PATH: &str = "/node.NodeService/LegacyVersion";
pub const PING_PATH: &str = "/node.NodeService/Ping";
pub const LOGS_PATH: &str = "/node.NodeService/Logs";
pub const COLLECT_PATH: &str = "/node.NodeService/Collect";

/// The `node.NodeService` schema as a descriptor set.
pub fn file_descriptor_set() -> FileDescriptorSet {
    let file = FileDescriptorProto {
        name: Some("node/node.proto".to_string()),
        package: Some("node".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            message(
                "NodeMetadata",
                vec![
                    scalar("hostname", 1, Type::String),
                    scalar("error", 2, Type::String),
                ],
            ),
            message("VersionRequest", vec![]),
            message(
                "Version",
                vec![
                    nested("metadata", 1, ".node.NodeMetadata", Label::Optional),
                    scalar("tag", 2, Type::String),
                ],
            ),
            message(
                "VersionResponse",
                vec![nested("response", 1, ".node.Version", Label::Repeated)],
            ),
            message("PingReply", vec![scalar("message", 1, Type::String)]),
            message("LogsRequest", vec![scalar("lines", 1, Type::Int32)]),
            message(
                "LogEntry",
                vec![
                    nested("metadata", 1, ".node.NodeMetadata", Label::Optional),
                    scalar("line", 2, Type::String),
                ],
            ),
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("NodeService".to_string()),
            method: vec![
                method("Version", ".node.VersionRequest", ".node.VersionResponse"),
                MethodDescriptorProto {
                    options: Some(MethodOptions {
                        deprecated: Some(true),
                        ..Default::default()
                    }),
                    ..method(
                        "LegacyVersion",
                        ".node.VersionRequest",
                        ".node.VersionResponse",
                    )
                },
                method("Ping", ".node.VersionRequest", ".node.PingReply"),
                MethodDescriptorProto {
                    server_streaming: Some(true),
                    ..method("Logs", ".node.LogsRequest", ".node.LogEntry")
                },
                MethodDescriptorProto {
                    client_streaming: Some(true),
                    server_streaming: Some(true),
                    ..method("Collect", ".node.LogEntry", ".node.LogEntry")
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    FileDescriptorSet { file: vec![file] }
}

/// The descriptor set encoded as bytes, as it would be read from a `.bin` file.
pub fn encoded_file_descriptor_set() -> Vec<u8> {
    file_descriptor_set().encode_to_vec()
}

/// A descriptor pool containing the `node.NodeService` schema.
pub fn descriptor_pool() -> DescriptorPool {
    DescriptorPool::from_file_descriptor_set(file_descriptor_set())
        .expect("node.proto descriptors are valid")
}

fn message(name: &str, field: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field,
        ..Default::default()
    }
}

fn scalar(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        json_name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        ..Default::default()
    }
}

fn nested(name: &str, number: i32, type_name: &str, label: Label) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        json_name: Some(name.to_string()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(Type::Message as i32),
        type_name: Some(type_name.to_string()),
        ..Default::default()
    }
}

fn method(name: &str, input: &str, output: &str) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(input.to_string()),
        output_type: Some(output.to_string()),
        ..Default::default()
    }
}
