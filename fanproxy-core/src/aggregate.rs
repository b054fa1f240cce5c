//! # Response Aggregation
//!
//! A unary method can be fanned out when its reply wraps a list of per-node messages, each
//! carrying node metadata:
//!
//! ```proto
//! message VersionResponse { repeated Version response = 1; }
//! message Version { NodeMetadata metadata = 1; ... }
//! message NodeMetadata { string hostname = 1; ... }
//! ```
//!
//! [`AggregateShape`] locates those three fields once, when the method table is built.
//! Every target's reply is then reduced to its first sub-message, stamped with the target
//! name, and the sub-messages of all targets are assembled into one reply.
use crate::config::AggregationConfig;
use crate::target::Target;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, Value};
use tonic::Status;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("'{message}' has no field named '{field}'")]
    MissingField { message: String, field: String },
    #[error("'{message}.{field}' must be a repeated message field")]
    NotRepeatedMessage { message: String, field: String },
    #[error("'{message}.{field}' must be a message field")]
    NotMessage { message: String, field: String },
    #[error("'{message}.{field}' must be a string field")]
    NotString { message: String, field: String },
}

/// Location of the per-node list and the hostname inside a reply type.
#[derive(Debug, Clone)]
pub struct AggregateShape {
    output: MessageDescriptor,
    response: FieldDescriptor,
    metadata: FieldDescriptor,
    hostname: FieldDescriptor,
}

fn field(message: &MessageDescriptor, name: &str) -> Result<FieldDescriptor, ShapeError> {
    message
        .get_field_by_name(name)
        .ok_or_else(|| ShapeError::MissingField {
            message: message.full_name().to_string(),
            field: name.to_string(),
        })
}

impl AggregateShape {
    /// Checks that `output` has the aggregatable shape described by `config`.
    pub fn resolve(output: &MessageDescriptor, config: &AggregationConfig) -> Result<Self, ShapeError> {
        let response = field(output, &config.response_field)?;
        let item = match response.kind() {
            Kind::Message(item) if response.is_list() => item,
            _ => {
                return Err(ShapeError::NotRepeatedMessage {
                    message: output.full_name().to_string(),
                    field: response.name().to_string(),
                });
            }
        };

        let metadata = field(&item, &config.metadata_field)?;
        let node_metadata = match metadata.kind() {
            Kind::Message(node_metadata) if !metadata.is_list() && !metadata.is_map() => {
                node_metadata
            }
            _ => {
                return Err(ShapeError::NotMessage {
                    message: item.full_name().to_string(),
                    field: metadata.name().to_string(),
                });
            }
        };

        let hostname = field(&node_metadata, &config.hostname_field)?;
        if hostname.kind() != Kind::String || hostname.is_list() {
            return Err(ShapeError::NotString {
                message: node_metadata.full_name().to_string(),
                field: hostname.name().to_string(),
            });
        }

        Ok(Self {
            output: output.clone(),
            response,
            metadata,
            hostname,
        })
    }

    /// Reduces one target's reply to its first sub-message, stamped with `target`.
    ///
    /// Metadata fields other than the hostname are left untouched. A reply without any
    /// sub-message is an error for that target.
    pub fn first_sub_response(
        &self,
        mut reply: DynamicMessage,
        target: &Target,
    ) -> Result<DynamicMessage, Status> {
        let first = match reply.take_field(&self.response) {
            Some(Value::List(items)) => items.into_iter().next(),
            _ => None,
        };

        let Some(Value::Message(mut item)) = first else {
            return Err(Status::internal(format!(
                "'{}' reply from {target} holds no '{}' entry",
                self.output.full_name(),
                self.response.name()
            )));
        };

        if let Value::Message(metadata) = item.get_field_mut(&self.metadata) {
            metadata.set_field(&self.hostname, Value::String(target.to_string()));
        }

        Ok(item)
    }

    /// Wraps the per-node messages into a single reply.
    pub fn assemble(&self, items: impl IntoIterator<Item = DynamicMessage>) -> DynamicMessage {
        let items: Vec<Value> = items.into_iter().map(Value::Message).collect();

        let mut reply = DynamicMessage::new(self.output.clone());
        if !items.is_empty() {
            reply.set_field(&self.response, Value::List(items));
        }
        reply
    }

    /// Hostname stamped on a sub-message, if any.
    pub fn hostname_of(&self, item: &DynamicMessage) -> Option<String> {
        match &*item.get_field(&self.metadata) {
            Value::Message(metadata) => metadata
                .get_field(&self.hostname)
                .as_str()
                .map(ToString::to_string),
            _ => None,
        }
    }

    /// The sub-messages of an assembled reply.
    pub fn items(&self, reply: &DynamicMessage) -> Vec<DynamicMessage> {
        match &*reply.get_field(&self.response) {
            Value::List(items) => items
                .iter()
                .filter_map(|item| item.as_message().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }
}
