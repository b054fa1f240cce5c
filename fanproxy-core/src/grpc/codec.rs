//! # Schema-Driven Codecs
//!
//! Two `tonic::codec::Codec` implementations that work from a `MessageDescriptor` known only at
//! runtime:
//!
//! * [`DynamicCodec`] moves `DynamicMessage` values. The proxy uses it on both sides of a
//!   forwarded call. Encoding needs no schema, a `DynamicMessage` carries its own descriptor.
//!   Decoding is given the schema of the incoming message: the method input when serving,
//!   the method output when calling a member node.
//! * [`JsonCodec`] moves `serde_json::Value` payloads for `fanproxy call`. It is a thin layer
//!   over the same decoding, converting to and from JSON at the edge.
use prost::Message;
use prost::bytes::Buf;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

fn merge_message(desc: &MessageDescriptor, src: &mut impl Buf) -> Result<DynamicMessage, Status> {
    let mut msg = DynamicMessage::new(desc.clone());
    msg.merge(src).map_err(|e| {
        Status::internal(format!(
            "Failed to decode Protobuf bytes as '{}': {e}",
            desc.full_name()
        ))
    })?;
    Ok(msg)
}

fn message_from_json(
    desc: &MessageDescriptor,
    value: serde_json::Value,
) -> Result<DynamicMessage, Status> {
    DynamicMessage::deserialize(desc.clone(), value).map_err(|e| {
        Status::invalid_argument(format!(
            "JSON does not match the schema of '{}': {e}",
            desc.full_name()
        ))
    })
}

fn message_to_json(msg: &DynamicMessage) -> Result<serde_json::Value, Status> {
    serde_json::to_value(msg).map_err(|e| {
        Status::internal(format!(
            "Failed to map '{}' to JSON: {e}",
            msg.descriptor().full_name()
        ))
    })
}

/// Moves `DynamicMessage` values in Protobuf binary format.
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    incoming: MessageDescriptor,
}

impl DynamicCodec {
    /// A codec decoding messages of type `incoming`.
    pub fn new(incoming: MessageDescriptor) -> Self {
        Self { incoming }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;

    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.incoming.clone())
    }
}

#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode_raw(dst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        merge_message(&self.0, src).map(Some)
    }
}

/// [`DynamicCodec`] for a relayed request stream, whose items may carry a failure.
///
/// Encoding an `Err` fails the request body, so the receiving node sees the stream reset
/// instead of a clean end.
#[derive(Debug, Clone)]
pub struct RelayCodec {
    incoming: MessageDescriptor,
}

impl RelayCodec {
    /// A codec decoding replies of type `incoming`.
    pub fn new(incoming: MessageDescriptor) -> Self {
        Self { incoming }
    }
}

impl Codec for RelayCodec {
    type Encode = Result<DynamicMessage, Status>;
    type Decode = DynamicMessage;

    type Encoder = RelayEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RelayEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.incoming.clone())
    }
}

#[derive(Debug)]
pub struct RelayEncoder;

impl Encoder for RelayEncoder {
    type Item = Result<DynamicMessage, Status>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        DynamicEncoder.encode(item?, dst)
    }
}

/// Moves `serde_json::Value` payloads, validated against the method schema.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    request: MessageDescriptor,
    response: MessageDescriptor,
}

impl JsonCodec {
    pub fn new(request: MessageDescriptor, response: MessageDescriptor) -> Self {
        Self { request, response }
    }
}

impl Codec for JsonCodec {
    type Encode = serde_json::Value;
    type Decode = serde_json::Value;

    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder(self.request.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder(self.response.clone())
    }
}

#[derive(Debug)]
pub struct JsonEncoder(MessageDescriptor);

impl Encoder for JsonEncoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        message_from_json(&self.0, item)?.encode_raw(dst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct JsonDecoder(MessageDescriptor);

impl Decoder for JsonDecoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let msg = merge_message(&self.0, src)?;
        message_to_json(&msg).map(Some)
    }
}
