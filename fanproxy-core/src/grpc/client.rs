//! # JSON gRPC Client
//!
//! [`GrpcClient`] calls any method described by a `MethodDescriptor` with `serde_json::Value`
//! payloads. It is what `fanproxy call` uses to talk to a proxy node, and what the integration
//! tests use to drive an in-process [`crate::server::ProxyService`].
//!
//! Headers are given as string pairs. A repeated name is appended rather than replaced, which is
//! how a list of `targets` reaches the proxy.
use super::codec::JsonCodec;
use crate::BoxError;
use futures_util::Stream;
use http::uri::PathAndQuery;
use http_body::Body as HttpBody;
use prost_reflect::MethodDescriptor;
use std::str::FromStr;
use tonic::{
    Request, Response, Status,
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::Channel,
};

/// A call that could not be sent. Errors returned by the server are a `Status` instead.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
    #[error("The connection is not ready: {0}")]
    NotReady(#[source] BoxError),
    #[error("Invalid header name '{name}': {source}")]
    HeaderName {
        name: String,
        #[source]
        source: InvalidMetadataKey,
    },
    #[error("Invalid value for header '{name}': {source}")]
    HeaderValue {
        name: String,
        #[source]
        source: InvalidMetadataValue,
    },
}

/// Builds the HTTP/2 path of a method, e.g. `/node.NodeService/Version`.
pub fn http_path(method: &MethodDescriptor) -> PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    PathAndQuery::from_str(&path).expect("valid gRPC path")
}

fn build_request<T>(payload: T, headers: Vec<(String, String)>) -> Result<Request<T>, CallError> {
    let mut request = Request::new(payload);
    for (name, value) in headers {
        let key = MetadataKey::from_str(&name).map_err(|source| CallError::HeaderName {
            name: name.clone(),
            source,
        })?;
        let value = MetadataValue::from_str(&value)
            .map_err(|source| CallError::HeaderValue { name, source })?;
        request.metadata_mut().append(key, value);
    }
    Ok(request)
}

/// Everything needed to put one call on the wire.
struct Prepared<T> {
    request: Request<T>,
    path: PathAndQuery,
    codec: JsonCodec,
}

/// A JSON client for any gRPC method, over any `tonic` transport.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    inner: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self {
            inner: tonic::client::Grpc::new(service),
        }
    }

    async fn prepare<T>(
        &mut self,
        method: &MethodDescriptor,
        payload: T,
        headers: Vec<(String, String)>,
    ) -> Result<Prepared<T>, CallError> {
        let request = build_request(payload, headers)?;

        self.inner
            .ready()
            .await
            .map_err(|e| CallError::NotReady(e.into()))?;

        Ok(Prepared {
            request,
            path: http_path(method),
            codec: JsonCodec::new(method.input(), method.output()),
        })
    }

    /// One request, one reply.
    ///
    /// The outer error means the call never left, the inner one is the server's answer. The
    /// reply keeps its metadata, so `proxy-errors` can be inspected.
    pub async fn unary(
        &mut self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
    ) -> Result<Result<Response<serde_json::Value>, Status>, CallError> {
        let Prepared {
            request,
            path,
            codec,
        } = self.prepare(&method, payload, headers).await?;

        Ok(self.inner.unary(request, path, codec).await)
    }

    /// One request, a stream of replies.
    pub async fn server_streaming(
        &mut self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
    ) -> Result<Result<impl Stream<Item = Result<serde_json::Value, Status>>, Status>, CallError>
    {
        let Prepared {
            request,
            path,
            codec,
        } = self.prepare(&method, payload, headers).await?;

        Ok(self
            .inner
            .server_streaming(request, path, codec)
            .await
            .map(Response::into_inner))
    }

    /// A stream of requests, a stream of replies.
    ///
    /// Client streaming methods use the same exchange, their reply stream holds one message.
    pub async fn streaming(
        &mut self,
        method: MethodDescriptor,
        payloads: impl Stream<Item = serde_json::Value> + Send + 'static,
        headers: Vec<(String, String)>,
    ) -> Result<Result<impl Stream<Item = Result<serde_json::Value, Status>>, Status>, CallError>
    {
        let Prepared {
            request,
            path,
            codec,
        } = self.prepare(&method, payloads, headers).await?;

        Ok(self
            .inner
            .streaming(request, path, codec)
            .await
            .map(Response::into_inner))
    }
}
