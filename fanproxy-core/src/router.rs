//! # Fan-Out Router
//!
//! Given a wire method name and the resolved targets of a call, the router dials the targets,
//! runs the call and shapes the result:
//!
//! * unary methods are fanned out to every target, and the stamped replies are aggregated into
//!   one [`Aggregated`] reply;
//! * streaming methods are relayed to the first target only.
//!
//! Names missing from the [`MethodTable`] yield [`Dispatch::Unmatched`], which is not an error:
//! the caller decides what an unknown method means.
use crate::connect::{Connector, ProxyClient, dial_all};
use crate::fanout::{CompositeError, fan_out};
use crate::grpc::client::http_path;
use crate::grpc::codec::{DynamicCodec, RelayCodec};
use crate::methods::{MethodTable, RoutedMethod};
use crate::relay::{RelayError, ResponseSink, relay};
use crate::target::Target;
use crate::tls::Credentials;
use prost_reflect::DynamicMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Extensions, Request, Response, Status, Streaming};
use tracing::{debug, warn};

/// Response metadata key summarizing the targets that failed in a partially successful call.
pub const PROXY_ERRORS_KEY: &str = "proxy-errors";

/// Outcome of routing a method name.
#[derive(Debug)]
pub enum Dispatch<T> {
    Matched(T),
    /// The method is not routable.
    Unmatched,
}

/// Everything needed to forward one inbound call.
#[derive(Debug, Clone)]
pub struct Forward {
    pub targets: Vec<Target>,
    pub credentials: Credentials,
    /// Metadata sent with every forwarded call.
    pub outgoing: MetadataMap,
}

/// The aggregated reply of a unary fan-out.
#[derive(Debug)]
pub struct Aggregated {
    /// Always present, empty when no target answered.
    pub response: DynamicMessage,
    /// Number of targets whose answer is part of `response`.
    pub delivered: usize,
    pub errors: Option<CompositeError>,
}

impl Aggregated {
    /// Maps the aggregate onto a gRPC reply.
    ///
    /// Partial failures are reported in the `proxy-errors` metadata. Only when no target
    /// answered and at least one failed does the call fail.
    pub fn into_response(self) -> Result<Response<DynamicMessage>, Status> {
        let Some(errors) = self.errors else {
            return Ok(Response::new(self.response));
        };

        if self.delivered == 0 {
            return Err(errors.to_status());
        }

        let mut response = Response::new(self.response);
        let summary: String = errors
            .summary()
            .chars()
            .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
            .collect();
        if let Ok(value) = MetadataValue::try_from(summary) {
            response.metadata_mut().insert(PROXY_ERRORS_KEY, value);
        }
        Ok(response)
    }
}

/// The response stream of a relayed streaming call.
pub type RelayedStream = ReceiverStream<Result<DynamicMessage, Status>>;

/// Dispatches proxied calls according to a [`MethodTable`].
#[derive(Debug)]
pub struct ProxyRouter<C> {
    methods: Arc<MethodTable>,
    connector: C,
    max_concurrency: Option<usize>,
    stream_buffer: usize,
}

impl<C: Connector> ProxyRouter<C> {
    pub fn new(methods: impl Into<Arc<MethodTable>>, connector: C) -> Self {
        Self {
            methods: methods.into(),
            connector,
            max_concurrency: None,
            stream_buffer: 16,
        }
    }

    /// Bounds the number of concurrently running calls of one fan-out.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Capacity of the channel feeding relayed response streams.
    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Fans a unary call out to every target and aggregates the replies.
    pub async fn unary(
        &self,
        path: &str,
        forward: Forward,
        request: DynamicMessage,
    ) -> Dispatch<Aggregated> {
        let Some(RoutedMethod::Unary { method, shape }) = self.methods.get(path) else {
            return Dispatch::Unmatched;
        };

        let service = method.parent_service().full_name();
        let (clients, mut errors) = dial_all(
            &self.connector,
            forward.targets,
            service,
            &forward.credentials,
            &forward.outgoing,
        )
        .await;

        let wire_path = http_path(method);
        let output = method.output();

        let outcome = fan_out(clients, self.max_concurrency, |client: ProxyClient| {
            let request = request.clone();
            let wire_path = wire_path.clone();
            let codec = DynamicCodec::new(output.clone());
            let shape = shape.clone();

            async move {
                let ProxyClient {
                    target,
                    channel,
                    metadata,
                } = client;

                let mut grpc = tonic::client::Grpc::new(channel);
                grpc.ready()
                    .await
                    .map_err(|e| Status::unavailable(format!("connection not ready: {e}")))?;

                let request = Request::from_parts(metadata, Extensions::default(), request);
                let reply = grpc.unary(request, wire_path, codec).await?.into_inner();

                shape.first_sub_response(reply, &target)
            }
        })
        .await;

        errors.extend(outcome.errors);
        let delivered = outcome.responses.len();
        let response = shape.assemble(outcome.responses.into_iter().map(|(_, item)| item));

        if !errors.is_empty() {
            warn!(method = path, delivered, failed = errors.len(), "fan-out finished with errors");
        } else {
            debug!(method = path, delivered, "fan-out finished");
        }

        Dispatch::Matched(Aggregated {
            response,
            delivered,
            errors: CompositeError::from_errors(errors),
        })
    }

    /// Relays a streaming call to the first target.
    ///
    /// The inbound request stream is copied to the target and the target's response stream
    /// is copied back. A receive error on the target side ends the returned stream with that
    /// error. A receive error on the caller side resets the call at the target and also ends
    /// the returned stream with that error.
    pub async fn streaming(
        &self,
        path: &str,
        forward: Forward,
        inbound: Streaming<DynamicMessage>,
    ) -> Dispatch<Result<RelayedStream, Status>> {
        let Some(RoutedMethod::Streaming { method }) = self.methods.get(path) else {
            return Dispatch::Unmatched;
        };

        let Some(target) = forward.targets.into_iter().next() else {
            return Dispatch::Matched(Err(Status::invalid_argument(
                "no target to relay the stream to",
            )));
        };

        Dispatch::Matched(
            self.relay_to(
                method.clone(),
                target,
                forward.credentials,
                forward.outgoing,
                inbound,
            )
            .await,
        )
    }

    async fn relay_to(
        &self,
        method: prost_reflect::MethodDescriptor,
        target: Target,
        credentials: Credentials,
        outgoing: MetadataMap,
        mut inbound: Streaming<DynamicMessage>,
    ) -> Result<RelayedStream, Status> {
        let service = method.parent_service().full_name();
        let channel = self
            .connector
            .connect(&target, service, &credentials)
            .await
            .map_err(|e| Status::unavailable(format!("{target}: {e}")))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("{target}: connection not ready: {e}")))?;

        let (requests, outbound) = mpsc::channel(self.stream_buffer);
        let (responses, downstream) = mpsc::channel(self.stream_buffer);

        // Held weakly: the downstream ends with the response side.
        let weak_responses = responses.downgrade();
        tokio::spawn({
            let target = target.clone();
            async move {
                let mut requests = ResponseSink(requests);
                match relay(&mut inbound, &mut requests).await {
                    Ok(relayed) => debug!(%target, relayed, "request stream finished"),
                    Err(RelayError::Receive(status)) => {
                        debug!(%target, code = ?status.code(), "request stream failed, resetting the call");
                        let downstream = weak_responses.upgrade().map(ResponseSink);
                        // An error item fails the outbound body, the target never sees a clean end.
                        if requests.fail(status.clone()).await.is_err() {
                            debug!(%target, "upstream call already finished");
                        }
                        match downstream {
                            Some(sink) if sink.fail(status).await.is_ok() => {}
                            _ => debug!(%target, "downstream already closed"),
                        }
                    }
                    Err(err) => debug!(%target, error = %err, "request stream aborted"),
                }
            }
        });

        let request = Request::from_parts(
            outgoing,
            Extensions::default(),
            ReceiverStream::new(outbound),
        );
        let mut upstream = grpc
            .streaming(request, http_path(&method), RelayCodec::new(method.output()))
            .await?
            .into_inner();

        tokio::spawn(async move {
            let mut sink = ResponseSink(responses);
            match relay(&mut upstream, &mut sink).await {
                Ok(relayed) => debug!(%target, relayed, "response stream finished"),
                Err(RelayError::Receive(status)) => {
                    debug!(%target, code = ?status.code(), "response stream failed");
                    if sink.fail(status).await.is_err() {
                        debug!(%target, "downstream already closed");
                    }
                }
                Err(err) => debug!(%target, error = %err, "response stream aborted"),
            }
        });

        Ok(ReceiverStream::new(downstream))
    }
}
