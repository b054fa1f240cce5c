//! # Proxy Service
//!
//! [`ProxyService`] is the `tower` service a node serves. It runs the [`Proxy`] interceptor on
//! every request and then either:
//!
//! * hands the untouched HTTP request to the local handler, or
//! * decodes the call with the method's schema and forwards it through the router.
//!
//! Unary replies are mapped as follows:
//!
//! | Outcome                           | Reply                                        |
//! |-----------------------------------|----------------------------------------------|
//! | every target answered             | aggregated reply                             |
//! | some targets failed               | aggregated reply + `proxy-errors` metadata   |
//! | no target answered, some failed   | status derived from the errors               |
//! | unknown method                    | `UNIMPLEMENTED`                              |
use crate::BoxError;
use crate::connect::Connector;
use crate::grpc::codec::DynamicCodec;
use crate::methods::RoutedMethod;
use crate::proxy::{Decision, InboundCall, Proxy};
use crate::router::{Dispatch, Forward, RelayedStream};
use futures_util::future::BoxFuture;
use prost_reflect::DynamicMessage;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::server::{StreamingService, UnaryService};
use tonic::{Request, Response, Status, Streaming};
use tower::{Service, ServiceExt};

/// The inbound `:authority`, or the `host` header.
fn authority_of<B>(req: &http::Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|host| host.to_str().ok())
                .map(ToString::to_string)
        })
}

/// Serves the proxy in front of a local handler `L`.
pub struct ProxyService<C, L> {
    proxy: Arc<Proxy<C>>,
    local: L,
}

impl<C, L: Clone> Clone for ProxyService<C, L> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            local: self.local.clone(),
        }
    }
}

impl<C, L> ProxyService<C, L> {
    pub fn new(proxy: impl Into<Arc<Proxy<C>>>, local: L) -> Self {
        Self {
            proxy: proxy.into(),
            local,
        }
    }
}

impl<C, L> Service<http::Request<Body>> for ProxyService<C, L>
where
    C: Connector,
    L: Service<http::Request<Body>, Response = http::Response<Body>> + Clone + Send + 'static,
    L::Future: Send + 'static,
    L::Error: Into<BoxError>,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let proxy = self.proxy.clone();
        let local = self.local.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            let authority = authority_of(&req);
            let metadata = MetadataMap::from_headers(req.headers().clone());

            let decision = proxy.decide(InboundCall {
                path: &path,
                metadata: &metadata,
                authority: authority.as_deref(),
            });

            match decision {
                Err(status) => Ok(status.into_http()),
                Ok(Decision::Local) => match local.oneshot(req).await {
                    Ok(response) => Ok(response),
                    Err(err) => Ok(Status::from_error(err.into()).into_http()),
                },
                Ok(Decision::Forward(forward)) => Ok(forward_call(proxy, path, forward, req).await),
            }
        })
    }
}

async fn forward_call<C: Connector>(
    proxy: Arc<Proxy<C>>,
    path: String,
    forward: Forward,
    req: http::Request<Body>,
) -> http::Response<Body> {
    let Some(routed) = proxy.router().methods().get(&path).cloned() else {
        return unimplemented(&path).into_http();
    };

    let input = routed.descriptor().input();
    let mut grpc = tonic::server::Grpc::new(DynamicCodec::new(input));

    match routed {
        RoutedMethod::Unary { .. } => {
            let handler = UnaryForward {
                proxy,
                path,
                forward: Some(forward),
            };
            grpc.unary(handler, req).await
        }
        RoutedMethod::Streaming { .. } => {
            let handler = StreamForward {
                proxy,
                path,
                forward: Some(forward),
            };
            grpc.streaming(handler, req).await
        }
    }
}

fn unimplemented(path: &str) -> Status {
    Status::unimplemented(format!("method '{path}' is not proxied"))
}

struct UnaryForward<C> {
    proxy: Arc<Proxy<C>>,
    path: String,
    forward: Option<Forward>,
}

impl<C: Connector> UnaryService<DynamicMessage> for UnaryForward<C> {
    type Response = DynamicMessage;
    type Future = BoxFuture<'static, Result<Response<DynamicMessage>, Status>>;

    fn call(&mut self, request: Request<DynamicMessage>) -> Self::Future {
        let proxy = self.proxy.clone();
        let path = self.path.clone();
        let forward = self.forward.take();

        Box::pin(async move {
            let forward = forward.ok_or_else(|| Status::internal("call already forwarded"))?;

            match proxy
                .router()
                .unary(&path, forward, request.into_inner())
                .await
            {
                Dispatch::Matched(aggregated) => aggregated.into_response(),
                Dispatch::Unmatched => Err(unimplemented(&path)),
            }
        })
    }
}

struct StreamForward<C> {
    proxy: Arc<Proxy<C>>,
    path: String,
    forward: Option<Forward>,
}

impl<C: Connector> StreamingService<DynamicMessage> for StreamForward<C> {
    type Response = DynamicMessage;
    type ResponseStream = RelayedStream;
    type Future = BoxFuture<'static, Result<Response<RelayedStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let proxy = self.proxy.clone();
        let path = self.path.clone();
        let forward = self.forward.take();

        Box::pin(async move {
            let forward = forward.ok_or_else(|| Status::internal("call already forwarded"))?;

            match proxy
                .router()
                .streaming(&path, forward, request.into_inner())
                .await
            {
                Dispatch::Matched(stream) => stream.map(Response::new),
                Dispatch::Unmatched => Err(unimplemented(&path)),
            }
        })
    }
}
