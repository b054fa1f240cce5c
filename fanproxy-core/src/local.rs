//! # Local Backends
//!
//! Calls served by this node (not forwarded, or already forwarded once) are passed as plain
//! HTTP/2 requests to the process implementing the service, listening on a unix socket.
//!
//! [`LocalBackends`] picks the socket from the service part of the request path, so several
//! services can sit behind the same proxy.
use crate::BoxError;
use crate::config::LocalConfig;
use futures_util::future::BoxFuture;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::UnixStream;
use tonic::body::Body;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::{Service, ServiceExt, service_fn};

/// Endpoint used for unix socket channels. The address is never resolved.
pub(crate) fn unix_endpoint() -> Endpoint {
    Endpoint::from_static("http://[::]:50000")
}

/// A connector that always dials `path`. Proxy environment variables are never consulted.
pub(crate) fn unix_connector(
    path: PathBuf,
) -> impl Service<Uri, Response = TokioIo<UnixStream>, Error = std::io::Error, Future: Send>
+ Clone
+ Send
+ 'static {
    service_fn(move |_: Uri| {
        let path = path.clone();
        async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
    })
}

/// Routes each request to the unix socket of its service.
#[derive(Debug, Clone)]
pub struct LocalBackends {
    channels: Arc<HashMap<String, Channel>>,
    fallback: Option<Channel>,
}

impl LocalBackends {
    /// Builds lazily connected channels for every configured socket.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_config(config: &LocalConfig) -> Self {
        let mut by_path: HashMap<PathBuf, Channel> = HashMap::new();
        let mut channel_for = |path: &PathBuf| {
            by_path
                .entry(path.clone())
                .or_insert_with(|| {
                    unix_endpoint().connect_with_connector_lazy(unix_connector(path.clone()))
                })
                .clone()
        };

        let channels = config
            .sockets
            .iter()
            .map(|(service, path)| (service.clone(), channel_for(path)))
            .collect();
        let fallback = config.default_socket.as_ref().map(channel_for);

        Self {
            channels: Arc::new(channels),
            fallback,
        }
    }

    fn channel(&self, service: &str) -> Option<Channel> {
        self.channels
            .get(service)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Service part of a gRPC path: `/pkg.Service/Method` -> `pkg.Service`.
pub fn service_name(path: &str) -> &str {
    let path = path.trim_start_matches('/');
    path.split_once('/').map_or(path, |(service, _)| service)
}

impl Service<http::Request<Body>> for LocalBackends {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let service = service_name(req.uri().path()).to_string();
        let channel = self.channel(&service);

        Box::pin(async move {
            let Some(channel) = channel else {
                return Ok(tonic::Status::unimplemented(format!(
                    "service '{service}' is not served by this node"
                ))
                .into_http());
            };

            match channel.oneshot(req).await {
                Ok(response) => Ok(response),
                Err(err) => Ok(tonic::Status::from_error(BoxError::from(err)).into_http()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_strips_the_method() {
        assert_eq!(service_name("/node.NodeService/Version"), "node.NodeService");
        assert_eq!(service_name("node.NodeService"), "node.NodeService");
    }

    #[tokio::test]
    async fn unknown_service_is_unimplemented() {
        let mut backends = LocalBackends::from_config(&LocalConfig::default());
        let request = http::Request::builder()
            .uri("/other.Service/Call")
            .body(Body::empty())
            .unwrap();

        let response = backends.call(request).await.unwrap();
        let status = tonic::Status::from_header_map(response.headers()).unwrap();

        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn unreachable_socket_is_reported_as_status() {
        let config = LocalConfig {
            default_socket: Some(PathBuf::from("/nonexistent/fanproxy.sock")),
            ..Default::default()
        };
        let mut backends = LocalBackends::from_config(&config);
        let request = http::Request::builder()
            .uri("http://[::]:50000/node.NodeService/Version")
            .body(Body::empty())
            .unwrap();

        let response = backends.call(request).await.unwrap();
        let status = tonic::Status::from_header_map(response.headers()).unwrap();

        assert_ne!(status.code(), tonic::Code::Ok);
    }
}
