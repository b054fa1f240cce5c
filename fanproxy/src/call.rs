//! `fanproxy call`: a JSON gRPC call through a proxy node.
use crate::cli::TlsArgs;
use anyhow::Context;
use fanproxy_core::grpc::client::GrpcClient;
use fanproxy_core::methods::{find_method, load_descriptor_pool};
use fanproxy_core::prost_reflect::MethodDescriptor;
use fanproxy_core::router::PROXY_ERRORS_KEY;
use fanproxy_core::target::TARGETS_KEY;
use fanproxy_core::tls::{Credentials, FileCertificateProvider};
use fanproxy_core::tonic::transport::{Channel, Endpoint};
use fanproxy_core::tonic::{Response, Status};
use futures_util::{Stream, StreamExt};
use std::path::PathBuf;

pub struct CallArgs {
    pub url: String,
    pub endpoint: String,
    pub body: serde_json::Value,
    pub targets: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub file_descriptor_set: PathBuf,
    pub tls: TlsArgs,
}

pub async fn run(args: CallArgs) -> anyhow::Result<()> {
    let pool = load_descriptor_pool(&args.file_descriptor_set).with_context(|| {
        format!("failed to load {}", args.file_descriptor_set.display())
    })?;
    let method = find_method(&pool, &args.endpoint)?;

    let channel = connect(&args.url, &args.tls).await?;
    let mut client = GrpcClient::new(channel);
    let headers = with_targets(args.headers, args.targets);

    match (method.is_client_streaming(), method.is_server_streaming()) {
        (false, false) => handle_unary(&mut client, method, args.body, headers).await,
        (false, true) => handle_server_stream(&mut client, method, args.body, headers).await,
        (true, _) => handle_streaming(&mut client, method, args.body, headers).await,
    }
}

async fn connect(url: &str, tls: &TlsArgs) -> anyhow::Result<Channel> {
    let mut endpoint = Endpoint::from_shared(url.to_string())
        .with_context(|| format!("invalid proxy url '{url}'"))?;

    if let (Some(ca), Some(cert), Some(key)) = (&tls.ca, &tls.cert, &tls.key) {
        let provider = FileCertificateProvider::new(ca, cert, key);
        let credentials = Credentials::mutual(&provider, None)?;
        endpoint = endpoint
            .tls_config(credentials.client_tls_config())
            .context("invalid TLS configuration")?;
    }

    endpoint
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))
}

/// Each target travels as its own `targets` entry.
fn with_targets(mut headers: Vec<(String, String)>, targets: Vec<String>) -> Vec<(String, String)> {
    headers.extend(targets.into_iter().map(|target| (TARGETS_KEY.to_string(), target)));
    headers
}

async fn handle_unary(
    client: &mut GrpcClient,
    method: MethodDescriptor,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
) -> anyhow::Result<()> {
    match client.unary(method, body, headers).await? {
        Ok(response) => print_reply(response),
        Err(status) => print_status(status),
    }
    Ok(())
}

async fn handle_server_stream(
    client: &mut GrpcClient,
    method: MethodDescriptor,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
) -> anyhow::Result<()> {
    match client.server_streaming(method, body, headers).await? {
        Ok(stream) => print_stream(stream).await,
        Err(status) => print_status(status),
    }
    Ok(())
}

async fn handle_streaming(
    client: &mut GrpcClient,
    method: MethodDescriptor,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let input_stream = json_array_to_stream(body)?;
    match client.streaming(method, input_stream, headers).await? {
        Ok(stream) => print_stream(stream).await,
        Err(status) => print_status(status),
    }
    Ok(())
}

fn json_array_to_stream(
    json: serde_json::Value,
) -> anyhow::Result<impl Stream<Item = serde_json::Value> + Send + 'static> {
    match json {
        serde_json::Value::Array(items) => Ok(tokio_stream::iter(items)),
        _ => Err(anyhow::anyhow!("Streaming calls require a JSON Array body")),
    }
}

fn print_reply(response: Response<serde_json::Value>) {
    // Partial failures come back next to the aggregated reply.
    if let Some(errors) = response.metadata().get(PROXY_ERRORS_KEY) {
        eprintln!(
            "Some targets failed: {}",
            errors.to_str().unwrap_or("<non-ascii error summary>")
        );
    }
    print_json(response.get_ref());
}

fn print_json(val: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(val).unwrap_or_else(|_| val.to_string())
    );
}

fn print_status(status: Status) {
    eprintln!(
        "gRPC Failed: code={:?} message={:?}",
        status.code(),
        status.message()
    );
}

async fn print_stream(stream: impl Stream<Item = Result<serde_json::Value, Status>>) {
    let mut stream = std::pin::pin!(stream);
    while let Some(result) = stream.next().await {
        match result {
            Ok(val) => print_json(&val),
            Err(status) => print_status(status),
        }
    }
}
