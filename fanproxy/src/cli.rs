//! # CLI
//!
//! This module defines the command-line interface of `fanproxy` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are `key:value`);
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fanproxy", version, about = "Fan-out gRPC proxy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a proxy node
    ///
    /// The node serves every method of its descriptor set. Calls carrying `targets` are fanned
    /// out to the member nodes, everything else reaches the local services.
    Serve {
        /// Path to the configuration file (default: /etc/fanproxy/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Perform a gRPC call through a proxy node
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// fanproxy call https://10.0.0.1:50000 node.NodeService/Version \
    ///     --file-descriptor-set node.bin -t 10.0.0.2 -t 10.0.0.3 --body '{}'
    /// ```
    Call {
        /// The proxy URL to connect to (e.g. https://10.0.0.1:50000)
        url: String,

        /// Endpoint (package.Service/Method)
        #[arg(value_parser = parse_endpoint)]
        endpoint: String,

        /// JSON body (Object for Unary, Array for Streaming)
        #[arg(long, value_parser = parse_body, default_value = "{}")]
        body: serde_json::Value,

        /// Member node the call is forwarded to. Repeat to fan out.
        #[arg(short = 't', long = "target")]
        targets: Vec<String>,

        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Path to the descriptor set (.bin)
        #[arg(long)]
        file_descriptor_set: PathBuf,

        #[command(flatten)]
        tls: TlsArgs,
    },
}

/// Client certificate material. Either all three files are given, or none and the call is made
/// in plain text.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TlsArgs {
    /// CA bundle used to verify the proxy
    #[arg(long, requires_all = ["cert", "key"])]
    pub ca: Option<PathBuf>,
    /// Client certificate (PEM)
    #[arg(long, requires_all = ["ca", "key"])]
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    #[arg(long, requires_all = ["ca", "cert"])]
    pub key: Option<PathBuf>,
}

fn parse_endpoint(value: &str) -> Result<String, String> {
    let (service, method) = value.split_once('/').ok_or_else(|| {
        format!("Invalid endpoint format: '{value}'. Expected 'package.Service/Method'",)
    })?;

    if service.trim().is_empty() || method.trim().is_empty() {
        return Err("Service and Method names cannot be empty".to_string());
    }

    Ok(value.to_string())
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| "Format must be 'key:value'".to_string())
}

fn parse_body(value: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(value).map_err(|e| format!("Invalid JSON: {e}"))
}
