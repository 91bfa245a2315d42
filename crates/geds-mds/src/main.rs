use anyhow::Context;
use clap::Parser;
use geds_mds::{Mds, DEFAULT_HTTP_SERVER_PORT, DEFAULT_METADATA_SERVER_PORT};
use std::net::SocketAddr;

/// GEDS metadata service.
#[derive(Parser)]
#[command(name = "geds-mds", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: String,

    /// Metadata service port.
    #[arg(long, default_value_t = DEFAULT_METADATA_SERVER_PORT)]
    port: u16,

    /// HTTP admin/metrics port.
    #[arg(long, default_value_t = DEFAULT_HTTP_SERVER_PORT)]
    http_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let grpc_address: SocketAddr = format!("{}:{}", args.listen_address, args.port)
        .parse()
        .context("invalid listen address")?;
    let http_address: SocketAddr = format!("{}:{}", args.listen_address, args.http_port)
        .parse()
        .context("invalid http listen address")?;

    let mds = Mds::new();
    tokio::select! {
        result = mds.serve(grpc_address) => result.context("metadata service failed"),
        result = mds.serve_http(http_address) => result.context("http server failed"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
