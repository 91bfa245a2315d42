use anyhow::Context;
use clap::Parser;
use geds::{Geds, GedsConfig};

/// GEDS storage node.
#[derive(Parser)]
#[command(name = "geds-node", version)]
struct Args {
    /// Metadata server address.
    #[arg(long, default_value = "localhost")]
    server_address: String,

    /// Metadata server port.
    #[arg(long, default_value_t = 4380)]
    server_port: u16,

    /// Local data-plane port.
    #[arg(long, default_value_t = geds::config::DEFAULT_GEDS_PORT)]
    port: u16,

    /// HTTP/Prometheus port.
    #[arg(long, default_value_t = geds::config::DEFAULT_HTTP_SERVER_PORT)]
    http_port: u16,

    /// GEDS root folder.
    #[arg(long, default_value = "/tmp/geds_XXXXXX")]
    geds_root: String,

    /// Hostname announced to peers; empty asks the metadata service.
    #[arg(long, default_value = "")]
    hostname: String,

    /// Serve a demo object under this bucket after startup.
    #[arg(long)]
    serve_bucket: Option<String>,

    /// Download `bucket/key` instead of serving.
    #[arg(long)]
    download: Option<String>,
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
    let mut config = GedsConfig::new(format!("{}:{}", args.server_address, args.server_port));
    config
        .set_int("port", args.port as u64)
        .context("invalid port")?;
    config
        .set_int("http_server_port", args.http_port as u64)
        .context("invalid http port")?;
    config
        .set_string("local_storage_path", &args.geds_root)
        .context("invalid storage path")?;
    config
        .set_string("hostname", &args.hostname)
        .context("invalid hostname")?;

    let node = Geds::new(config);
    node.start().await.context("unable to start the node")?;

    if let Some(target) = &args.download {
        let (bucket, key) = target
            .split_once('/')
            .context("--download expects bucket/key")?;
        let file = node.open(bucket, key).await.context("unable to open")?;
        let mut buf = vec![0u8; file.size() as usize];
        let n = file.read(&mut buf, 0).await.context("unable to read")?;
        tracing::info!(bucket, key, bytes = n, "downloaded object");
    } else if let Some(bucket) = &args.serve_bucket {
        if let Err(err) = node.create_bucket(bucket).await {
            tracing::warn!(%err, "unable to create bucket");
        }
        let file = node
            .create(bucket, "testfile", true)
            .await
            .context("unable to create demo file")?;
        let text = format!("Hello from {}\n", node.uuid());
        file.write(text.as_bytes(), 0).await.context("write failed")?;
        file.seal().await.context("seal failed")?;
        tracing::info!(bucket, key = "testfile", "serving demo object");
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    node.stop().await.ok();
    Ok(())
}
