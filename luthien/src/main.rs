use std::net::SocketAddr;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use args::Args;

mod args;
mod logger;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8787";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args);
    log::info!("Luthien {}", env!("CARGO_PKG_VERSION"));

    let mut config = config::Config::load(&args.config)?;

    if let Some(listen_address) = args.listen_address {
        config.server.listen_address = Some(listen_address);
    }

    let listen_address: SocketAddr = match config.server.listen_address {
        Some(address) => address,
        None => DEFAULT_LISTEN_ADDRESS.parse()?,
    };

    let gateway = proxy::build_gateway(config).await?;
    let router = proxy::router(gateway);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(listen_address).await?;
    log::info!("listening on {listen_address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
