//! Serves both catalog contract versions over tcp until Ctrl-C.
use catalog_rpc::{
    config::{ServerConfig, DEFAULT_ADDR},
    logging,
    proto::{CatalogRequest, CatalogResponse, CatalogService},
    service,
    transport::tcp::TcpListener,
    RpcServer,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "catalog-server", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CATALOG_RPC_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig { addr: args.addr }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let config = ServerConfig::from(Args::parse());

    let listener =
        TcpListener::<CatalogRequest, CatalogResponse>::bind(config.addr.as_str()).await?;
    info!(addr = %listener.socket_addr(), "catalog server listening");

    let shutdown = CancellationToken::new();
    let server = RpcServer::<CatalogService, _>::new(listener);
    let serving = tokio::spawn(service::serve(server, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    serving.await??;
    Ok(())
}
