#![cfg(feature = "tcp-transport")]
use catalog::*;
use catalog_rpc::{
    proto::{CatalogRequest, CatalogResponse},
    transport::tcp::{TcpConnector, TcpListener},
};
use tokio_util::sync::DropGuard;

async fn serve_tcp() -> anyhow::Result<(DropGuard, TcpConnector<CatalogResponse, CatalogRequest>)> {
    let (listener, connector) = bind_pair().await?;
    Ok((spawn_server(listener), connector))
}

#[tokio::test]
async fn tcp_ping() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_tcp().await?;
    ping_v1(connector.clone()).await?;
    ping_v2_correlation(connector).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_watch() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_tcp().await?;
    watch_yields_contiguous_sequence(connector.clone()).await?;
    watch_v2_tags_updates(connector.clone()).await?;
    watch_deadline_cuts_stream(connector).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_upload() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_tcp().await?;
    upload_counts_every_event(connector.clone()).await?;
    upload_of_nothing_counts_zero(connector).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_chat() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_tcp().await?;
    chat_echoes_every_message(connector.clone()).await?;
    chat_v2_pairs_in_lockstep(connector).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_unexpected_first_message() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_tcp().await?;
    unexpected_first_message_is_rejected(connector.clone()).await?;
    ping_v1(connector).await?;
    Ok(())
}

async fn bind_pair() -> anyhow::Result<(
    TcpListener<CatalogRequest, CatalogResponse>,
    TcpConnector<CatalogResponse, CatalogRequest>,
)> {
    let listener = TcpListener::<CatalogRequest, CatalogResponse>::bind("127.0.0.1:0").await?;
    let connector = TcpConnector::new(listener.socket_addr().to_string());
    Ok((listener, connector))
}

#[tokio::test]
async fn tcp_wrong_version_answer_is_fatal() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = bind_pair().await?;
    wrong_version_answer_is_fatal(listener, connector).await
}

#[tokio::test]
async fn tcp_failed_handler_is_not_retried() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = bind_pair().await?;
    failed_handler_is_not_retried(listener, connector).await
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_concurrent_calls() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_tcp().await?;
    concurrent_calls(connector).await?;
    Ok(())
}

#[tokio::test]
async fn tcp_connect_refused_is_an_error() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    // bind and drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::<CatalogRequest, CatalogResponse>::bind("127.0.0.1:0").await?;
        listener.socket_addr()
    };
    let connector = TcpConnector::<CatalogResponse, CatalogRequest>::new(addr.to_string());
    assert!(ping_v1(connector).await.is_err());
    Ok(())
}
