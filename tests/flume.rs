#![cfg(feature = "flume-transport")]
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use catalog::*;
use catalog_rpc::{
    config::ClientConfig,
    driver::{CallDriver, Step},
    proto::{v1::CatalogApiV1, CatalogRequest, CatalogResponse, CatalogService},
    resilience::RetryPolicy,
    server::RpcServerError,
    service,
    transport::{
        self,
        flume::{self, FlumeConnector, FlumeListener},
        ConnectionErrors, LocalAddr, StreamTypes,
    },
    RpcServer,
};
use tokio_util::sync::{CancellationToken, DropGuard};

fn serve_in_memory() -> (DropGuard, FlumeConnector<CatalogResponse, CatalogRequest>) {
    let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
    (spawn_server(listener), connector)
}

#[tokio::test]
async fn flume_ping() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    ping_v1(connector.clone()).await?;
    ping_v2_correlation(connector).await?;
    Ok(())
}

#[tokio::test]
async fn flume_watch() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    watch_yields_contiguous_sequence(connector.clone()).await?;
    watch_v2_tags_updates(connector.clone()).await?;
    watch_deadline_cuts_stream(connector).await?;
    Ok(())
}

#[tokio::test]
async fn flume_upload() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    upload_counts_every_event(connector.clone()).await?;
    upload_of_nothing_counts_zero(connector).await?;
    Ok(())
}

#[tokio::test]
async fn flume_chat() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    chat_echoes_every_message(connector.clone()).await?;
    chat_v2_pairs_in_lockstep(connector).await?;
    Ok(())
}

#[tokio::test]
async fn flume_unexpected_first_message() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    unexpected_first_message_is_rejected(connector.clone()).await?;
    // the server keeps serving after a bad call
    ping_v1(connector).await?;
    Ok(())
}

#[tokio::test]
async fn flume_wrong_version_answer_is_fatal() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
    wrong_version_answer_is_fatal(listener, connector).await
}

#[tokio::test]
async fn flume_failed_handler_is_not_retried() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
    failed_handler_is_not_retried(listener, connector).await
}

#[tokio::test(flavor = "multi_thread")]
async fn flume_concurrent_calls() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    concurrent_calls(connector).await?;
    Ok(())
}

#[tokio::test]
async fn flume_serve_ends_when_connectors_are_gone() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
    let server = RpcServer::<CatalogService, _>::new(listener);
    let serving = tokio::spawn(service::serve(server, CancellationToken::new()));
    ping_v1(connector).await?;
    // dropping the last connector makes accept fail
    match serving.await? {
        Err(RpcServerError::Accept(_)) => {}
        other => panic!("unexpected termination result {other:?}"),
    }
    Ok(())
}

/// Fails its first accept, then accepts like the wrapped listener. Accept
/// errors of the wrapped listener become [io::ErrorKind::BrokenPipe].
#[derive(Debug, Clone)]
struct FlakyListener {
    inner: FlumeListener<CatalogRequest, CatalogResponse>,
    failed: Arc<AtomicBool>,
}

impl ConnectionErrors for FlakyListener {
    type SendError = flume::SendError;
    type RecvError = flume::RecvError;
    type OpenError = flume::OpenError;
    type AcceptError = io::Error;

    fn is_final_accept_error(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::BrokenPipe
    }
}

impl StreamTypes for FlakyListener {
    type In = CatalogRequest;
    type Out = CatalogResponse;
    type SendSink = flume::SendSink<CatalogResponse>;
    type RecvStream = flume::RecvStream<CatalogRequest>;
}

impl transport::Listener for FlakyListener {
    async fn accept(&self) -> Result<(Self::SendSink, Self::RecvStream), io::Error> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        transport::Listener::accept(&self.inner)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn local_addr(&self) -> &[LocalAddr] {
        transport::Listener::local_addr(&self.inner)
    }
}

#[tokio::test]
async fn flume_serve_survives_a_failed_accept() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
    let failed = Arc::new(AtomicBool::new(false));
    let listener = FlakyListener {
        inner: listener,
        failed: failed.clone(),
    };
    let server = RpcServer::<CatalogService, _>::new(listener);
    let serving = tokio::spawn(service::serve(server, CancellationToken::new()));
    ping_v1(connector).await?;
    assert!(failed.load(Ordering::SeqCst));
    // only the listener going away ends the loop
    match serving.await? {
        Err(RpcServerError::Accept(cause)) => assert_eq!(cause.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("unexpected termination result {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn flume_driver_runs_both_versions() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (_guard, connector) = serve_in_memory();
    let config = ClientConfig {
        watch_interval_ms: 1,
        watch_updates: 3,
        upload_events: 4,
        chat_messages: 2,
        chat_pause_ms: 1,
        ..ClientConfig::default()
    };
    let report = CallDriver::new(connector, config).run().await;
    assert!(report.is_ok(), "{report:?}");

    assert_eq!(report.v1.pong.as_deref(), Some("pong: hello from client"));
    assert_eq!(report.v1.updates, vec![1, 2, 3]);
    assert_eq!(report.v1.received_count, Some(4));
    assert_eq!(report.v1.echoes, vec!["echo: client: hi 1", "echo: client: hi 2"]);

    assert_eq!(report.v2.pong.as_deref(), Some("pong(v2): hello from client"));
    assert_eq!(report.v2.updates, vec![1, 2, 3]);
    assert_eq!(report.v2.received_count, Some(4));
    assert_eq!(
        report.v2.echoes,
        vec!["echo(v2): [chat-1] client: hi 1", "echo(v2): [chat-2] client: hi 2"]
    );
    Ok(())
}

#[tokio::test]
async fn flume_driver_records_failures() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
    // nobody serves, every call fails to open
    drop(listener);
    let config = ClientConfig {
        retry: RetryPolicy::new(2, 1, 100),
        ..ClientConfig::default()
    };
    let report = CallDriver::new(connector, config)
        .run_version::<CatalogApiV1>()
        .await;
    let steps: Vec<Step> = report.failures.iter().map(|(step, _)| *step).collect();
    assert_eq!(
        steps,
        vec![Step::Ping, Step::WatchCatalog, Step::UploadCatalogEvents, Step::Chat]
    );
    assert!(report.pong.is_none());
    Ok(())
}
