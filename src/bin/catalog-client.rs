//! Runs the demo call sequence against a catalog server.
use std::process::ExitCode;

use catalog_rpc::{
    config::{ClientConfig, DEFAULT_ADDR},
    driver::{CallDriver, RunReport, VersionReport},
    logging,
    proto::{v1::CatalogApiV1, v2::CatalogApiV2, CatalogRequest, CatalogResponse},
    resilience::RetryPolicy,
    transport::tcp::TcpConnector,
};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Version {
    V1,
    V2,
    Both,
}

#[derive(Parser, Debug)]
#[command(name = "catalog-client", version, about)]
struct Args {
    /// Address of the catalog server
    #[arg(long, env = "CATALOG_RPC_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,
    /// Contract version(s) to exercise
    #[arg(long, value_enum, default_value_t = Version::Both)]
    contract: Version,
    /// Text sent with the ping
    #[arg(long, default_value = "hello from client")]
    message: String,
    /// Ping attempts in total
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
    /// Backoff after the first failed ping attempt, grows linearly
    #[arg(long, default_value_t = 200)]
    base_delay_ms: u64,
    /// Timeout of a single ping attempt
    #[arg(long, default_value_t = 2_000)]
    attempt_timeout_ms: u64,
    /// Interval the watch asks for
    #[arg(long, default_value_t = 300)]
    watch_interval_ms: i32,
    /// Number of updates the watch asks for
    #[arg(long, default_value_t = 5)]
    watch_updates: i32,
}

impl From<Args> for ClientConfig {
    fn from(args: Args) -> Self {
        ClientConfig {
            addr: args.addr,
            retry: RetryPolicy::new(args.max_attempts, args.base_delay_ms, args.attempt_timeout_ms),
            ping_message: args.message,
            watch_interval_ms: args.watch_interval_ms,
            watch_updates: args.watch_updates,
            ..ClientConfig::default()
        }
    }
}

fn summarize(version: &str, report: &VersionReport) {
    info!(
        version,
        pong = ?report.pong,
        updates = report.updates.len(),
        received_count = ?report.received_count,
        echoes = report.echoes.len(),
        "run finished"
    );
    for (step, cause) in &report.failures {
        warn!(version, %step, "failed: {cause}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();
    let contract = args.contract;
    let config = ClientConfig::from(args);

    let connector = TcpConnector::<CatalogResponse, CatalogRequest>::new(config.addr.clone());
    let driver = CallDriver::new(connector, config);
    let cancel = driver.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let report = match contract {
        Version::V1 => RunReport {
            v1: driver.run_version::<CatalogApiV1>().await,
            ..RunReport::default()
        },
        Version::V2 => RunReport {
            v2: driver.run_version::<CatalogApiV2>().await,
            ..RunReport::default()
        },
        Version::Both => driver.run().await,
    };
    if !matches!(contract, Version::V2) {
        summarize("v1", &report.v1);
    }
    if !matches!(contract, Version::V1) {
        summarize("v2", &report.v2);
    }
    if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
