//! Demo sequence that exercises all four calls of both contract versions.
//!
//! Pings go through the [Resilient] wrapper. The streaming calls do not, a
//! failure there ends the step. Failures are logged and recorded in the
//! [RunReport], they never abort the run.
use std::fmt;

use futures_lite::StreamExt;
use futures_util::SinkExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::ClientConfig,
    error::cancellable,
    proto::{
        new_correlation_id, now_unix_ms,
        v1::{self, CatalogApiV1},
        v2::{self, CatalogApiV2},
        CatalogRequest, CatalogResponse, CatalogService,
    },
    resilience::Resilient,
    service::Contract,
    transport::mapped::MappedConnector,
    CallError, Connector, RpcClient,
};

/// Request builders and response accessors the driver needs on top of [Contract].
pub trait Demo: Contract {
    /// A ping with `message`
    fn ping_request(message: &str) -> Self::Ping;
    /// A watch request
    fn watch_request(interval_ms: i32, max_updates: i32) -> Self::Watch;
    /// Opens an upload
    fn upload_request() -> Self::Upload;
    /// Upload event number `n`, counting from 1
    fn event(n: usize) -> Self::Event;
    /// Opens a chat
    fn chat_request() -> Self::Chat;
    /// Chat message number `n`, counting from 1
    fn chat_message(n: usize) -> Self::ChatMessage;
    /// Text of a ping answer
    fn pong_text(pong: &Self::Pong) -> &str;
    /// Sequence number and text of a watch update
    fn update_parts(update: &Self::Update) -> (i64, &str);
    /// Count reported by an upload summary
    fn received_count(summary: &Self::Summary) -> i32;
    /// Text of a chat message
    fn chat_text(msg: &Self::ChatMessage) -> &str;
}

fn demo_payload(n: usize) -> String {
    format!("{{\"n\": {n}}}")
}

impl Demo for CatalogApiV1 {
    fn ping_request(message: &str) -> v1::PingRequest {
        v1::PingRequest {
            message: message.to_string(),
        }
    }

    fn watch_request(interval_ms: i32, max_updates: i32) -> v1::WatchCatalogRequest {
        v1::WatchCatalogRequest {
            interval_ms,
            max_updates,
        }
    }

    fn upload_request() -> v1::UploadCatalogEvents {
        v1::UploadCatalogEvents
    }

    fn event(n: usize) -> v1::CatalogEvent {
        v1::CatalogEvent {
            event_id: new_correlation_id(),
            event_type: "DemoEvent".to_string(),
            payload_json: demo_payload(n),
            client_time_unix_ms: now_unix_ms(),
        }
    }

    fn chat_request() -> v1::Chat {
        v1::Chat
    }

    fn chat_message(n: usize) -> v1::ChatMessage {
        v1::ChatMessage {
            sender: "client".to_string(),
            text: format!("hi {n}"),
            time_unix_ms: now_unix_ms(),
        }
    }

    fn pong_text(pong: &v1::PingResponse) -> &str {
        &pong.message
    }

    fn update_parts(update: &v1::CatalogUpdate) -> (i64, &str) {
        (update.sequence, &update.text)
    }

    fn received_count(summary: &v1::UploadSummary) -> i32 {
        summary.received_count
    }

    fn chat_text(msg: &v1::ChatMessage) -> &str {
        &msg.text
    }
}

impl Demo for CatalogApiV2 {
    fn ping_request(message: &str) -> v2::PingRequest {
        // blank, so the server generates one
        v2::PingRequest {
            message: message.to_string(),
            correlation_id: String::new(),
        }
    }

    fn watch_request(interval_ms: i32, max_updates: i32) -> v2::WatchCatalogRequest {
        v2::WatchCatalogRequest {
            interval_ms,
            max_updates,
            filter: "demo".to_string(),
        }
    }

    fn upload_request() -> v2::UploadCatalogEvents {
        v2::UploadCatalogEvents
    }

    fn event(n: usize) -> v2::CatalogEvent {
        v2::CatalogEvent {
            event_id: new_correlation_id(),
            event_type: "DemoEvent".to_string(),
            payload_json: demo_payload(n),
            client_time_unix_ms: now_unix_ms(),
        }
    }

    fn chat_request() -> v2::Chat {
        v2::Chat
    }

    fn chat_message(n: usize) -> v2::ChatMessage {
        v2::ChatMessage {
            sender: "client".to_string(),
            text: format!("hi {n}"),
            time_unix_ms: now_unix_ms(),
            correlation_id: format!("chat-{n}"),
        }
    }

    fn pong_text(pong: &v2::PingResponse) -> &str {
        &pong.message
    }

    fn update_parts(update: &v2::CatalogUpdate) -> (i64, &str) {
        (update.sequence, &update.text)
    }

    fn received_count(summary: &v2::UploadSummary) -> i32 {
        summary.received_count
    }

    fn chat_text(msg: &v2::ChatMessage) -> &str {
        &msg.text
    }
}

/// One step of the demo sequence
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ping,
    WatchCatalog,
    UploadCatalogEvents,
    Chat,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What one contract version returned during a run
#[derive(Debug, Default)]
pub struct VersionReport {
    /// Text of the ping answer
    pub pong: Option<String>,
    /// Sequence numbers of the watch updates, in arrival order
    pub updates: Vec<i64>,
    /// Count reported by the upload
    pub received_count: Option<i32>,
    /// Texts of the chat echoes, in arrival order
    pub echoes: Vec<String>,
    /// Steps that failed, with the error
    pub failures: Vec<(Step, CallError)>,
}

impl VersionReport {
    /// Whether every step succeeded
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of [CallDriver::run]
#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct RunReport {
    pub v1: VersionReport,
    pub v2: VersionReport,
}

impl RunReport {
    /// Whether every step of both versions succeeded
    pub fn is_ok(&self) -> bool {
        self.v1.is_ok() && self.v2.is_ok()
    }
}

type VersionClient<V, C> = RpcClient<
    V,
    MappedConnector<<V as crate::Service>::Res, <V as crate::Service>::Req, C>,
>;

/// Runs the demo sequence against one endpoint.
#[derive(Debug)]
pub struct CallDriver<C> {
    client: RpcClient<CatalogService, C>,
    config: ClientConfig,
    resilient: Resilient,
    cancel: CancellationToken,
}

impl<C> CallDriver<C>
where
    C: Connector<CatalogService> + Clone,
{
    /// Create a driver that opens its calls with `connector`.
    pub fn new(connector: C, config: ClientConfig) -> Self {
        let resilient = Resilient::new(config.retry);
        Self {
            client: RpcClient::new(connector),
            config,
            resilient,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the streaming calls of this driver.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the sequence for v1, then for v2.
    pub async fn run(&self) -> RunReport {
        RunReport {
            v1: self.run_version::<CatalogApiV1>().await,
            v2: self.run_version::<CatalogApiV2>().await,
        }
    }

    /// Run the sequence for contract version `V`.
    pub async fn run_version<V>(&self) -> VersionReport
    where
        V: Demo,
        CatalogRequest: From<V::Req>,
        V::Res: TryFrom<CatalogResponse>,
    {
        let mut report = VersionReport::default();

        info!(version = V::VERSION, "1) Ping...");
        match self.ping::<V>().await {
            Ok(pong) => report.pong = Some(pong),
            Err(cause) => record(&mut report, V::VERSION, Step::Ping, cause),
        }

        info!(version = V::VERSION, "2) Server streaming: WatchCatalog...");
        match self.watch::<V>().await {
            Ok(updates) => report.updates = updates,
            Err(cause) => record(&mut report, V::VERSION, Step::WatchCatalog, cause),
        }

        info!(version = V::VERSION, "3) Client streaming: UploadCatalogEvents...");
        match self.upload::<V>().await {
            Ok(count) => report.received_count = Some(count),
            Err(cause) => record(&mut report, V::VERSION, Step::UploadCatalogEvents, cause),
        }

        info!(version = V::VERSION, "4) Bidirectional streaming: Chat...");
        match self.chat::<V>().await {
            Ok(echoes) => report.echoes = echoes,
            Err(cause) => record(&mut report, V::VERSION, Step::Chat, cause),
        }

        report
    }

    fn client<V>(&self) -> VersionClient<V, C>
    where
        V: Demo,
        CatalogRequest: From<V::Req>,
        V::Res: TryFrom<CatalogResponse>,
    {
        self.client.clone().map::<V>()
    }

    /// Ping with retries. Returns the answer text.
    pub async fn ping<V>(&self) -> Result<String, CallError>
    where
        V: Demo,
        CatalogRequest: From<V::Req>,
        V::Res: TryFrom<CatalogResponse>,
    {
        let client = self.client::<V>();
        let message = self.config.ping_message.as_str();
        let pong = self
            .resilient
            .call(|| client.rpc(V::ping_request(message)))
            .await?;
        let text = V::pong_text(&pong).to_string();
        info!(version = V::VERSION, "Ping reply: {text}");
        Ok(text)
    }

    /// Watch the catalog until the server ends the stream. Returns the sequence numbers.
    pub async fn watch<V>(&self) -> Result<Vec<i64>, CallError>
    where
        V: Demo,
        CatalogRequest: From<V::Req>,
        V::Res: TryFrom<CatalogResponse>,
    {
        let client = self.client::<V>();
        let request = V::watch_request(self.config.watch_interval_ms, self.config.watch_updates);
        let updates = client.server_streaming(request).await?;
        let updates = cancellable(updates, self.cancel.child_token(), None);
        tokio::pin!(updates);
        let mut sequences = Vec::new();
        while let Some(update) = updates.next().await {
            let update = update?;
            let (sequence, text) = V::update_parts(&update);
            info!(version = V::VERSION, "Update: #{sequence} {text}");
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    /// Upload the demo events and finish the upload. Returns the count the server saw.
    pub async fn upload<V>(&self) -> Result<i32, CallError>
    where
        V: Demo,
        CatalogRequest: From<V::Req>,
        V::Res: TryFrom<CatalogResponse>,
    {
        let client = self.client::<V>();
        let (mut events, summary) = client.client_streaming(V::upload_request()).await?;
        for n in 1..=self.config.upload_events {
            events.send(V::event(n)).await.map_err(CallError::transient)?;
        }
        events.finish().await.map_err(CallError::transient)?;
        let summary = summary.await?;
        let count = V::received_count(&summary);
        info!(version = V::VERSION, "Upload summary: received={count}");
        Ok(count)
    }

    /// Chat, reading the echoes on a separate task. Returns the echo texts.
    pub async fn chat<V>(&self) -> Result<Vec<String>, CallError>
    where
        V: Demo,
        CatalogRequest: From<V::Req>,
        V::Res: TryFrom<CatalogResponse>,
    {
        let client = self.client::<V>();
        let (mut messages, echoes) = client.bidi(V::chat_request()).await?;
        let echoes = cancellable(echoes, self.cancel.child_token(), None);
        let reader = tokio::spawn(async move {
            tokio::pin!(echoes);
            let mut texts = Vec::new();
            while let Some(echo) = echoes.next().await {
                let text = V::chat_text(&echo?).to_string();
                info!(version = V::VERSION, "Chat <- {text}");
                texts.push(text);
            }
            Ok::<_, CallError>(texts)
        });
        let sent = async {
            for n in 1..=self.config.chat_messages {
                messages
                    .send(V::chat_message(n))
                    .await
                    .map_err(CallError::transient)?;
                tokio::time::sleep(self.config.chat_pause()).await;
            }
            messages.finish().await.map_err(CallError::transient)
        }
        .await;
        if let Err(cause) = sent {
            reader.abort();
            return Err(cause);
        }
        reader.await.map_err(CallError::fatal)?
    }
}

fn record(report: &mut VersionReport, version: &str, step: Step, cause: CallError) {
    warn!(version, %step, "call failed: {cause}");
    report.failures.push((step, cause));
}
