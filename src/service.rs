//! The catalog service handlers.
//!
//! The four handlers are written once, in [CatalogApi], against the small
//! [Contract] trait. [CatalogApiV1] and [CatalogApiV2] only differ in how they
//! build their messages.
use std::{fmt, marker::PhantomData, time::Duration};

use async_stream::stream;
use futures_lite::{Stream, StreamExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace, warn};

use crate::{
    message::{BidiStreamingMsg, ClientStreamingMsg, RpcMsg, ServerStreamingMsg},
    proto::{
        new_correlation_id, non_blank, now_unix_ms,
        v1::{self, CatalogApiV1},
        v2::{self, CatalogApiV2},
        CatalogRequest, CatalogService,
    },
    server::{Accepting, RpcChannel, RpcServerError},
    transport::{AbortReason, ConnectionErrors, StreamTypes},
    Listener, RpcServer, Service,
};

/// Sender of every chat echo
pub const RESPONDER: &str = "server";

/// Interval between watch updates if the request does not give a positive one
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Number of watch updates if the request does not give a positive one
pub const DEFAULT_MAX_UPDATES: i64 = 10;

/// Pause before accepting again after a connection failed to come in
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A normalized watch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchPlan {
    /// Pause after each update
    pub interval: Duration,
    /// Number of updates
    pub max_updates: i64,
}

impl WatchPlan {
    /// Apply the defaults for non positive values.
    pub fn new(interval_ms: i32, max_updates: i32) -> Self {
        let interval = if interval_ms <= 0 {
            DEFAULT_WATCH_INTERVAL
        } else {
            Duration::from_millis(interval_ms as u64)
        };
        let max_updates = if max_updates <= 0 {
            DEFAULT_MAX_UPDATES
        } else {
            max_updates as i64
        };
        Self {
            interval,
            max_updates,
        }
    }
}

/// The first message of a call, sorted by call.
#[derive(Debug)]
pub enum Route<V: Contract> {
    /// Unary ping
    Ping(V::Ping),
    /// Server streaming watch
    Watch(V::Watch),
    /// Client streaming upload
    Upload(V::Upload),
    /// Bidi streaming chat
    Chat(V::Chat),
}

/// What a contract version has to provide to be served by [CatalogApi].
pub trait Contract: Service {
    /// Short name for logs
    const VERSION: &'static str;

    /// Opens a ping call
    type Ping: RpcMsg<Self, Response = Self::Pong> + fmt::Debug;
    /// Answer to a ping
    type Pong: Send + 'static;
    /// Opens a watch call
    type Watch: ServerStreamingMsg<Self, Response = Self::Update> + fmt::Debug;
    /// Item of a watch
    type Update: Send + 'static;
    /// Opens an upload call
    type Upload: ClientStreamingMsg<Self, Update = Self::Event, Response = Self::Summary>
        + fmt::Debug;
    /// Item of an upload
    type Event: Into<Self::Req> + TryFrom<Self::Req> + Send + 'static;
    /// Answer to an upload
    type Summary: Send + 'static;
    /// Opens a chat call
    type Chat: BidiStreamingMsg<Self, Update = Self::ChatMessage, Response = Self::ChatMessage>
        + fmt::Debug;
    /// Chat message in both directions
    type ChatMessage: Into<Self::Req> + TryFrom<Self::Req> + Send + 'static;

    /// Sort the first message of a call. Messages that can not open a call are returned.
    fn route(req: Self::Req) -> Result<Route<Self>, Self::Req>;
    /// Answer a ping
    fn pong(req: Self::Ping) -> Self::Pong;
    /// Normalize a watch request
    fn watch_plan(req: &Self::Watch) -> WatchPlan;
    /// Build update number `sequence` of a watch
    fn update(req: &Self::Watch, sequence: i64) -> Self::Update;
    /// Build the answer to an upload
    fn summary(received_count: i32) -> Self::Summary;
    /// Build the echo of a chat message
    fn echo(msg: Self::ChatMessage) -> Self::ChatMessage;
}

impl Contract for CatalogApiV1 {
    const VERSION: &'static str = "v1";

    type Ping = v1::PingRequest;
    type Pong = v1::PingResponse;
    type Watch = v1::WatchCatalogRequest;
    type Update = v1::CatalogUpdate;
    type Upload = v1::UploadCatalogEvents;
    type Event = v1::CatalogEvent;
    type Summary = v1::UploadSummary;
    type Chat = v1::Chat;
    type ChatMessage = v1::ChatMessage;

    fn route(req: v1::Request) -> Result<Route<Self>, v1::Request> {
        match req {
            v1::Request::Ping(msg) => Ok(Route::Ping(msg)),
            v1::Request::WatchCatalog(msg) => Ok(Route::Watch(msg)),
            v1::Request::UploadCatalogEvents(msg) => Ok(Route::Upload(msg)),
            v1::Request::Chat(msg) => Ok(Route::Chat(msg)),
            other => Err(other),
        }
    }

    fn pong(req: v1::PingRequest) -> v1::PingResponse {
        v1::PingResponse {
            message: format!("pong: {}", req.message),
            server_time_unix_ms: now_unix_ms(),
        }
    }

    fn watch_plan(req: &v1::WatchCatalogRequest) -> WatchPlan {
        WatchPlan::new(req.interval_ms, req.max_updates)
    }

    fn update(_req: &v1::WatchCatalogRequest, sequence: i64) -> v1::CatalogUpdate {
        v1::CatalogUpdate {
            sequence,
            text: format!("Update #{sequence}"),
            server_time_unix_ms: now_unix_ms(),
        }
    }

    fn summary(received_count: i32) -> v1::UploadSummary {
        v1::UploadSummary {
            received_count,
            server_time_unix_ms: now_unix_ms(),
        }
    }

    fn echo(msg: v1::ChatMessage) -> v1::ChatMessage {
        v1::ChatMessage {
            sender: RESPONDER.to_string(),
            text: format!("echo: {}: {}", msg.sender, msg.text),
            time_unix_ms: now_unix_ms(),
        }
    }
}

impl Contract for CatalogApiV2 {
    const VERSION: &'static str = v2::VERSION;

    type Ping = v2::PingRequest;
    type Pong = v2::PingResponse;
    type Watch = v2::WatchCatalogRequest;
    type Update = v2::CatalogUpdate;
    type Upload = v2::UploadCatalogEvents;
    type Event = v2::CatalogEvent;
    type Summary = v2::UploadSummary;
    type Chat = v2::Chat;
    type ChatMessage = v2::ChatMessage;

    fn route(req: v2::Request) -> Result<Route<Self>, v2::Request> {
        match req {
            v2::Request::Ping(msg) => Ok(Route::Ping(msg)),
            v2::Request::WatchCatalog(msg) => Ok(Route::Watch(msg)),
            v2::Request::UploadCatalogEvents(msg) => Ok(Route::Upload(msg)),
            v2::Request::Chat(msg) => Ok(Route::Chat(msg)),
            other => Err(other),
        }
    }

    fn pong(req: v2::PingRequest) -> v2::PingResponse {
        let correlation_id = if non_blank(&req.correlation_id).is_some() {
            req.correlation_id
        } else {
            new_correlation_id()
        };
        v2::PingResponse {
            message: format!("pong(v2): {}", req.message),
            server_time_unix_ms: now_unix_ms(),
            correlation_id,
            code: 0,
        }
    }

    fn watch_plan(req: &v2::WatchCatalogRequest) -> WatchPlan {
        WatchPlan::new(req.interval_ms, req.max_updates)
    }

    fn update(req: &v2::WatchCatalogRequest, sequence: i64) -> v2::CatalogUpdate {
        let text = match non_blank(&req.filter) {
            Some(filter) => format!("Update(v2) #{sequence}, filter={filter}"),
            None => format!("Update(v2) #{sequence}"),
        };
        v2::CatalogUpdate {
            sequence,
            text,
            server_time_unix_ms: now_unix_ms(),
            version: v2::VERSION.to_string(),
        }
    }

    fn summary(received_count: i32) -> v2::UploadSummary {
        v2::UploadSummary {
            received_count,
            server_time_unix_ms: now_unix_ms(),
            version: v2::VERSION.to_string(),
        }
    }

    fn echo(msg: v2::ChatMessage) -> v2::ChatMessage {
        let correlation_id = non_blank(&msg.correlation_id).unwrap_or("-").to_string();
        v2::ChatMessage {
            sender: RESPONDER.to_string(),
            text: format!("echo(v2): [{correlation_id}] {}: {}", msg.sender, msg.text),
            time_unix_ms: now_unix_ms(),
            correlation_id,
        }
    }
}

/// The catalog handlers for contract version `V`.
pub struct CatalogApi<V>(PhantomData<V>);

impl<V> fmt::Debug for CatalogApi<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CatalogApi").finish()
    }
}

impl<V> Clone for CatalogApi<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for CatalogApi<V> {}

impl<V> Default for CatalogApi<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V: Contract> CatalogApi<V> {
    /// Handlers for version `V`
    pub fn new() -> Self {
        Self::default()
    }

    /// Unary ping, answered right away
    pub async fn ping(self, req: V::Ping) -> V::Pong {
        V::pong(req)
    }

    /// Emit the planned number of updates, pausing after each one.
    ///
    /// Stops early, without further updates, once `cancel` fires.
    pub fn watch_catalog(
        self,
        req: V::Watch,
        cancel: CancellationToken,
    ) -> impl Stream<Item = V::Update> + Send + 'static {
        let plan = V::watch_plan(&req);
        stream! {
            for sequence in 1..=plan.max_updates {
                if cancel.is_cancelled() {
                    debug!(version = V::VERSION, sequence, "watch cancelled");
                    break;
                }
                yield V::update(&req, sequence);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(version = V::VERSION, sequence, "watch cancelled during pause");
                        break;
                    }
                    _ = tokio::time::sleep(plan.interval) => {}
                }
            }
        }
    }

    /// Count the events until the client finishes the upload.
    pub async fn upload_catalog_events(
        self,
        _req: V::Upload,
        events: impl Stream<Item = V::Event>,
    ) -> V::Summary {
        tokio::pin!(events);
        let mut received_count = 0i32;
        while events.next().await.is_some() {
            received_count = received_count.saturating_add(1);
        }
        trace!(version = V::VERSION, received_count, "upload finished");
        V::summary(received_count)
    }

    /// One echo per inbound message, in order.
    pub fn chat(
        self,
        _req: V::Chat,
        messages: impl Stream<Item = V::ChatMessage> + Send + 'static,
    ) -> impl Stream<Item = V::ChatMessage> + Send + 'static {
        messages.map(V::echo)
    }

    /// Handle one call whose first message was already read.
    pub async fn handle<C>(
        self,
        req: V::Req,
        chan: RpcChannel<V, C>,
    ) -> Result<(), RpcServerError<C>>
    where
        C: StreamTypes<In = V::Req, Out = V::Res>,
    {
        match V::route(req) {
            Ok(Route::Ping(msg)) => {
                debug!(version = V::VERSION, ?msg, "ping");
                chan.rpc(msg, self, Self::ping).await
            }
            Ok(Route::Watch(msg)) => {
                debug!(version = V::VERSION, ?msg, "watch catalog");
                chan.server_streaming(msg, self, Self::watch_catalog).await
            }
            Ok(Route::Upload(msg)) => {
                debug!(version = V::VERSION, ?msg, "upload catalog events");
                chan.client_streaming(msg, self, Self::upload_catalog_events)
                    .await
            }
            Ok(Route::Chat(msg)) => {
                debug!(version = V::VERSION, ?msg, "chat");
                chan.bidi_streaming(msg, self, Self::chat).await
            }
            Err(req) => {
                warn!(version = V::VERSION, ?req, "message can not open a call");
                if let Err(cause) = chan.reject(AbortReason::UnexpectedStartMessage).await {
                    debug!(version = V::VERSION, "could not reject call: {cause}");
                }
                Err(RpcServerError::UnexpectedStartMessage)
            }
        }
    }
}

/// Serve both contract versions on `server` until `shutdown` fires.
///
/// Every call runs on its own task. On shutdown the accept loop stops, all
/// calls in flight are cancelled, and this returns once they are done.
///
/// A connection that fails to come in is logged and the loop goes on after
/// [ACCEPT_BACKOFF]. Only an accept error that means the listener is gone, see
/// [ConnectionErrors::is_final_accept_error], stops the loop. Calls in flight
/// still finish in that case.
pub async fn serve<C>(
    server: RpcServer<CatalogService, C>,
    shutdown: CancellationToken,
) -> Result<(), RpcServerError<C>>
where
    C: Listener<CatalogService>,
{
    let server = server.with_cancellation_token(shutdown.child_token());
    for addr in server.as_ref().local_addr() {
        debug!(%addr, "serving catalog");
    }
    let calls = TaskTracker::new();
    let res = loop {
        let accepting = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            accepting = server.accept() => accepting,
        };
        match accepting {
            Ok(accepting) => {
                calls.spawn(handle_call(accepting));
            }
            Err(RpcServerError::Accept(cause)) if !C::is_final_accept_error(&cause) => {
                warn!(backoff = ?ACCEPT_BACKOFF, "failed to accept call: {cause}");
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            Err(cause) => {
                warn!("stopped accepting calls: {cause}");
                break Err(cause);
            }
        }
    };
    calls.close();
    debug!(in_flight = calls.len(), "waiting for calls to finish");
    calls.wait().await;
    res
}

async fn handle_call<C>(accepting: Accepting<CatalogService, C>)
where
    C: Listener<CatalogService>,
{
    let (req, chan) = match accepting.read_first().await {
        Ok(first) => first,
        Err(cause) => {
            debug!("call ended before it started: {cause}");
            return;
        }
    };
    match req {
        CatalogRequest::V1(req) => {
            let res = CatalogApi::<CatalogApiV1>::new()
                .handle(req, chan.map::<CatalogApiV1>())
                .await;
            log_outcome(CatalogApiV1::VERSION, res);
        }
        CatalogRequest::V2(req) => {
            let res = CatalogApi::<CatalogApiV2>::new()
                .handle(req, chan.map::<CatalogApiV2>())
                .await;
            log_outcome(CatalogApiV2::VERSION, res);
        }
    }
}

fn log_outcome<C: ConnectionErrors>(version: &str, res: Result<(), RpcServerError<C>>) {
    match res {
        Ok(()) => trace!(version, "call done"),
        Err(RpcServerError::Cancelled) => debug!(version, "call cancelled"),
        Err(RpcServerError::RecvError(cause)) => {
            debug!(version, "call aborted by client: {cause}")
        }
        Err(cause) => warn!(version, "call failed: {cause}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_plan_applies_defaults() {
        assert_eq!(
            WatchPlan::new(0, -3),
            WatchPlan {
                interval: Duration::from_millis(500),
                max_updates: 10
            }
        );
        assert_eq!(
            WatchPlan::new(10, 5),
            WatchPlan {
                interval: Duration::from_millis(10),
                max_updates: 5
            }
        );
    }

    #[test]
    fn v2_ping_keeps_or_generates_correlation_id() {
        let res = CatalogApiV2::pong(v2::PingRequest {
            message: "hi".into(),
            correlation_id: "abc".into(),
        });
        assert_eq!(res.message, "pong(v2): hi");
        assert_eq!(res.correlation_id, "abc");
        assert_eq!(res.code, 0);

        let res = CatalogApiV2::pong(v2::PingRequest {
            message: "hi".into(),
            correlation_id: "   ".into(),
        });
        assert_eq!(res.correlation_id.len(), 32);
        assert!(res.correlation_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn v2_update_text_includes_filter() {
        let mut req = v2::WatchCatalogRequest::default();
        assert_eq!(CatalogApiV2::update(&req, 3).text, "Update(v2) #3");
        req.filter = "books".into();
        let update = CatalogApiV2::update(&req, 4);
        assert_eq!(update.text, "Update(v2) #4, filter=books");
        assert_eq!(update.version, "v2");
    }

    #[test]
    fn echoes_come_from_the_responder() {
        let echo = CatalogApiV1::echo(v1::ChatMessage {
            sender: "client".into(),
            text: "hi 1".into(),
            time_unix_ms: 0,
        });
        assert_eq!(echo.sender, RESPONDER);
        assert_eq!(echo.text, "echo: client: hi 1");

        let echo = CatalogApiV2::echo(v2::ChatMessage {
            sender: "client".into(),
            text: "hi 2".into(),
            ..Default::default()
        });
        assert_eq!(echo.text, "echo(v2): [-] client: hi 2");
        assert_eq!(echo.correlation_id, "-");
    }

    #[tokio::test(start_paused = true)]
    async fn watch_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let updates = CatalogApi::<CatalogApiV1>::new().watch_catalog(
            v1::WatchCatalogRequest {
                interval_ms: 100,
                max_updates: 1000,
            },
            cancel.clone(),
        );
        tokio::pin!(updates);
        assert_eq!(updates.next().await.map(|u| u.sequence), Some(1));
        assert_eq!(updates.next().await.map(|u| u.sequence), Some(2));
        cancel.cancel();
        assert!(updates.next().await.is_none());
    }
}
