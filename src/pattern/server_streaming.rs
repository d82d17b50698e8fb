//! Server streaming interaction pattern.

use futures_lite::{Stream, StreamExt};
use futures_util::{FutureExt, SinkExt, TryFutureExt};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{BoxStreamSync, DeferDrop},
    message::{InteractionPattern, Msg},
    server::{abort_on_error, cancel_on_update, race2, RpcChannel, RpcServerError},
    transport::{ConnectionErrors, StreamTypes},
    Connector, RpcClient, Service,
};

use std::{
    error, fmt,
    panic::{self, AssertUnwindSafe},
    result,
};

/// Server streaming interaction pattern
///
/// After the initial request, the server will send a stream of responses.
#[derive(Debug, Clone, Copy)]
pub struct ServerStreaming;
impl InteractionPattern for ServerStreaming {}

/// Defines response type for a server streaming message.
pub trait ServerStreamingMsg<S: Service>: Msg<S, Pattern = ServerStreaming> {
    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// Client error when opening a server streaming call
#[derive(Debug)]
pub enum Error<C: ConnectionErrors> {
    /// Unable to open a substream at all
    Open(C::OpenError),
    /// Unable to send the request to the server
    Send(C::SendError),
}

impl<C: ConnectionErrors> fmt::Display for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<C: ConnectionErrors> error::Error for Error<C> {}

/// Client error when receiving an item of a server streaming call
#[derive(Debug)]
pub enum ItemError<C: ConnectionErrors> {
    /// Unable to receive the response from the server
    RecvError(C::RecvError),
    /// Unexpected response from the server
    DowncastError,
}

impl<C: ConnectionErrors> fmt::Display for ItemError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<C: ConnectionErrors> error::Error for ItemError<C> {}

impl<S, C> RpcClient<S, C>
where
    C: Connector<S>,
    S: Service,
{
    /// Server streaming call, single request, stream of responses
    ///
    /// The stream ends with `None` once the server finished it. Dropping the
    /// stream early cancels the call on the server.
    pub async fn server_streaming<M>(
        &self,
        msg: M,
    ) -> result::Result<BoxStreamSync<'static, result::Result<M::Response, ItemError<C>>>, Error<C>>
    where
        M: ServerStreamingMsg<S>,
    {
        let msg = msg.into();
        let (mut send, recv) = self.source.open().await.map_err(Error::Open)?;
        send.send(msg).map_err(Error::Send).await?;
        let recv = recv.map(move |x| match x {
            Ok(msg) => M::Response::try_from(msg).map_err(|_| ItemError::DowncastError),
            Err(e) => Err(ItemError::RecvError(e)),
        });
        // keep send alive so the server sees the call as ongoing
        let recv = Box::pin(DeferDrop(recv, send));
        Ok(recv)
    }
}

impl<S, C> RpcChannel<S, C>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    /// handle the message M using the given function on the target object
    ///
    /// `f` gets the call's cancellation token. It is cancelled when the client goes
    /// away or the server shuts down, and the response stream should end soon after.
    /// The responses are forwarded until the stream ends, then the response direction
    /// is finished. A cancelled call is not finished, and returns [RpcServerError::Cancelled].
    /// A panic in `f` or in the response stream rejects the call.
    ///
    /// If you want to support concurrent requests, you need to spawn this on a tokio task yourself.
    pub async fn server_streaming<M, F, Str, T>(
        self,
        req: M,
        target: T,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: ServerStreamingMsg<S>,
        F: FnOnce(T, M, CancellationToken) -> Str + Send + 'static,
        Str: Stream<Item = M::Response> + Send + 'static,
        T: Send + 'static,
    {
        let Self {
            mut send,
            recv,
            cancel,
            ..
        } = self;
        // get the response
        let token = cancel.clone();
        let Ok(responses) = panic::catch_unwind(AssertUnwindSafe(|| f(target, req, token))) else {
            cancel.cancel();
            return abort_on_error(&mut send, Err(RpcServerError::HandlerFailed)).await;
        };
        let responses = futures_util::StreamExt::catch_unwind(AssertUnwindSafe(responses));
        let watcher = cancel_on_update::<C>(recv, cancel.clone()).map(Err);
        let sink = &mut send;
        let res = race2(watcher, async move {
            tokio::pin!(responses);
            while let Some(response) = responses.next().await {
                if cancel.is_cancelled() {
                    return Err(RpcServerError::Cancelled);
                }
                // turn into a S::Res so we can send it
                let response = response.map_err(|_| RpcServerError::HandlerFailed)?.into();
                // send it and return the error if any
                sink.send(response)
                    .await
                    .map_err(RpcServerError::SendError)?;
            }
            if cancel.is_cancelled() {
                return Err(RpcServerError::Cancelled);
            }
            sink.close().await.map_err(RpcServerError::SendError)
        })
        .await;
        abort_on_error(&mut send, res).await
    }
}
