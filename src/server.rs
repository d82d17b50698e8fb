//! Server side api
//!
//! The main entry point is [RpcServer]
use std::{
    error,
    fmt::{self, Debug},
    marker::PhantomData,
    pin::Pin,
    result,
    task::{self, Poll},
};

use futures_lite::{Future, Stream, StreamExt};
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    transport::{abort, mapped::MappedStreamTypes, AbortReason, ConnectionErrors, StreamTypes},
    Listener, Service,
};

/// A server for a specific service.
///
/// This is a wrapper around a [`Listener`] that serves as the entry point for the server DSL.
///
/// Type parameters:
///
/// `S` is the service type.
/// `C` is the channel type.
#[derive(Debug)]
pub struct RpcServer<S, C> {
    /// The channel on which new requests arrive.
    ///
    /// Each new request is a receiver and channel pair on which messages for this request
    /// are received and responses sent.
    source: C,
    /// Parent of the cancellation token of every accepted call.
    cancel: CancellationToken,
    _p: PhantomData<S>,
}

impl<S, C: Clone> Clone for RpcServer<S, C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            cancel: self.cancel.clone(),
            _p: PhantomData,
        }
    }
}

impl<S: Service, C: Listener<S>> RpcServer<S, C> {
    /// Create a new rpc server for a specific service for a [Service] given a compatible
    /// [Listener].
    ///
    /// This is where a generic typed endpoint is converted into a server for a specific service.
    pub fn new(source: C) -> Self {
        Self {
            source,
            cancel: CancellationToken::new(),
            _p: PhantomData,
        }
    }

    /// Use `cancel` as the parent token of all calls accepted from now on.
    ///
    /// Cancelling it cancels every call in flight.
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The parent token of all calls accepted by this server.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Accepts a new channel from a client. The result is an [Accepting] object that
    /// can be used to read the first request.
    pub async fn accept(&self) -> result::Result<Accepting<S, C>, RpcServerError<C>> {
        let (send, recv) = self.source.accept().await.map_err(|e| {
            tracing::debug!("accept error: {:?}", e);
            RpcServerError::Accept(e)
        })?;
        Ok(Accepting {
            send,
            recv,
            cancel: self.cancel.child_token(),
            _p: PhantomData,
        })
    }

    /// Get the underlying service endpoint
    pub fn into_inner(self) -> C {
        self.source
    }
}

impl<S: Service, C: Listener<S>> AsRef<C> for RpcServer<S, C> {
    fn as_ref(&self) -> &C {
        &self.source
    }
}

/// An incoming request that has been accepted, but whose first message
/// has not been read yet.
///
/// Reading the first message may take some time, so do it on the task that
/// handles the call, not in the accept loop.
pub struct Accepting<S: Service, C: StreamTypes> {
    send: C::SendSink,
    recv: C::RecvStream,
    cancel: CancellationToken,
    _p: PhantomData<S>,
}

impl<S: Service, C: StreamTypes> Debug for Accepting<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepting")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<S: Service, C: StreamTypes<In = S::Req, Out = S::Res>> Accepting<S, C> {
    /// Read the first message from the client.
    ///
    /// The return value is a tuple of `(request, channel)`.  Here `request` is the
    /// first request which is already read from the stream.  The `channel` is a
    /// [RpcChannel] that has `sink` and `stream` fields that can be used to send more
    /// requests and/or receive more responses.
    pub async fn read_first(self) -> result::Result<(S::Req, RpcChannel<S, C>), RpcServerError<C>> {
        let Self {
            send,
            mut recv,
            cancel,
            ..
        } = self;
        let request = tokio::select! {
            _ = cancel.cancelled() => return Err(RpcServerError::Cancelled),
            request = recv.next() => request,
        };
        let request: S::Req = request
            // no msg => early close
            .ok_or(RpcServerError::EarlyClose)?
            // recv error
            .map_err(RpcServerError::RecvError)?;
        trace!(?request, "read first message");
        Ok((request, RpcChannel::with_cancellation_token(send, recv, cancel)))
    }
}

/// A channel for requests and responses for a specific service.
///
/// This just groups the sink and stream into a single type, and attaches the
/// information about the service type and the cancellation token of the call.
///
/// Sink and stream are independent, so you can take the channel apart and use
/// them independently.
///
/// Type parameters:
///
/// `S` is the service type.
/// `C` is the service endpoint from which the channel was created.
pub struct RpcChannel<S: Service, C: StreamTypes> {
    /// Sink to send responses to the client.
    pub send: C::SendSink,
    /// Stream to receive requests from the client.
    pub recv: C::RecvStream,
    pub(crate) cancel: CancellationToken,
    _p: PhantomData<S>,
}

impl<S: Service, C: StreamTypes> Debug for RpcChannel<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<S, C> RpcChannel<S, C>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = S::Res>,
{
    /// Create a new RPC channel with its own cancellation token.
    pub fn new(send: C::SendSink, recv: C::RecvStream) -> Self {
        Self::with_cancellation_token(send, recv, CancellationToken::new())
    }

    /// Create a new RPC channel that is cancelled together with `cancel`.
    pub fn with_cancellation_token(
        send: C::SendSink,
        recv: C::RecvStream,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            send,
            recv,
            cancel,
            _p: PhantomData,
        }
    }

    /// The cancellation token of this call.
    ///
    /// It is cancelled when the client goes away, when the server shuts down,
    /// or explicitly by the handler.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reject the call. The client gets a receive error that it does not
    /// retry, see [ConnectionErrors::is_fatal_recv_error].
    pub async fn reject(mut self, reason: AbortReason) -> result::Result<(), RpcServerError<C>> {
        self.cancel.cancel();
        abort::<C::Out, _>(&mut self.send, reason)
            .await
            .map_err(RpcServerError::SendError)
    }

    /// Map this channel's service into an inner service.
    ///
    /// This method is available if the required bounds are upheld:
    /// SNext::Req: TryFrom<S::Req>,
    /// S::Res: From<SNext::Res>,
    ///
    /// Where SNext is the new service to map to and S is the current service.
    pub fn map<SNext>(self) -> RpcChannel<SNext, MappedStreamTypes<SNext::Req, SNext::Res, C>>
    where
        SNext: Service,
        SNext::Req: TryFrom<S::Req>,
        S::Res: From<SNext::Res>,
    {
        RpcChannel::with_cancellation_token(
            crate::transport::mapped::MappedSendSink::new(self.send),
            crate::transport::mapped::MappedRecvStream::new(self.recv),
            self.cancel,
        )
    }
}

/// A stream of updates
///
/// If there is any error with receiving or with decoding the updates, the stream will stall,
/// the call is cancelled and the error will cause a termination of the RPC call.
#[pin_project]
#[derive(Debug)]
pub struct UpdateStream<C: StreamTypes, T>(
    #[pin] C::RecvStream,
    Option<oneshot::Sender<RpcServerError<C>>>,
    CancellationToken,
    PhantomData<T>,
);

impl<C: StreamTypes, T> UpdateStream<C, T> {
    pub(crate) fn new(
        recv: C::RecvStream,
        cancel: CancellationToken,
    ) -> (Self, UnwrapToPending<RpcServerError<C>>) {
        let (error_send, error_recv) = oneshot::channel();
        let error_recv = UnwrapToPending(error_recv);
        (Self(recv, Some(error_send), cancel, PhantomData), error_recv)
    }
}

impl<C: StreamTypes, T> Stream for UpdateStream<C, T>
where
    T: TryFrom<C::In>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.0.poll_next(cx) {
            Poll::Ready(Some(msg)) => match msg {
                Ok(msg) => match T::try_from(msg) {
                    Ok(msg) => Poll::Ready(Some(msg)),
                    Err(_cause) => {
                        // we were unable to downcast, so we need to send an error
                        if let Some(tx) = this.1.take() {
                            let _ = tx.send(RpcServerError::UnexpectedUpdateMessage);
                        }
                        this.2.cancel();
                        Poll::Pending
                    }
                },
                Err(cause) => {
                    // we got a recv error, so return pending and send the error
                    if let Some(tx) = this.1.take() {
                        let _ = tx.send(RpcServerError::RecvError(cause));
                    }
                    this.2.cancel();
                    Poll::Pending
                }
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Server error. All server DSL methods return a `Result` with this error type.
pub enum RpcServerError<C: ConnectionErrors> {
    /// Unable to open a new channel
    Accept(C::AcceptError),
    /// Recv side for a channel was closed before getting the first message
    EarlyClose,
    /// Got an unexpected first message, e.g. an update message
    UnexpectedStartMessage,
    /// Error receiving a message
    RecvError(C::RecvError),
    /// Error sending a response
    SendError(C::SendError),
    /// Got an unexpected update message, e.g. a request message or a non-matching update message
    UnexpectedUpdateMessage,
    /// The call was cancelled, by the client or by the server shutting down
    Cancelled,
    /// The handler panicked
    HandlerFailed,
}

impl<C: ConnectionErrors> RpcServerError<C> {
    /// Whether this error just means that the call did not finish.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Why the client should be told not to retry the call, if at all.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::UnexpectedStartMessage => Some(AbortReason::UnexpectedStartMessage),
            Self::UnexpectedUpdateMessage => Some(AbortReason::UnexpectedUpdateMessage),
            Self::HandlerFailed => Some(AbortReason::HandlerFailed),
            _ => None,
        }
    }
}

impl<C: ConnectionErrors> fmt::Debug for RpcServerError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept(arg0) => f.debug_tuple("Accept").field(arg0).finish(),
            Self::EarlyClose => write!(f, "EarlyClose"),
            Self::RecvError(arg0) => f.debug_tuple("RecvError").field(arg0).finish(),
            Self::SendError(arg0) => f.debug_tuple("SendError").field(arg0).finish(),
            Self::UnexpectedStartMessage => f.debug_tuple("UnexpectedStartMessage").finish(),
            Self::UnexpectedUpdateMessage => f.debug_tuple("UnexpectedUpdateMessage").finish(),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::HandlerFailed => write!(f, "HandlerFailed"),
        }
    }
}

impl<C: ConnectionErrors> fmt::Display for RpcServerError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

impl<C: ConnectionErrors> error::Error for RpcServerError<C> {}

/// Take an oneshot receiver and just return Pending if the underlying future
/// returns `Err(oneshot::Canceled)`
pub(crate) struct UnwrapToPending<T>(oneshot::Receiver<T>);

impl<T> Future for UnwrapToPending<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(x)) => Poll::Ready(x),
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) async fn race2<T, A: Future<Output = T>, B: Future<Output = T>>(f1: A, f2: B) -> T {
    tokio::select! {
        biased;
        x = f1 => x,
        x = f2 => x,
    }
}

/// Resolves with [RpcServerError::Cancelled] once `cancel` fires or the client
/// sends anything at all on the request direction.
///
/// Used for the patterns that do not expect updates. A finish, a reset or any
/// message from the client all mean the call should stop.
pub(crate) async fn cancel_on_update<C: StreamTypes>(
    mut recv: C::RecvStream,
    cancel: CancellationToken,
) -> RpcServerError<C> {
    tokio::select! {
        _ = cancel.cancelled() => {}
        msg = recv.next() => {
            trace!(update = msg.is_some(), "client went away");
            cancel.cancel();
        }
    }
    RpcServerError::Cancelled
}

/// Reject the call on `send` if `res` failed in a way a retry can not fix.
pub(crate) async fn abort_on_error<C: StreamTypes, T>(
    send: &mut C::SendSink,
    res: result::Result<T, RpcServerError<C>>,
) -> result::Result<T, RpcServerError<C>> {
    if let Err(cause) = &res {
        if let Some(reason) = cause.abort_reason() {
            trace!(?reason, "rejecting call");
            abort::<C::Out, _>(send, reason).await.ok();
        }
    }
    res
}

#[cfg(all(test, feature = "flume-transport"))]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::{
        proto::{CatalogRequest, CatalogResponse, CatalogService},
        transport::{flume, Connector, Listener},
    };

    #[tokio::test]
    async fn channel_debug_shows_cancellation() -> TestResult {
        let (listener, connector) = flume::channel::<CatalogRequest, CatalogResponse>(1);
        let (open, accept) = tokio::join!(connector.open(), listener.accept());
        let _client = open?;
        let (send, recv) = accept?;
        let chan = RpcChannel::<CatalogService, flume::FlumeListener<_, _>>::new(send, recv);
        assert_eq!(format!("{chan:?}"), "RpcChannel { cancelled: false }");
        chan.cancellation_token().cancel();
        assert_eq!(format!("{chan:?}"), "RpcChannel { cancelled: true }");
        Ok(())
    }
}
