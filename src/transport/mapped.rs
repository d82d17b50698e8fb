//! Transport with mapped input and output types.
//!
//! This is how several services share one endpoint: the endpoint speaks an
//! outer service whose messages wrap the messages of the inner services, and
//! clients and server channels are mapped down to the inner service.
use std::{
    fmt::{self, Debug, Display},
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use futures_lite::{Future, Stream, StreamExt};
use futures_util::SinkExt;
use pin_project::pin_project;

use super::{AbortReason, AbortSink, ConnectionErrors, Connector, StreamTypes};
use crate::{RpcError, RpcMessage};

/// A connector that maps input and output types
pub struct MappedConnector<In, Out, C> {
    inner: C,
    _p: PhantomData<(In, Out)>,
}

impl<In, Out, C> MappedConnector<In, Out, C>
where
    C: Connector,
    In: TryFrom<C::In>,
    C::Out: From<Out>,
{
    /// Create a new mapped connector
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            _p: PhantomData,
        }
    }
}

impl<In, Out, C: Debug> Debug for MappedConnector<In, Out, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedConnector")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<In, Out, C: Clone> Clone for MappedConnector<In, Out, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _p: PhantomData,
        }
    }
}

impl<In, Out, C> ConnectionErrors for MappedConnector<In, Out, C>
where
    In: RpcMessage,
    Out: RpcMessage,
    C: ConnectionErrors,
{
    type SendError = C::SendError;
    type RecvError = ErrorOrMapError<C::RecvError>;
    type OpenError = C::OpenError;
    type AcceptError = C::AcceptError;

    fn is_fatal_recv_error(err: &Self::RecvError) -> bool {
        err.is_fatal::<C>()
    }

    fn is_final_accept_error(err: &Self::AcceptError) -> bool {
        C::is_final_accept_error(err)
    }
}

impl<In, Out, C> StreamTypes for MappedConnector<In, Out, C>
where
    C: StreamTypes,
    In: RpcMessage,
    Out: RpcMessage,
    In: TryFrom<C::In>,
    C::Out: From<Out>,
{
    type In = In;
    type Out = Out;
    type RecvStream = MappedRecvStream<C::RecvStream, In>;
    type SendSink = MappedSendSink<C::SendSink, Out, C::Out>;
}

impl<In, Out, C> Connector for MappedConnector<In, Out, C>
where
    C: Connector,
    In: RpcMessage,
    Out: RpcMessage,
    In: TryFrom<C::In>,
    C::Out: From<Out>,
{
    fn open(
        &self,
    ) -> impl Future<Output = Result<(Self::SendSink, Self::RecvStream), Self::OpenError>> + Send
    {
        let inner = self.inner.open();
        async move {
            let (send, recv) = inner.await?;
            Ok((MappedSendSink::new(send), MappedRecvStream::new(recv)))
        }
    }
}

/// Stream types of a server side channel that was mapped to an inner service.
///
/// `C` are the stream types of the outer channel.
pub struct MappedStreamTypes<In, Out, C> {
    _p: PhantomData<(In, Out, C)>,
}

impl<In, Out, C> Debug for MappedStreamTypes<In, Out, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedStreamTypes").finish()
    }
}

impl<In, Out, C> Clone for MappedStreamTypes<In, Out, C> {
    fn clone(&self) -> Self {
        Self { _p: PhantomData }
    }
}

impl<In, Out, C> ConnectionErrors for MappedStreamTypes<In, Out, C>
where
    In: RpcMessage,
    Out: RpcMessage,
    C: ConnectionErrors,
{
    type SendError = C::SendError;
    type RecvError = ErrorOrMapError<C::RecvError>;
    type OpenError = C::OpenError;
    type AcceptError = C::AcceptError;

    fn is_fatal_recv_error(err: &Self::RecvError) -> bool {
        err.is_fatal::<C>()
    }

    fn is_final_accept_error(err: &Self::AcceptError) -> bool {
        C::is_final_accept_error(err)
    }
}

impl<In, Out, C> StreamTypes for MappedStreamTypes<In, Out, C>
where
    C: StreamTypes,
    In: RpcMessage,
    Out: RpcMessage,
    In: TryFrom<C::In>,
    C::Out: From<Out>,
{
    type In = In;
    type Out = Out;
    type RecvStream = MappedRecvStream<C::RecvStream, In>;
    type SendSink = MappedSendSink<C::SendSink, Out, C::Out>;
}

/// A combinator that maps a stream of incoming messages to a different type
#[pin_project]
pub struct MappedRecvStream<S, In> {
    inner: S,
    _p: PhantomData<In>,
}

impl<S, In> MappedRecvStream<S, In> {
    /// Create a new mapped receive stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _p: PhantomData,
        }
    }
}

impl<S: Debug, In> Debug for MappedRecvStream<S, In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MappedRecvStream").field(&self.inner).finish()
    }
}

/// Error mapping an incoming message to the inner type
#[derive(Debug)]
pub enum ErrorOrMapError<E> {
    /// Error from the inner stream
    Inner(E),
    /// Conversion error
    Conversion,
}

impl<E: Display> Display for ErrorOrMapError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorOrMapError::Inner(e) => write!(f, "Inner error: {e}"),
            ErrorOrMapError::Conversion => write!(f, "Conversion error"),
        }
    }
}

impl<E: Debug + Display> std::error::Error for ErrorOrMapError<E> {}

impl<E> ErrorOrMapError<E> {
    /// A message of the wrong type is never going to convert on a retry.
    fn is_fatal<C: ConnectionErrors<RecvError = E>>(&self) -> bool {
        match self {
            ErrorOrMapError::Inner(e) => C::is_fatal_recv_error(e),
            ErrorOrMapError::Conversion => true,
        }
    }
}

impl<S, In0, In, E> Stream for MappedRecvStream<S, In>
where
    S: Stream<Item = Result<In0, E>> + Unpin,
    In: TryFrom<In0>,
    E: RpcError,
{
    type Item = Result<In, ErrorOrMapError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match self.project().inner.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                let item = item.try_into().map_err(|_| ErrorOrMapError::Conversion);
                Poll::Ready(Some(item))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(ErrorOrMapError::Inner(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A sink that maps outgoing messages to a different type
///
/// The conversion to the underlying message type always succeeds, so this
/// is relatively simple.
#[pin_project]
pub struct MappedSendSink<S, Out, OutS> {
    inner: S,
    _p: PhantomData<(Out, OutS)>,
}

impl<S, Out, OutS> MappedSendSink<S, Out, OutS> {
    /// Create a new mapped send sink
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _p: PhantomData,
        }
    }
}

impl<S: Debug, Out, OutS> Debug for MappedSendSink<S, Out, OutS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MappedSendSink").field(&self.inner).finish()
    }
}

impl<S, Out, OutS> futures_sink::Sink<Out> for MappedSendSink<S, Out, OutS>
where
    S: futures_sink::Sink<OutS> + Unpin,
    Out: Into<OutS>,
{
    type Error = S::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready_unpin(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Out) -> Result<(), Self::Error> {
        self.project().inner.start_send_unpin(item.into())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush_unpin(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close_unpin(cx)
    }
}

impl<S, Out, OutS> AbortSink<Out> for MappedSendSink<S, Out, OutS>
where
    S: AbortSink<OutS> + Unpin,
    Out: Into<OutS>,
{
    fn poll_abort(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        reason: AbortReason,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(self.project().inner).poll_abort(cx, reason)
    }
}
