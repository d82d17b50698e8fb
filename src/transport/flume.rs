//! Memory transport implementation using [flume]
//!
//! [flume]: https://docs.rs/flume/
use core::fmt;
use std::{error, fmt::Display, marker::PhantomData, pin::Pin, result, task::Poll};

use futures_lite::{Future, Stream};
use futures_sink::Sink;

use super::{AbortReason, AbortSink, Frame, StreamTypes};
use crate::{
    transport::{ConnectionErrors, Connector, Listener, LocalAddr},
    RpcMessage,
};

/// Error when receiving from a channel
#[derive(Debug)]
pub enum RecvError {
    /// The sender was dropped without finishing the stream
    Reset,
    /// The sender rejected the call
    Aborted(AbortReason),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for RecvError {}

/// Sink for memory channels
///
/// Closing the sink finishes the stream for the receiver. Dropping it without
/// closing resets the stream.
pub struct SendSink<T: RpcMessage> {
    inner: flume::r#async::SendSink<'static, Frame<T>>,
    finished: bool,
}

impl<T: RpcMessage> SendSink<T> {
    fn new(inner: flume::Sender<Frame<T>>) -> Self {
        Self {
            inner: inner.into_sink(),
            finished: false,
        }
    }
}

impl<T: RpcMessage> fmt::Debug for SendSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendSink")
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T: RpcMessage> Sink<T> for SendSink<T> {
    type Error = self::SendError;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        if self.finished {
            return Poll::Ready(Err(SendError::Finished));
        }
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|_| SendError::ReceiverDropped)
    }

    fn start_send(mut self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if self.finished {
            return Err(SendError::Finished);
        }
        Pin::new(&mut self.inner)
            .start_send(Frame::Data(item))
            .map_err(|_| SendError::ReceiverDropped)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|_| SendError::ReceiverDropped)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.poll_last(cx, Frame::Finish)
    }
}

impl<T: RpcMessage> AbortSink<T> for SendSink<T> {
    fn poll_abort(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        reason: AbortReason,
    ) -> Poll<Result<(), Self::Error>> {
        self.poll_last(cx, Frame::Abort(reason))
    }
}

impl<T: RpcMessage> SendSink<T> {
    /// Send `last` unless the direction already ended, then flush.
    fn poll_last(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        last: Frame<T>,
    ) -> Poll<Result<(), SendError>> {
        if !self.finished {
            match Pin::new(&mut self.inner).poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => return Poll::Ready(Err(SendError::ReceiverDropped)),
                Poll::Pending => return Poll::Pending,
            }
            Pin::new(&mut self.inner)
                .start_send(last)
                .map_err(|_| SendError::ReceiverDropped)?;
            self.finished = true;
        }
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|_| SendError::ReceiverDropped)
    }
}

/// Stream for memory channels
pub struct RecvStream<T: RpcMessage> {
    inner: flume::r#async::RecvStream<'static, Frame<T>>,
    done: bool,
}

impl<T: RpcMessage> RecvStream<T> {
    fn new(inner: flume::Receiver<Frame<T>>) -> Self {
        Self {
            inner: inner.into_stream(),
            done: false,
        }
    }
}

impl<T: RpcMessage> fmt::Debug for RecvStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvStream")
            .field("done", &self.done)
            .finish()
    }
}

impl<T: RpcMessage> Stream for RecvStream<T> {
    type Item = result::Result<T, self::RecvError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Frame::Data(v))) => Poll::Ready(Some(Ok(v))),
            Poll::Ready(Some(Frame::Finish)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Frame::Abort(reason))) => {
                self.done = true;
                Poll::Ready(Some(Err(RecvError::Aborted(reason))))
            }
            Poll::Ready(None) => {
                // all senders are gone and nobody said finish
                self.done = true;
                Poll::Ready(Some(Err(RecvError::Reset)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

type Socket<In, Out> = (self::SendSink<Out>, self::RecvStream<In>);

/// A flume based listener.
///
/// Created using [channel].
pub struct FlumeListener<In: RpcMessage, Out: RpcMessage> {
    #[allow(clippy::type_complexity)]
    stream: flume::Receiver<Socket<In, Out>>,
}

impl<In: RpcMessage, Out: RpcMessage> Clone for FlumeListener<In, Out> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for FlumeListener<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlumeListener")
            .field("stream", &self.stream)
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> ConnectionErrors for FlumeListener<In, Out> {
    type SendError = self::SendError;
    type RecvError = self::RecvError;
    type OpenError = self::OpenError;
    type AcceptError = self::AcceptError;

    fn is_fatal_recv_error(err: &RecvError) -> bool {
        matches!(err, RecvError::Aborted(_))
    }

    fn is_final_accept_error(err: &AcceptError) -> bool {
        matches!(err, AcceptError::RemoteDropped)
    }
}

/// Future returned by [FlumeConnector::open]
pub struct OpenFuture<In: RpcMessage, Out: RpcMessage> {
    inner: flume::r#async::SendFut<'static, Socket<Out, In>>,
    res: Option<Socket<In, Out>>,
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for OpenFuture<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFuture").finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> OpenFuture<In, Out> {
    fn new(inner: flume::r#async::SendFut<'static, Socket<Out, In>>, res: Socket<In, Out>) -> Self {
        Self {
            inner,
            res: Some(res),
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> Future for OpenFuture<In, Out> {
    type Output = result::Result<Socket<In, Out>, self::OpenError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(())) => self
                .res
                .take()
                .map(|x| Poll::Ready(Ok(x)))
                .unwrap_or(Poll::Pending),
            Poll::Ready(Err(_)) => Poll::Ready(Err(self::OpenError::RemoteDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [FlumeListener::accept]
pub struct AcceptFuture<In: RpcMessage, Out: RpcMessage> {
    wrapped: flume::r#async::RecvFut<'static, Socket<In, Out>>,
    _p: PhantomData<(In, Out)>,
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for AcceptFuture<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptFuture").finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> Future for AcceptFuture<In, Out> {
    type Output = result::Result<Socket<In, Out>, AcceptError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.wrapped).poll(cx) {
            Poll::Ready(Ok((send, recv))) => Poll::Ready(Ok((send, recv))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AcceptError::RemoteDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> StreamTypes for FlumeListener<In, Out> {
    type In = In;
    type Out = Out;
    type SendSink = SendSink<Out>;
    type RecvStream = RecvStream<In>;
}

impl<In: RpcMessage, Out: RpcMessage> Listener for FlumeListener<In, Out> {
    #[allow(refining_impl_trait)]
    fn accept(&self) -> AcceptFuture<In, Out> {
        AcceptFuture {
            wrapped: self.stream.clone().into_recv_async(),
            _p: PhantomData,
        }
    }

    fn local_addr(&self) -> &[LocalAddr] {
        &[LocalAddr::Mem]
    }
}

impl<In: RpcMessage, Out: RpcMessage> ConnectionErrors for FlumeConnector<In, Out> {
    type SendError = self::SendError;
    type RecvError = self::RecvError;
    type OpenError = self::OpenError;
    type AcceptError = self::AcceptError;

    fn is_fatal_recv_error(err: &RecvError) -> bool {
        matches!(err, RecvError::Aborted(_))
    }
}

impl<In: RpcMessage, Out: RpcMessage> StreamTypes for FlumeConnector<In, Out> {
    type In = In;
    type Out = Out;
    type SendSink = SendSink<Out>;
    type RecvStream = RecvStream<In>;
}

impl<In: RpcMessage, Out: RpcMessage> Connector for FlumeConnector<In, Out> {
    #[allow(refining_impl_trait)]
    fn open(&self) -> OpenFuture<In, Out> {
        let (local_send, remote_recv) = flume::bounded::<Frame<Out>>(self.buffer);
        let (remote_send, local_recv) = flume::bounded::<Frame<In>>(self.buffer);
        let remote_chan = (SendSink::new(remote_send), RecvStream::new(remote_recv));
        let local_chan = (SendSink::new(local_send), RecvStream::new(local_recv));
        OpenFuture::new(self.sink.clone().into_send_async(remote_chan), local_chan)
    }
}

/// A flume based connector.
///
/// Created using [channel].
pub struct FlumeConnector<In: RpcMessage, Out: RpcMessage> {
    #[allow(clippy::type_complexity)]
    sink: flume::Sender<Socket<Out, In>>,
    buffer: usize,
}

impl<In: RpcMessage, Out: RpcMessage> Clone for FlumeConnector<In, Out> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            buffer: self.buffer,
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for FlumeConnector<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlumeConnector")
            .field("sink", &self.sink)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// AcceptError for mem channels.
///
/// There is not much that can go wrong with mem channels.
#[derive(Debug)]
pub enum AcceptError {
    /// The remote side of the channel was dropped
    RemoteDropped,
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for AcceptError {}

/// SendError for mem channels.
#[derive(Debug)]
pub enum SendError {
    /// Receiver was dropped
    ReceiverDropped,
    /// The sink was already closed
    Finished,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for SendError {}

/// OpenError for mem channels.
#[derive(Debug)]
pub enum OpenError {
    /// The remote side of the channel was dropped
    RemoteDropped,
}

impl Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for OpenError {}

/// Per direction buffer of every channel opened by a [FlumeConnector].
pub const CHANNEL_BUFFER: usize = 128;

/// Create a flume listener and a connected flume connector.
///
/// `buffer` the size of the buffer for pending, not yet accepted channels. Keep this at
/// a low value to get backpressure. Each channel has a buffer of [CHANNEL_BUFFER]
/// messages per direction, use [channel_with_buffer] to change it.
pub fn channel<Req: RpcMessage, Res: RpcMessage>(
    buffer: usize,
) -> (FlumeListener<Req, Res>, FlumeConnector<Res, Req>) {
    channel_with_buffer(buffer, CHANNEL_BUFFER)
}

/// Like [channel], with a custom per direction buffer for every channel.
pub fn channel_with_buffer<Req: RpcMessage, Res: RpcMessage>(
    buffer: usize,
    channel_buffer: usize,
) -> (FlumeListener<Req, Res>, FlumeConnector<Res, Req>) {
    let (sink, stream) = flume::bounded(buffer);
    (
        FlumeListener { stream },
        FlumeConnector {
            sink,
            buffer: channel_buffer.max(1),
        },
    )
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use futures_util::SinkExt;
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn close_finishes_the_stream() -> TestResult {
        let (listener, connector) = channel::<u64, u64>(1);
        let (open, accept) = tokio::join!(connector.open(), listener.accept());
        let (mut send, _recv) = open?;
        let (_send, mut recv) = accept?;
        send.send(1).await?;
        send.send(2).await?;
        send.close().await?;
        assert_eq!(recv.next().await.transpose()?, Some(1));
        assert_eq!(recv.next().await.transpose()?, Some(2));
        assert!(recv.next().await.is_none());
        assert!(recv.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn drop_resets_the_stream() -> TestResult {
        let (listener, connector) = channel::<u64, u64>(1);
        let (open, accept) = tokio::join!(connector.open(), listener.accept());
        let (mut send, _recv) = open?;
        let (_send, mut recv) = accept?;
        send.send(7).await?;
        drop(send);
        assert_eq!(recv.next().await.transpose()?, Some(7));
        assert!(matches!(recv.next().await, Some(Err(RecvError::Reset))));
        assert!(recv.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn send_after_close_fails() -> TestResult {
        let (listener, connector) = channel::<u64, u64>(1);
        let (open, accept) = tokio::join!(connector.open(), listener.accept());
        let (mut send, _recv) = open?;
        let (_send, _recv) = accept?;
        send.close().await?;
        assert!(matches!(send.send(1).await, Err(SendError::Finished)));
        Ok(())
    }

    #[tokio::test]
    async fn abort_rejects_the_call() -> TestResult {
        let (listener, connector) = channel::<u64, u64>(1);
        let (open, accept) = tokio::join!(connector.open(), listener.accept());
        let (_send, mut recv) = open?;
        let (mut send, _recv) = accept?;
        send.send(3).await?;
        crate::transport::abort(&mut send, AbortReason::HandlerFailed).await?;
        assert_eq!(recv.next().await.transpose()?, Some(3));
        let err = match recv.next().await {
            Some(Err(err)) => err,
            other => panic!("expected an error, got {other:?}"),
        };
        assert!(matches!(err, RecvError::Aborted(AbortReason::HandlerFailed)));
        assert!(FlumeConnector::<u64, u64>::is_fatal_recv_error(&err));
        assert!(!FlumeConnector::<u64, u64>::is_fatal_recv_error(&RecvError::Reset));
        assert!(recv.next().await.is_none());
        assert!(matches!(send.send(4).await, Err(SendError::Finished)));
        Ok(())
    }
}
