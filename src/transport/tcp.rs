//! TCP transport
//!
//! Every call gets its own TCP connection. Messages are postcard encoded and
//! length delimited. The explicit close signal is a dedicated frame, so a
//! connection that ends without it is reported as a reset even if the peer
//! shut down its write half cleanly.
use std::{
    fmt, io,
    marker::PhantomData,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_lite::Stream;
use futures_sink::Sink;
use pin_project::pin_project;
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream, ToSocketAddrs,
};
use tracing::trace;

use super::{
    util::{FramedPostcardRead, FramedPostcardWrite},
    AbortReason, AbortSink, ConnectionErrors, Connector, Frame, Listener, LocalAddr, StreamTypes,
};
use crate::RpcMessage;

/// Maximum size of a single encoded message
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024 * 16;

/// A listener that accepts one TCP connection per call.
pub struct TcpListener<In: RpcMessage, Out: RpcMessage> {
    inner: Arc<tokio::net::TcpListener>,
    addr: SocketAddr,
    local_addr: [LocalAddr; 1],
    _p: PhantomData<(In, Out)>,
}

impl<In: RpcMessage, Out: RpcMessage> TcpListener<In, Out> {
    /// Bind a new listener to the given address.
    ///
    /// Use port 0 to let the operating system pick a free port, and
    /// [Listener::local_addr] to find out which one it picked.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Self::new(inner)
    }

    /// Create a listener from an already bound tokio listener.
    pub fn new(inner: tokio::net::TcpListener) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            inner: Arc::new(inner),
            addr: local_addr,
            local_addr: [LocalAddr::Socket(local_addr)],
            _p: PhantomData,
        })
    }

    /// The socket address this listener is bound to.
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl<In: RpcMessage, Out: RpcMessage> Clone for TcpListener<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            addr: self.addr,
            local_addr: self.local_addr.clone(),
            _p: PhantomData,
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for TcpListener<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> ConnectionErrors for TcpListener<In, Out> {
    type SendError = io::Error;
    type RecvError = io::Error;
    type OpenError = io::Error;
    type AcceptError = io::Error;

    fn is_fatal_recv_error(err: &io::Error) -> bool {
        is_fatal(err)
    }
}

impl<In: RpcMessage, Out: RpcMessage> StreamTypes for TcpListener<In, Out> {
    type In = In;
    type Out = Out;
    type SendSink = SendSink<Out>;
    type RecvStream = RecvStream<In>;
}

impl<In: RpcMessage, Out: RpcMessage> Listener for TcpListener<In, Out> {
    async fn accept(&self) -> Result<(Self::SendSink, Self::RecvStream), Self::AcceptError> {
        let (stream, remote) = self.inner.accept().await?;
        trace!(%remote, "accepted connection");
        split(stream)
    }

    fn local_addr(&self) -> &[LocalAddr] {
        &self.local_addr
    }
}

/// A connector that opens one TCP connection per call.
pub struct TcpConnector<In: RpcMessage, Out: RpcMessage> {
    addr: Arc<str>,
    _p: PhantomData<(In, Out)>,
}

impl<In: RpcMessage, Out: RpcMessage> TcpConnector<In, Out> {
    /// Create a connector for the given `host:port` address.
    ///
    /// The address is resolved on every [Connector::open], so a server that
    /// is not up yet is not an error here.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: Arc::from(addr.into()),
            _p: PhantomData,
        }
    }

    /// The address this connector dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl<In: RpcMessage, Out: RpcMessage> Clone for TcpConnector<In, Out> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr.clone(),
            _p: PhantomData,
        }
    }
}

impl<In: RpcMessage, Out: RpcMessage> fmt::Debug for TcpConnector<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("addr", &self.addr)
            .finish()
    }
}

impl<In: RpcMessage, Out: RpcMessage> ConnectionErrors for TcpConnector<In, Out> {
    type SendError = io::Error;
    type RecvError = io::Error;
    type OpenError = io::Error;
    type AcceptError = io::Error;

    fn is_fatal_recv_error(err: &io::Error) -> bool {
        is_fatal(err)
    }
}

impl<In: RpcMessage, Out: RpcMessage> StreamTypes for TcpConnector<In, Out> {
    type In = In;
    type Out = Out;
    type SendSink = SendSink<Out>;
    type RecvStream = RecvStream<In>;
}

impl<In: RpcMessage, Out: RpcMessage> Connector for TcpConnector<In, Out> {
    async fn open(&self) -> Result<(Self::SendSink, Self::RecvStream), Self::OpenError> {
        let stream = TcpStream::connect(&*self.addr).await?;
        trace!(addr = %self.addr, "opened connection");
        split(stream)
    }
}

/// Undecodable frames and rejections, as opposed to a broken connection
fn is_fatal(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidData
        || err.get_ref().is_some_and(|inner| inner.is::<AbortReason>())
}

fn split<In: RpcMessage, Out: RpcMessage>(
    stream: TcpStream,
) -> io::Result<(SendSink<Out>, RecvStream<In>)> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok((SendSink::new(write), RecvStream::new(read)))
}

/// A sink that wraps the write half of a TCP connection with length delimiting and postcard
///
/// Closing the sink sends the finish frame and shuts down the write half.
#[pin_project]
pub struct SendSink<Out> {
    #[pin]
    inner: FramedPostcardWrite<OwnedWriteHalf, Frame<Out>>,
    finished: bool,
}

impl<Out> fmt::Debug for SendSink<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendSink")
            .field("finished", &self.finished)
            .finish()
    }
}

impl<Out: Serialize> SendSink<Out> {
    fn new(inner: OwnedWriteHalf) -> Self {
        Self {
            inner: FramedPostcardWrite::new(inner, MAX_FRAME_LENGTH),
            finished: false,
        }
    }
}

fn finished_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "sink already finished")
}

impl<Out: Serialize> Sink<Out> for SendSink<Out> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(Err(finished_error()));
        }
        this.inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Out) -> Result<(), Self::Error> {
        let this = self.project();
        if *this.finished {
            return Err(finished_error());
        }
        this.inner.start_send(Frame::Data(item))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_last(cx, Frame::Finish)
    }
}

impl<Out: Serialize> AbortSink<Out> for SendSink<Out> {
    fn poll_abort(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        reason: AbortReason,
    ) -> Poll<Result<(), Self::Error>> {
        self.poll_last(cx, Frame::Abort(reason))
    }
}

impl<Out: Serialize> SendSink<Out> {
    /// Send `last` unless the direction already ended, then flush it and
    /// shut down the write half.
    fn poll_last(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        last: Frame<Out>,
    ) -> Poll<Result<(), io::Error>> {
        let mut this = self.project();
        if !*this.finished {
            match this.inner.as_mut().poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
            this.inner.as_mut().start_send(last)?;
            *this.finished = true;
        }
        this.inner.poll_close(cx)
    }
}

/// A stream that wraps the read half of a TCP connection with length delimiting and postcard
#[pin_project]
pub struct RecvStream<In> {
    #[pin]
    inner: FramedPostcardRead<OwnedReadHalf, Frame<In>>,
    done: bool,
}

impl<In> fmt::Debug for RecvStream<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvStream")
            .field("done", &self.done)
            .finish()
    }
}

impl<In: DeserializeOwned> RecvStream<In> {
    fn new(inner: OwnedReadHalf) -> Self {
        Self {
            inner: FramedPostcardRead::new(inner, MAX_FRAME_LENGTH),
            done: false,
        }
    }
}

impl<In: DeserializeOwned> Stream for RecvStream<In> {
    type Item = Result<In, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(Frame::Data(item)))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Ok(Frame::Finish))) => {
                *this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(Frame::Abort(reason)))) => {
                *this.done = true;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    reason,
                ))))
            }
            Poll::Ready(Some(Err(cause))) => {
                *this.done = true;
                Poll::Ready(Some(Err(cause)))
            }
            Poll::Ready(None) => {
                *this.done = true;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream ended without finish",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use futures_util::SinkExt;
    use testresult::TestResult;

    use super::*;

    async fn pair() -> TestResult<(
        (SendSink<u32>, RecvStream<u32>),
        (SendSink<u32>, RecvStream<u32>),
    )> {
        let listener = TcpListener::<u32, u32>::bind("127.0.0.1:0").await?;
        let connector = TcpConnector::<u32, u32>::new(listener.socket_addr().to_string());
        let (open, accept) = tokio::join!(connector.open(), listener.accept());
        Ok((open?, accept?))
    }

    #[tokio::test]
    async fn close_finishes_the_stream() -> TestResult {
        let ((mut send, _recv), (_send, mut recv)) = pair().await?;
        send.send(1).await?;
        send.send(2).await?;
        send.close().await?;
        assert_eq!(recv.next().await.transpose()?, Some(1));
        assert_eq!(recv.next().await.transpose()?, Some(2));
        assert!(recv.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn drop_resets_the_stream() -> TestResult {
        let ((mut send, _recv), (_send, mut recv)) = pair().await?;
        send.send(1).await?;
        drop(send);
        assert_eq!(recv.next().await.transpose()?, Some(1));
        let err = recv.next().await.and_then(|res| res.err());
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::ConnectionReset));
        assert!(recv.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn send_after_close_fails() -> TestResult {
        let ((mut send, _recv), _server) = pair().await?;
        send.close().await?;
        assert!(send.send(1).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn abort_rejects_the_call() -> TestResult {
        let ((mut send, _recv), (_send, mut recv)) = pair().await?;
        send.send(1).await?;
        crate::transport::abort(&mut send, AbortReason::UnexpectedUpdateMessage).await?;
        assert_eq!(recv.next().await.transpose()?, Some(1));
        let err = recv.next().await.and_then(|res| res.err());
        let err = err.ok_or("expected an error")?;
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(TcpConnector::<u32, u32>::is_fatal_recv_error(&err));
        assert!(recv.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_frame_is_fatal() -> TestResult {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::<u32, u32>::bind("127.0.0.1:0").await?;
        let addr = listener.socket_addr();
        let (raw, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = raw?;
        let (_send, mut recv) = accepted?;
        // length prefix, then a frame tag no variant has
        raw.write_all(&[0, 0, 0, 1, 7]).await?;
        let err = recv.next().await.and_then(|res| res.err());
        let err = err.ok_or("expected an error")?;
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(TcpListener::<u32, u32>::is_fatal_recv_error(&err));
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(!TcpListener::<u32, u32>::is_fatal_recv_error(&reset));
        Ok(())
    }
}
