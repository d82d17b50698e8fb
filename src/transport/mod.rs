//! Transports that carry catalog calls.
//!
//! A transport hands out *channels*: one typed, bidirectional pair of a send
//! sink and a receive stream per call. The calling side gets them from a
//! [`Connector`] with [`Connector::open`], the serving side from a
//! [`Listener`] with [`Listener::accept`]. Channels know nothing about
//! services, they move `In` and `Out` messages and nothing else.
//!
//! [`StreamTypes`] names the sink and stream types, [`ConnectionErrors`] the
//! error types of a transport.
//!
//! # Finish and reset
//!
//! All transports in this module give the same guarantees about how a
//! direction of a channel ends:
//!
//! - closing the send sink ([`futures_util::SinkExt::close`]) *finishes* the
//!   direction. The receive stream on the other side yields all messages in
//!   order and then `None`.
//! - dropping the send sink without closing it *resets* the direction. The
//!   receive stream on the other side yields the messages that made it and
//!   then an error.
//! - [`abort`] *rejects* the call. The receive stream on the other side
//!   yields the messages that made it and then an error for which
//!   [`ConnectionErrors::is_fatal_recv_error`] holds.
use std::{
    error,
    fmt::{self, Debug, Display},
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures_lite::{future, Future, Stream};
use futures_sink::Sink;
use mapped::MappedConnector;
use serde::{Deserialize, Serialize};

use crate::{RpcError, RpcMessage};

#[cfg(feature = "flume-transport")]
#[cfg_attr(catalogrpc_docsrs, doc(cfg(feature = "flume-transport")))]
pub mod flume;
pub mod mapped;
#[cfg(feature = "tcp-transport")]
#[cfg_attr(catalogrpc_docsrs, doc(cfg(feature = "tcp-transport")))]
pub mod tcp;
#[cfg(feature = "tcp-transport")]
mod util;

/// Error types of a transport.
pub trait ConnectionErrors: Debug + Clone + Send + Sync + 'static {
    /// Error when sending a message via a channel
    type SendError: RpcError;
    /// Error when receiving a message via a channel
    type RecvError: RpcError;
    /// Error when opening a channel
    type OpenError: RpcError;
    /// Error when accepting a channel
    type AcceptError: RpcError;

    /// Whether a receive error means the call can not succeed by trying again.
    ///
    /// True when the peer rejected the call with an [AbortReason] or sent
    /// something that can not be decoded.
    fn is_fatal_recv_error(_err: &Self::RecvError) -> bool {
        false
    }

    /// Whether an accept error means the listener is gone for good.
    ///
    /// Other accept errors concern a single incoming connection.
    fn is_final_accept_error(_err: &Self::AcceptError) -> bool {
        false
    }
}

/// Message, sink and stream types shared by both ends of a transport.
pub trait StreamTypes: ConnectionErrors {
    /// The type of messages that can be received on the channel
    type In: RpcMessage;
    /// The type of messages that can be sent on the channel
    type Out: RpcMessage;
    /// Receive side of a bidirectional typed channel
    type RecvStream: Stream<Item = Result<Self::In, Self::RecvError>>
        + Send
        + Sync
        + Unpin
        + 'static;
    /// Send side of a bidirectional typed channel
    type SendSink: AbortSink<Self::Out, Error = Self::SendError> + Send + Sync + Unpin + 'static;
}

/// A send sink that can end its direction with a rejection instead of a finish.
pub trait AbortSink<T>: Sink<T> {
    /// Send an abort frame carrying `reason`, then close the direction.
    ///
    /// The receiving side yields an error for which
    /// [ConnectionErrors::is_fatal_recv_error] holds. Sending on the sink
    /// afterwards fails, like after a close.
    fn poll_abort(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        reason: AbortReason,
    ) -> Poll<Result<(), Self::Error>>;
}

/// Reject a call on `sink`, see [AbortSink::poll_abort].
pub async fn abort<T, S>(sink: &mut S, reason: AbortReason) -> Result<(), S::Error>
where
    S: AbortSink<T> + Unpin,
{
    future::poll_fn(|cx| Pin::new(&mut *sink).poll_abort(cx, reason)).await
}

/// Why a server rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The first message of the call can not open a call
    UnexpectedStartMessage,
    /// An update did not match the call
    UnexpectedUpdateMessage,
    /// The handler of the call panicked
    HandlerFailed,
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call rejected: {self:?}")
    }
}

impl error::Error for AbortReason {}

/// Calling end of a transport, opens one channel per call.
pub trait Connector: StreamTypes {
    /// Open a channel to the remote
    fn open(
        &self,
    ) -> impl Future<Output = Result<(Self::SendSink, Self::RecvStream), Self::OpenError>> + Send;

    /// Map the input and output types of this connection
    fn map<In1, Out1>(self) -> MappedConnector<In1, Out1, Self>
    where
        In1: TryFrom<Self::In>,
        Self::Out: From<Out1>,
        Self: Sized,
    {
        MappedConnector::new(self)
    }
}

/// Serving end of a transport, accepts the channels opened by connectors.
pub trait Listener: StreamTypes {
    /// Accept a new typed bidirectional channel.
    fn accept(
        &self,
    ) -> impl Future<Output = Result<(Self::SendSink, Self::RecvStream), Self::AcceptError>> + Send;

    /// The local addresses this endpoint is bound to.
    fn local_addr(&self) -> &[LocalAddr];
}

/// The kinds of local addresses a [Listener] can be bound to.
///
/// Returned by [Listener::local_addr].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum LocalAddr {
    /// A local socket.
    Socket(SocketAddr),
    /// An in-memory address.
    Mem,
}

impl Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LocalAddr::Socket(sockaddr) => write!(f, "{sockaddr}"),
            LocalAddr::Mem => write!(f, "mem"),
        }
    }
}

/// What actually travels over a channel direction.
///
/// `Finish` is the explicit close signal, `Abort` the explicit rejection.
/// A direction that ends without either was reset.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Frame<T> {
    Data(T),
    Finish,
    Abort(AbortReason),
}
