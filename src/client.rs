//! Calling side of a service.
//!
//! [RpcClient] opens one channel per call. The call methods live next to
//! their pattern in [crate::pattern].
use std::{
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use futures_lite::Stream;
use futures_sink::Sink;
use futures_util::SinkExt;
use pin_project::pin_project;

use crate::{
    transport::{mapped::MappedConnector, StreamTypes},
    Connector, Service,
};

/// Boxed response stream that is `Send + Sync`.
pub type BoxStreamSync<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + Sync + 'a>>;

/// Client for service `S` over connector `C`.
///
/// Cloning is as cheap as cloning the connector. Every call opens its own
/// channel, so a single client can run any number of calls at once.
#[derive(Debug)]
pub struct RpcClient<S, C> {
    pub(crate) source: C,
    pub(crate) _p: PhantomData<S>,
}

impl<S, C: Clone> Clone for RpcClient<S, C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            _p: PhantomData,
        }
    }
}

impl<S, C> RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    /// Client for `S` on top of `source`.
    pub fn new(source: C) -> Self {
        Self {
            source,
            _p: PhantomData,
        }
    }

    /// Narrow the client to `SNext`, a service whose messages are nested in
    /// the messages of `S`.
    ///
    /// The catalog uses this to address one contract version on the shared
    /// endpoint, e.g. `client.map::<CatalogApiV1>()`.
    pub fn map<SNext>(self) -> RpcClient<SNext, MappedConnector<SNext::Res, SNext::Req, C>>
    where
        SNext: Service,
        S::Req: From<SNext::Req>,
        SNext::Res: TryFrom<S::Res>,
    {
        RpcClient::new(self.source.map::<SNext::Res, SNext::Req>())
    }
}

/// Outbound half of a client streaming or bidi call.
///
/// Items are converted into the channel's message type on send. The call's
/// request direction stays open until [UpdateSink::finish] (or
/// [close](SinkExt::close)). Dropping the sink without finishing resets the
/// direction, which the server treats as an aborted call.
#[pin_project]
#[derive(Debug)]
pub struct UpdateSink<C, T>(#[pin] C::SendSink, PhantomData<T>)
where
    C: StreamTypes;

impl<C, T> UpdateSink<C, T>
where
    C: StreamTypes,
    T: Into<C::Out>,
{
    pub(crate) fn new(sink: C::SendSink) -> Self {
        Self(sink, PhantomData)
    }

    /// Signal that no more updates follow.
    pub async fn finish(mut self) -> Result<(), C::SendError> {
        self.0.close().await
    }
}

impl<C, T> Sink<T> for UpdateSink<C, T>
where
    C: StreamTypes,
    T: Into<C::Out>,
{
    type Error = C::SendError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        self.project().0.start_send(item.into())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_close(cx)
    }
}

/// Response stream that owns the request sink of its call.
///
/// The sink is dropped together with the stream, so dropping the stream
/// resets the request direction and the server cancels the call.
#[pin_project]
pub(crate) struct DeferDrop<S: Stream, X>(#[pin] pub S, pub X);

impl<S: Stream, X> Stream for DeferDrop<S, X> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().0.poll_next(cx)
    }
}
