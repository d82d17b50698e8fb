use std::{
    io,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_lite::Stream;
use futures_sink::Sink;
use pin_project::pin_project;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Postcard format for [tokio_serde]
pub struct Postcard<Item, SinkItem> {
    _p: PhantomData<(Item, SinkItem)>,
}

impl<Item, SinkItem> Default for Postcard<Item, SinkItem> {
    fn default() -> Self {
        Self { _p: PhantomData }
    }
}

/// Postcard format that reads and writes the same type
pub type SymmetricalPostcard<T> = Postcard<T, T>;

impl<Item, SinkItem: Serialize> tokio_serde::Serializer<SinkItem> for Postcard<Item, SinkItem> {
    type Error = io::Error;

    fn serialize(self: Pin<&mut Self>, item: &SinkItem) -> Result<Bytes, Self::Error> {
        postcard::to_stdvec(item)
            .map(Bytes::from)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<Item: DeserializeOwned, SinkItem> tokio_serde::Deserializer<Item>
    for Postcard<Item, SinkItem>
{
    type Error = io::Error;

    fn deserialize(self: Pin<&mut Self>, src: &BytesMut) -> Result<Item, Self::Error> {
        postcard::from_bytes(src).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Wrapper that wraps a bidirectional binary stream in a length delimited codec and postcard
/// to get a stream of rpc messages
#[pin_project]
pub struct FramedPostcardRead<T, In>(
    #[pin]
    tokio_serde::SymmetricallyFramed<
        FramedRead<T, LengthDelimitedCodec>,
        In,
        SymmetricalPostcard<In>,
    >,
);

impl<T: AsyncRead, In: DeserializeOwned> FramedPostcardRead<T, In> {
    /// Wrap a socket in a length delimited codec and postcard
    pub fn new(inner: T, max_frame_length: usize) -> Self {
        // configure length delimited codec with max frame length
        let framing = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();
        // create the actual framing. This turns the AsyncRead into a Stream of BytesMut
        let framed = FramedRead::new(inner, framing);
        // this turns the Stream of BytesMut into a Stream of In
        let framed = tokio_serde::SymmetricallyFramed::new(framed, SymmetricalPostcard::default());
        Self(framed)
    }
}

impl<T: AsyncRead, In: DeserializeOwned> Stream for FramedPostcardRead<T, In> {
    type Item = Result<In, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().0.poll_next(cx)
    }
}

/// Wrapper that wraps a binary sink in a length delimited codec and postcard
/// to get a sink of rpc messages
#[pin_project]
pub struct FramedPostcardWrite<T, Out>(
    #[pin]
    tokio_serde::SymmetricallyFramed<
        FramedWrite<T, LengthDelimitedCodec>,
        Out,
        SymmetricalPostcard<Out>,
    >,
);

impl<T: AsyncWrite, Out: Serialize> FramedPostcardWrite<T, Out> {
    /// Wrap a socket in a length delimited codec and postcard
    pub fn new(inner: T, max_frame_length: usize) -> Self {
        let framing = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();
        let framed = FramedWrite::new(inner, framing);
        let framed = tokio_serde::SymmetricallyFramed::new(framed, SymmetricalPostcard::default());
        Self(framed)
    }
}

impl<T: AsyncWrite, Out: Serialize> Sink<Out> for FramedPostcardWrite<T, Out> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Out) -> Result<(), Self::Error> {
        self.project().0.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().0.poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use futures_util::SinkExt;
    use testresult::TestResult;

    use super::*;
    use crate::transport::Frame;

    #[tokio::test]
    async fn frames_survive_a_byte_pipe() -> TestResult {
        let (a, b) = tokio::io::duplex(64);
        let mut write = FramedPostcardWrite::<_, Frame<String>>::new(a, 1024);
        let mut read = FramedPostcardRead::<_, Frame<String>>::new(b, 1024);
        write.send(Frame::Data("hello".to_string())).await?;
        write.send(Frame::Finish).await?;
        assert!(matches!(read.next().await.transpose()?, Some(Frame::Data(s)) if s == "hello"));
        assert!(matches!(read.next().await.transpose()?, Some(Frame::Finish)));
        Ok(())
    }
}
