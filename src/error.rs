//! Caller facing errors.
//!
//! The pattern specific client errors are precise but transport dependent.
//! [CallError] folds all of them into the four outcomes a caller acts on.
use std::{error, future, time::Duration};

use async_stream::stream;
use futures_lite::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    pattern::{bidi_streaming, client_streaming, rpc, server_streaming},
    transport::ConnectionErrors,
};

/// Outcome of a call that did not succeed.
#[derive(Debug, derive_more::Display)]
pub enum CallError {
    /// The caller aborted the call before it completed.
    #[display("call cancelled")]
    Cancelled,
    /// A deadline elapsed before the call completed.
    #[display("deadline exceeded")]
    DeadlineExceeded,
    /// A transport failure that a new attempt may not hit.
    #[display("transient failure: {_0}")]
    Transient(anyhow::Error),
    /// Anything else. Never retried.
    #[display("call failed: {_0}")]
    Fatal(anyhow::Error),
}

impl CallError {
    /// Wrap a transport level error.
    pub fn transient(cause: impl Into<anyhow::Error>) -> Self {
        Self::Transient(cause.into())
    }

    /// Wrap an error that retrying will not fix.
    pub fn fatal(cause: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(cause.into())
    }

    /// Whether a new attempt may succeed.
    ///
    /// This is the default retry predicate of [crate::resilience::Resilient].
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::DeadlineExceeded)
    }

    /// Whether the call just did not finish, because it was cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl error::Error for CallError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transient(cause) | Self::Fatal(cause) => Some(&**cause),
            _ => None,
        }
    }
}

fn classify(fatal: bool, cause: impl Into<anyhow::Error>) -> CallError {
    if fatal {
        CallError::fatal(cause)
    } else {
        CallError::transient(cause)
    }
}

impl<C: ConnectionErrors> From<rpc::Error<C>> for CallError {
    fn from(value: rpc::Error<C>) -> Self {
        let fatal = match &value {
            rpc::Error::DowncastError => true,
            rpc::Error::RecvError(cause) => C::is_fatal_recv_error(cause),
            _ => false,
        };
        classify(fatal, value)
    }
}

impl<C: ConnectionErrors> From<server_streaming::Error<C>> for CallError {
    fn from(value: server_streaming::Error<C>) -> Self {
        Self::transient(value)
    }
}

impl<C: ConnectionErrors> From<server_streaming::ItemError<C>> for CallError {
    fn from(value: server_streaming::ItemError<C>) -> Self {
        let fatal = match &value {
            server_streaming::ItemError::DowncastError => true,
            server_streaming::ItemError::RecvError(cause) => C::is_fatal_recv_error(cause),
        };
        classify(fatal, value)
    }
}

impl<C: ConnectionErrors> From<client_streaming::Error<C>> for CallError {
    fn from(value: client_streaming::Error<C>) -> Self {
        Self::transient(value)
    }
}

impl<C: ConnectionErrors> From<client_streaming::ItemError<C>> for CallError {
    fn from(value: client_streaming::ItemError<C>) -> Self {
        let fatal = match &value {
            client_streaming::ItemError::DowncastError => true,
            client_streaming::ItemError::RecvError(cause) => C::is_fatal_recv_error(cause),
            client_streaming::ItemError::EarlyClose => false,
        };
        classify(fatal, value)
    }
}

impl<C: ConnectionErrors> From<bidi_streaming::Error<C>> for CallError {
    fn from(value: bidi_streaming::Error<C>) -> Self {
        Self::transient(value)
    }
}

impl<C: ConnectionErrors> From<bidi_streaming::ItemError<C>> for CallError {
    fn from(value: bidi_streaming::ItemError<C>) -> Self {
        let fatal = match &value {
            bidi_streaming::ItemError::DowncastError => true,
            bidi_streaming::ItemError::RecvError(cause) => C::is_fatal_recv_error(cause),
        };
        classify(fatal, value)
    }
}

enum Step<T> {
    Item(Option<T>),
    Stop(CallError),
}

/// Make a response stream stop on `cancel` or after `timeout`.
///
/// The returned stream passes items through until the call ends, then yields
/// one [CallError::Cancelled] or [CallError::DeadlineExceeded] if it was cut
/// short. The inner stream is dropped at that point, which cancels the call on
/// the server.
pub fn cancellable<S, T, E>(
    responses: S,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> impl Stream<Item = Result<T, CallError>> + Send + 'static
where
    S: Stream<Item = Result<T, E>> + Send + Unpin + 'static,
    T: Send + 'static,
    E: Send + 'static,
    CallError: From<E>,
{
    stream! {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut responses = responses;
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop(CallError::Cancelled),
                _ = elapsed(deadline) => Step::Stop(CallError::DeadlineExceeded),
                item = responses.next() => Step::Item(item),
            };
            match step {
                Step::Item(Some(item)) => yield item.map_err(CallError::from),
                Step::Item(None) => break,
                Step::Stop(cause) => {
                    drop(responses);
                    yield Err(cause);
                    break;
                }
            }
        }
    }
}

async fn elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use futures_lite::stream;

    use super::*;

    #[test]
    fn transient_and_cancelled_overlap_on_deadline() {
        assert!(CallError::DeadlineExceeded.is_transient());
        assert!(CallError::DeadlineExceeded.is_cancelled());
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(CallError::transient(reset).is_transient());
        assert!(!CallError::Cancelled.is_transient());
        assert!(!CallError::fatal(anyhow::anyhow!("bad payload")).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_a_pending_stream() {
        let responses = stream::pending::<Result<u32, CallError>>();
        let timeout = Some(Duration::from_millis(50));
        let responses = cancellable(responses, CancellationToken::new(), timeout);
        tokio::pin!(responses);
        assert!(matches!(
            responses.next().await,
            Some(Err(CallError::DeadlineExceeded))
        ));
        assert!(responses.next().await.is_none());
    }

    #[tokio::test]
    async fn items_pass_until_cancelled() {
        let cancel = CancellationToken::new();
        let responses = stream::iter([Ok::<_, CallError>(1u32), Ok(2)]).chain(stream::pending());
        let responses = cancellable(responses, cancel.clone(), None);
        tokio::pin!(responses);
        assert_eq!(responses.next().await.transpose().ok().flatten(), Some(1));
        assert_eq!(responses.next().await.transpose().ok().flatten(), Some(2));
        cancel.cancel();
        assert!(matches!(responses.next().await, Some(Err(CallError::Cancelled))));
        assert!(responses.next().await.is_none());
    }

    #[cfg(feature = "flume-transport")]
    #[test]
    fn rejected_and_undecodable_answers_are_fatal() {
        use crate::transport::{
            flume::{FlumeConnector, RecvError},
            mapped::{ErrorOrMapError, MappedConnector},
            AbortReason,
        };

        type Flume = FlumeConnector<u64, u64>;
        type Mapped = MappedConnector<u32, u32, Flume>;

        let rejected = RecvError::Aborted(AbortReason::HandlerFailed);
        let aborted = rpc::Error::<Flume>::RecvError(rejected);
        assert!(matches!(CallError::from(aborted), CallError::Fatal(_)));
        let reset = rpc::Error::<Flume>::RecvError(RecvError::Reset);
        assert!(CallError::from(reset).is_transient());
        let wrong_version = rpc::Error::<Mapped>::RecvError(ErrorOrMapError::Conversion);
        assert!(matches!(CallError::from(wrong_version), CallError::Fatal(_)));
        let item = server_streaming::ItemError::<Mapped>::RecvError(ErrorOrMapError::Conversion);
        assert!(!CallError::from(item).is_transient());
    }
}
