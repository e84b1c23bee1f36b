//! Raw notification stream wrapper.

use futures_core::Stream;
use std::{
    convert::TryFrom,
    pin::Pin,
    task::{Context, Poll},
};

use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{
    error::{Error, Result},
    types::NotifyMessage,
};

/// A subscription stream of raw property-change notifications, before any
/// bus routing.
///
/// Most code should go through [`Client::bus`] instead; this stream exists
/// for observability and debugging of the raw update traffic. It implements
/// [`Stream`] without exposing Tokio types in the public API.
///
/// [`Client::bus`]: crate::Client::bus
#[derive(Debug)]
pub struct NotifyStream {
    inner: BroadcastStream<NotifyMessage>,
}

fn clamp_missed(missed: u64) -> usize {
    usize::try_from(missed).unwrap_or(usize::MAX)
}

impl NotifyStream {
    pub(crate) fn new(rx: tokio::sync::broadcast::Receiver<NotifyMessage>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
        }
    }

    /// Receive the next notification.
    ///
    /// Convenience over the `Stream` interface when a plain `await` reads
    /// better.
    pub async fn recv(&mut self) -> Result<NotifyMessage> {
        use tokio_stream::StreamExt;

        match self.inner.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(BroadcastStreamRecvError::Lagged(missed))) => Err(Error::Lagged {
                missed: clamp_missed(missed),
            }),
            None => Err(Error::Disconnected),
        }
    }
}

impl Stream for NotifyStream {
    type Item = Result<NotifyMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                Poll::Ready(Some(Err(Error::Lagged {
                    missed: clamp_missed(missed),
                })))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
