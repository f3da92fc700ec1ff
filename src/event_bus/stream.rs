use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{error, Receiver};
use tokio::time::timeout;

use super::event::Event;

/// Subscription to a bus's broadcast feed.
///
/// Slow subscribers may lag; lag notifications are surfaced by [`recv`]
/// and transparently skipped by the stream and iterator adapters.
///
/// [`recv`]: Self::recv
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub(super) fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Receive the next event, awaiting if necessary.
    pub async fn recv(&mut self) -> Result<Event, error::RecvError> {
        self.receiver.recv().await
    }

    /// Try to receive an event without awaiting.
    pub fn try_recv(&mut self) -> Result<Event, error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Consume this wrapper, returning the inner broadcast receiver.
    pub fn into_inner(self) -> Receiver<Event> {
        self.receiver
    }

    /// Consume and convert into a blocking iterator for sync consumers.
    pub fn into_blocking_iter(self) -> BlockingEventIter {
        BlockingEventIter {
            receiver: self.receiver,
        }
    }

    /// Consume and convert into a boxed async stream of events.
    ///
    /// Lag notifications are skipped; the stream ends when the bus closes.
    pub fn into_async_stream(self) -> BoxStream<'static, Event> {
        stream::unfold(self, |mut stream| async move {
            loop {
                match stream.recv().await {
                    Ok(event) => return Some((event, stream)),
                    Err(error::RecvError::Lagged(_)) => continue,
                    Err(error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Await the next event with a timeout, skipping lag notifications.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<Event> {
        loop {
            match timeout(duration, self.recv()).await {
                Ok(Ok(event)) => return Some(event),
                Ok(Err(error::RecvError::Lagged(_))) => continue,
                Ok(Err(error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }
}

/// Blocking iterator over a subscription, for use outside async contexts.
pub struct BlockingEventIter {
    receiver: Receiver<Event>,
}

impl Iterator for BlockingEventIter {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.receiver.blocking_recv() {
                Ok(event) => return Some(event),
                Err(error::RecvError::Lagged(_)) => continue,
                Err(error::RecvError::Closed) => return None,
            }
        }
    }
}
