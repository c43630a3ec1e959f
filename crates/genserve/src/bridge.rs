//! Streaming bridge between a worker's generation loop and a response.
//!
//! A bridge is an ordered, bounded, single-producer/single-consumer channel of
//! text fragments terminated by an explicit end marker. One channel is created
//! per request and its [`StreamSender`] is moved into the worker, so two
//! concurrent requests can never observe each other's fragments.
//!
//! ## Semantics
//!
//! - Fragments are delivered in the order they were put.
//! - [`StreamSender::put_end`] consumes the sender, so the end marker is
//!   always the last item.
//! - After the end marker has been observed, every later
//!   [`StreamReceiver::get`] returns [`StreamItem::End`] again.
//! - A producer that disappears without an end marker, or that reports a
//!   failure via [`StreamSender::fail`], terminates the stream abnormally.
//! - With a timeout configured, a producer blocked on a full channel or a
//!   consumer waiting on an empty one fails with [`Error::ChannelTimeout`].

use crate::{Error, Result};
use core::time::Duration;
use futures::Stream;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::SendTimeoutError},
};

/// An item observed by the consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamItem {
    Fragment(String),
    End,
}

#[derive(Debug)]
enum Message {
    Fragment(String),
    End,
    Failed(Error),
}

/// Creates a per-request stream channel.
///
/// `capacity` bounds the number of undelivered fragments (minimum 1).
/// `timeout`, when set, bounds how long either side waits.
pub fn stream_channel(
    capacity: usize,
    timeout: Option<Duration>,
) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamSender {
            tx,
            timeout,
            handle: Handle::try_current().ok(),
        },
        StreamReceiver {
            rx,
            timeout,
            state: State::Open,
        },
    )
}

/// Producer half, owned by exactly one in-flight generation.
#[derive(Debug)]
pub struct StreamSender {
    tx: mpsc::Sender<Message>,
    timeout: Option<Duration>,
    // Used to honour `timeout` from the worker's plain OS thread.
    handle: Option<Handle>,
}

impl StreamSender {
    /// Appends a fragment.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelTimeout`] if the consumer does not drain in time.
    /// - [`Error::RequestCancelled`] if the consumer is gone.
    pub async fn put(&self, fragment: impl Into<String>) -> Result<()> {
        self.send(Message::Fragment(fragment.into())).await
    }

    /// Appends the end marker and releases the channel.
    pub async fn put_end(self) -> Result<()> {
        self.send(Message::End).await
    }

    /// Terminates the stream abnormally with `err`. Best effort: if the
    /// consumer is already gone there is nobody left to tell.
    pub async fn fail(self, err: Error) {
        let _ = self.send(Message::Failed(err)).await;
    }

    /// [`Self::put`] for callers outside the async runtime.
    pub fn blocking_put(&self, fragment: impl Into<String>) -> Result<()> {
        self.blocking_send(Message::Fragment(fragment.into()))
    }

    /// [`Self::put_end`] for callers outside the async runtime.
    pub fn blocking_put_end(self) -> Result<()> {
        self.blocking_send(Message::End)
    }

    /// [`Self::fail`] for callers outside the async runtime.
    pub fn blocking_fail(self, err: Error) {
        let _ = self.blocking_send(Message::Failed(err));
    }

    /// Returns `true` once the consumer has dropped its half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, msg: Message) -> Result<()> {
        match self.timeout {
            Some(timeout) => self.tx.send_timeout(msg, timeout).await.map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Error::ChannelTimeout(timeout),
                SendTimeoutError::Closed(_) => Error::RequestCancelled,
            }),
            None => self
                .tx
                .send(msg)
                .await
                .map_err(|_| Error::RequestCancelled),
        }
    }

    fn blocking_send(&self, msg: Message) -> Result<()> {
        match (&self.handle, self.timeout) {
            (Some(handle), Some(_)) => handle.block_on(self.send(msg)),
            // No runtime to time out against; wait for capacity.
            _ => self
                .tx
                .blocking_send(msg)
                .map_err(|_| Error::RequestCancelled),
        }
    }
}

#[derive(Debug)]
enum State {
    Open,
    Ended,
    Failed(Error),
}

/// Consumer half, read by exactly one response.
#[derive(Debug)]
pub struct StreamReceiver {
    rx: mpsc::Receiver<Message>,
    timeout: Option<Duration>,
    state: State,
}

impl StreamReceiver {
    /// Waits for the next fragment or the end marker.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelTimeout`] if nothing arrives within the timeout.
    /// - The producer's error if it called [`StreamSender::fail`].
    /// - [`Error::ChannelError`] if the producer vanished without an end
    ///   marker.
    pub async fn get(&mut self) -> Result<StreamItem> {
        match &self.state {
            State::Open => {}
            State::Ended => return Ok(StreamItem::End),
            State::Failed(err) => return Err(err.clone()),
        }

        let next = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.rx.recv())
                .await
                .map_err(|_| Error::ChannelTimeout(timeout))?,
            None => self.rx.recv().await,
        };

        match next {
            Some(Message::Fragment(fragment)) => Ok(StreamItem::Fragment(fragment)),
            Some(Message::End) => {
                self.state = State::Ended;
                self.rx.close();
                Ok(StreamItem::End)
            }
            Some(Message::Failed(err)) => {
                self.state = State::Failed(err.clone());
                self.rx.close();
                Err(err)
            }
            None => {
                let err = Error::channel("producer dropped without end of stream");
                self.state = State::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Returns `true` once the end marker or a failure has been observed.
    pub const fn is_terminated(&self) -> bool {
        !matches!(self.state, State::Open)
    }

    /// Adapts the receiver into a stream of fragments that finishes at the end
    /// marker, or after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> + Send {
        futures::stream::unfold(self, |mut rx| async move {
            if rx.is_terminated() {
                return None;
            }
            match rx.get().await {
                Ok(StreamItem::Fragment(fragment)) => Some((Ok(fragment), rx)),
                Ok(StreamItem::End) => None,
                Err(err) => Some((Err(err), rx)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn fragments_arrive_in_order_then_end() {
        let (tx, mut rx) = stream_channel(8, None);
        tx.put("a").await.unwrap();
        tx.put("b").await.unwrap();
        tx.put_end().await.unwrap();

        assert_eq!(rx.get().await.unwrap(), StreamItem::Fragment("a".into()));
        assert_eq!(rx.get().await.unwrap(), StreamItem::Fragment("b".into()));
        assert_eq!(rx.get().await.unwrap(), StreamItem::End);
        assert!(rx.is_terminated());
    }

    #[tokio::test]
    async fn get_after_end_keeps_signalling_end() {
        let (tx, mut rx) = stream_channel(1, None);
        tx.put_end().await.unwrap();
        assert_eq!(rx.get().await.unwrap(), StreamItem::End);
        assert_eq!(rx.get().await.unwrap(), StreamItem::End);
        assert_eq!(rx.get().await.unwrap(), StreamItem::End);
    }

    #[tokio::test]
    async fn dropped_producer_is_abnormal_termination() {
        let (tx, mut rx) = stream_channel(4, None);
        tx.put("partial").await.unwrap();
        drop(tx);

        assert_eq!(
            rx.get().await.unwrap(),
            StreamItem::Fragment("partial".into())
        );
        assert!(matches!(rx.get().await, Err(Error::ChannelError { .. })));
        assert!(rx.is_terminated());
    }

    #[tokio::test]
    async fn producer_failure_reaches_consumer() {
        let (tx, mut rx) = stream_channel(4, None);
        tx.fail(Error::generation("out of memory")).await;
        assert_eq!(
            rx.get().await.unwrap_err(),
            Error::generation("out of memory")
        );
        // Sticky
        assert!(rx.get().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_times_out_on_silence() {
        let (_tx, mut rx) = stream_channel(4, Some(Duration::from_millis(50)));
        assert_eq!(
            rx.get().await.unwrap_err(),
            Error::ChannelTimeout(Duration::from_millis(50))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn producer_times_out_when_consumer_stalls() {
        let (tx, _rx) = stream_channel(1, Some(Duration::from_millis(50)));
        tx.put("fills the buffer").await.unwrap();
        assert_eq!(
            tx.put("blocked").await.unwrap_err(),
            Error::ChannelTimeout(Duration::from_millis(50))
        );
    }

    #[tokio::test]
    async fn put_after_consumer_drop_is_cancellation() {
        let (tx, rx) = stream_channel(4, None);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.put("x").await.unwrap_err(), Error::RequestCancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_producer_on_plain_thread() {
        let (tx, rx) = stream_channel(2, Some(Duration::from_secs(5)));
        let producer = std::thread::spawn(move || {
            for i in 0..10 {
                tx.blocking_put(i.to_string()).unwrap();
            }
            tx.blocking_put_end().unwrap();
        });

        let fragments: Vec<String> = rx.into_stream().map(|r| r.unwrap()).collect().await;
        producer.join().unwrap();
        assert_eq!(
            fragments,
            (0..10).map(|i| i.to_string()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn into_stream_stops_after_error() {
        let (tx, rx) = stream_channel(4, None);
        tx.put("a").await.unwrap();
        tx.fail(Error::generation("boom")).await;

        let items: Vec<Result<String>> = rx.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "a");
        assert!(items[1].is_err());
    }
}
