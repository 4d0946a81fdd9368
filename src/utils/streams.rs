// src/utils/streams.rs
//! Channels connecting stages.
//!
//! A [`QueueChannel`] carries one tuple per sample from a single [`Emitter`] to any
//! number of subscribers. Every subscriber sees every tuple (broadcast fan-out, not
//! load balancing), and a subscriber that attaches late is first replayed everything
//! already emitted, so wiring order never loses data. The channel closes when its
//! emitter is dropped.
//!
//! A [`ValueChannel`] carries exactly one value (a shared reference such as an index
//! path) that every reader receives.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::Stream;
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::defs::PipelineError;


/// Anything that can be matched by sample key in joins and sorted collections.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Pairs produced by `combine` and `join` keep the key of their left element.
impl<A: Keyed, B> Keyed for (A, B) {
    fn key(&self) -> &str {
        self.0.key()
    }
}


struct HubState<T> {
    history: Vec<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

struct Hub<T> {
    state: Mutex<HubState<T>>,
}

impl<T> Hub<T> {
    fn lock(&self) -> MutexGuard<'_, HubState<T>> {
        // No code path panics while holding the lock; recover the guard regardless.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}


/// Receiving side of a queue channel. Cloning gives another handle to the same channel.
pub struct QueueChannel<T> {
    name: Arc<str>,
    hub: Arc<Hub<T>>,
}

impl<T> Clone for QueueChannel<T> {
    fn clone(&self) -> Self {
        QueueChannel {
            name: self.name.clone(),
            hub: self.hub.clone(),
        }
    }
}

/// The single producer of a queue channel.
pub struct Emitter<T> {
    name: Arc<str>,
    hub: Arc<Hub<T>>,
}

impl<T: Clone + Send + 'static> QueueChannel<T> {
    /// Creates an open channel and its only emitter.
    pub fn new(name: impl Into<String>) -> (Emitter<T>, QueueChannel<T>) {
        let name: Arc<str> = Arc::from(name.into());
        let hub = Arc::new(Hub {
            state: Mutex::new(HubState {
                history: Vec::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        });
        (
            Emitter { name: name.clone(), hub: hub.clone() },
            QueueChannel { name, hub },
        )
    }

    /// Creates an already closed channel holding `items`.
    pub fn from_items(name: impl Into<String>, items: impl IntoIterator<Item = T>) -> Result<QueueChannel<T>, PipelineError> {
        let (tx, channel) = QueueChannel::new(name);
        for item in items {
            tx.emit(item)?;
        }
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a new subscriber. It receives everything emitted so far, then every
    /// later emission, and ends when the channel closes.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.lock();
        for item in &state.history {
            // The receiver is held locally, the send cannot fail.
            let _ = tx.send(item.clone());
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        Subscription {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Number of tuples emitted so far.
    pub fn emitted(&self) -> usize {
        self.hub.lock().history.len()
    }

    pub fn is_closed(&self) -> bool {
        self.hub.lock().closed
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Delivers `item` to every current subscriber and records it for late ones.
    pub fn emit(&self, item: T) -> Result<(), PipelineError> {
        let mut state = self.hub.lock();
        if state.closed {
            return Err(PipelineError::ChannelClosed(self.name.to_string()));
        }
        state.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        state.history.push(item);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Drop for Emitter<T> {
    fn drop(&mut self) {
        let mut state = self.hub.lock();
        state.closed = true;
        state.subscribers.clear();
        debug!("Channel {} closed after {} emissions", self.name, state.history.len());
    }
}


/// One subscriber's view of a queue channel.
pub struct Subscription<T> {
    inner: UnboundedReceiverStream<T>,
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}


/// Single-emission channel replayed to every reader.
pub struct ValueChannel<T> {
    name: Arc<str>,
    rx: watch::Receiver<Option<T>>,
}

impl<T> Clone for ValueChannel<T> {
    fn clone(&self) -> Self {
        ValueChannel {
            name: self.name.clone(),
            rx: self.rx.clone(),
        }
    }
}

/// Write side of a pending value channel. `set` consumes it, so a value is emitted at most once.
pub struct ValueSetter<T> {
    name: Arc<str>,
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> ValueChannel<T> {
    /// A channel already holding its value.
    pub fn of(name: impl Into<String>, value: T) -> ValueChannel<T> {
        let (_tx, rx) = watch::channel(Some(value));
        ValueChannel {
            name: Arc::from(name.into()),
            rx,
        }
    }

    /// A channel whose value is produced later by the returned setter.
    pub fn pending(name: impl Into<String>) -> (ValueSetter<T>, ValueChannel<T>) {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = watch::channel(None);
        (
            ValueSetter { name: name.clone(), tx },
            ValueChannel { name, rx },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the value. Fails if the setter was dropped without emitting.
    pub async fn get(&self) -> Result<T, PipelineError> {
        let mut rx = self.rx.clone();
        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| PipelineError::ChannelClosed(self.name.to_string()))?;
        value
            .clone()
            .ok_or_else(|| PipelineError::ChannelClosed(self.name.to_string()))
    }

    /// The value if it has been emitted, without waiting.
    pub fn try_get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

impl<T> ValueSetter<T> {
    pub fn set(self, value: T) {
        debug!("Value channel {} resolved", self.name);
        self.tx.send_replace(Some(value));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_queue_broadcasts_to_every_subscriber() -> Result<(), PipelineError> {
        let (tx, channel) = QueueChannel::new("reads");
        let mut early = channel.subscribe();
        tx.emit(1u32)?;
        tx.emit(2u32)?;
        let mut late = channel.subscribe();
        tx.emit(3u32)?;
        drop(tx);

        let early: Vec<u32> = early.by_ref().collect().await;
        let late: Vec<u32> = late.by_ref().collect().await;
        assert_eq!(early, vec![1, 2, 3]);
        assert_eq!(late, vec![1, 2, 3], "late subscriber must be replayed the history");

        let after_close: Vec<u32> = channel.subscribe().collect().await;
        assert_eq!(after_close, vec![1, 2, 3]);
        assert!(channel.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_value_channel_replays_single_value() -> Result<(), PipelineError> {
        let (setter, value) = ValueChannel::<String>::pending("index");
        assert!(value.try_get().is_none());
        let reader = value.clone();
        let waiter = tokio::spawn(async move { reader.get().await });
        setter.set("host.idx".to_string());
        assert_eq!(waiter.await??, "host.idx");
        assert_eq!(value.get().await?, "host.idx");
        assert_eq!(value.get().await?, "host.idx");
        Ok(())
    }

    #[tokio::test]
    async fn test_value_channel_dropped_setter_is_error() {
        let (setter, value) = ValueChannel::<u32>::pending("junctions");
        drop(setter);
        assert!(matches!(value.get().await, Err(PipelineError::ChannelClosed(_))));
    }
}
