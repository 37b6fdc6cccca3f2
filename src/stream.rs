//! Change event dispatch.
//!
//! The [`ChangeDispatcher`] owns the subscriber set and at most one live
//! change stream. The stream is replaced on every reconnect while the
//! subscribers stay registered, so callbacks keep receiving events across
//! connection generations.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::{driver::ChangeStream, error::Error, event::ChangeEvent};

/// Type alias for a callback function that processes change events.
///
/// Callbacks are async functions that take a [`ChangeEvent`] reference and
/// return nothing. They are awaited one after another, so a slow callback
/// delays delivery of later events.
type CallbackFn = dyn Fn(&ChangeEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

type Subscribers = Arc<RwLock<Vec<(SubscriptionId, Arc<CallbackFn>)>>>;

/// Invoked with any error the change stream yields.
pub(crate) type StreamErrorHook = Arc<dyn Fn(Error) + Send + Sync>;

/// Identifies a registered callback so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A running relay task and the means to stop it.
struct ActiveStream {
    generation: u64,
    close_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ActiveStream {
    /// Signals the relay to stop and waits until the stream has been dropped.
    async fn close(self) {
        // The relay may already have exited on its own
        let _ = self.close_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(generation = self.generation, error = %e, "Change stream relay task failed");
        }
    }
}

/// Broadcasts change events to every registered subscriber.
pub struct ChangeDispatcher {
    subscribers: Subscribers,
    active: Mutex<Option<ActiveStream>>,
    /// Set once the owning client is destroyed; no stream is armed after that.
    shut_down: AtomicBool,
    next_id: AtomicU64,
}

impl ChangeDispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            active: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a callback for every change event.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let id = dispatcher.subscribe(|event| {
    ///     let event = event.clone();
    ///     Box::pin(async move {
    ///         tracing::info!(?event, "change received");
    ///     })
    /// });
    /// ```
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + 'static + Send + Sync,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        debug!(subscription = id.0, "Subscriber registered");
        id
    }

    /// Removes a callback.
    ///
    /// Returns `false`, leaving the set untouched, if `id` is not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(registered, _)| *registered != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns the generation of the live stream, if any.
    pub async fn active_generation(&self) -> Option<u64> {
        self.active.lock().await.as_ref().map(|active| active.generation)
    }

    /// Starts relaying `stream` to the subscribers.
    ///
    /// Any previous stream is closed first. Returns `false` without touching
    /// `stream` beyond dropping it if the dispatcher has been shut down.
    pub(crate) async fn arm(&self, stream: ChangeStream, generation: u64, on_error: StreamErrorHook) -> bool {
        let mut active = self.active.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            debug!(generation, "Dispatcher shut down, change stream not armed");
            return false;
        }
        if let Some(previous) = active.take() {
            previous.close().await;
        }

        // Create a channel to signal stream closure
        let (close_tx, close_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(relay(stream, close_rx, Arc::clone(&self.subscribers), on_error, generation));
        *active = Some(ActiveStream {
            generation,
            close_tx,
            task,
        });
        info!(generation, "Change stream armed");
        true
    }

    /// Closes the live stream, if any, and waits for it to be dropped.
    ///
    /// With `terminal` set, the dispatcher refuses every later [`arm`](Self::arm).
    /// Returns whether a stream was closed.
    pub(crate) async fn close(&self, terminal: bool) -> bool {
        let mut active = self.active.lock().await;
        if terminal {
            self.shut_down.store(true, Ordering::Release);
        }
        match active.take() {
            Some(stream) => {
                debug!(generation = stream.generation, "Closing change stream");
                stream.close().await;
                true
            }
            None => false,
        }
    }

    /// Refuses later streams and aborts the relay, if it can be reached
    /// without waiting.
    pub(crate) fn abort(&self) {
        self.shut_down.store(true, Ordering::Release);
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(stream) = active.take() {
                stream.task.abort();
            }
        }
    }
}

impl Default for ChangeDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn relay(
    mut stream: ChangeStream,
    mut close_rx: mpsc::Receiver<()>,
    subscribers: Subscribers,
    on_error: StreamErrorHook,
    generation: u64,
) {
    loop {
        tokio::select! {
            _ = close_rx.recv() => {
                debug!(generation, "Change stream relay stopping");
                break;
            }
            next_event = stream.next() => {
                match next_event {
                    Some(Ok(event)) => deliver(&subscribers, &event).await,
                    Some(Err(e)) => {
                        warn!(generation, error = %e, "Error in change stream");
                        on_error(e);
                        break;
                    }
                    None => {
                        info!(generation, "Change stream has ended");
                        break;
                    }
                }
            }
        }
    }
}

/// Hands `event` to a snapshot of the subscribers taken now, in registration order.
async fn deliver(subscribers: &Subscribers, event: &ChangeEvent) {
    let callbacks: Vec<Arc<CallbackFn>> = subscribers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, callback)| Arc::clone(callback))
        .collect();
    for callback in callbacks {
        callback(event).await;
    }
}
