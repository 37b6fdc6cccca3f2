//! Connection lifecycle.
//!
//! The [`ConnectionManager`] owns the single logical connection. It runs the
//! retrying connect sequence, replaces the connection on reconnect, arms the
//! change stream for every new connection and owns destruction.
//!
//! ```text
//! Connecting -> Connected -> Reconnecting -> Connecting -> Connected ...
//!      \            \             \
//!       +------------+-------------+--> Destroyed (terminal)
//! ```

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};

use backon::Retryable;
use futures::{
    future::{self, BoxFuture, Shared},
    FutureExt,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::RetryOptions,
    driver::{Connection, Connector},
    error::Error,
    stream::{ChangeDispatcher, StreamErrorHook},
};

/// Receives every failure the client reports outside of a caller's own result.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// The current connection attempt; resolves to `None` when no connection
/// could be established.
type ConnectionFuture = Shared<BoxFuture<'static, Option<Live>>>;

/// An open connection together with the generation that opened it.
#[derive(Clone)]
pub(crate) struct Live {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) generation: u64,
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connect sequence is running.
    Connecting,
    /// A live connection is available.
    Connected,
    /// The last connect sequence failed; no connection until a reconnect succeeds.
    Unavailable,
    /// A reconnect cycle is in progress.
    Reconnecting,
    /// The client was destroyed. Terminal.
    Destroyed,
}

pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    retry: RetryOptions,
    on_error: ErrorSink,
    watch: bool,
    dispatcher: Arc<ChangeDispatcher>,
    current: Mutex<ConnectionFuture>,
    destroyed: AtomicBool,
    cycle: Mutex<Cycle>,
    generation: AtomicU64,
}

/// Reconnect guard. At most one cycle runs while `running` is set.
#[derive(Default)]
struct Cycle {
    running: bool,
    /// Generation that was current when the running cycle started.
    from: u64,
    /// A connection opened by the running cycle already failed.
    pending: bool,
}

impl ConnectionManager {
    /// Creates the manager and starts the initial connect sequence.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn start(
        connector: Arc<dyn Connector>,
        retry: RetryOptions,
        on_error: ErrorSink,
        watch: bool,
        dispatcher: Arc<ChangeDispatcher>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            connector,
            retry,
            on_error,
            watch,
            dispatcher,
            current: Mutex::new(future::ready(None).boxed().shared()),
            destroyed: AtomicBool::new(false),
            cycle: Mutex::new(Cycle::default()),
            generation: AtomicU64::new(0),
        });
        let initial = manager.spawn_connect();
        manager.replace_current(initial);
        manager
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        if self.is_destroyed() {
            return ConnectionState::Destroyed;
        }
        if self.cycle().running {
            return ConnectionState::Reconnecting;
        }
        match self.current_future().peek() {
            None => ConnectionState::Connecting,
            Some(Some(_)) => ConnectionState::Connected,
            Some(None) => ConnectionState::Unavailable,
        }
    }

    /// Waits for the current connection attempt to settle.
    pub(crate) async fn connection(&self) -> Option<Live> {
        self.current_future().await
    }

    /// The generation of the most recently opened connection.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn report(&self, error: &Error) {
        (self.on_error)(error);
    }

    /// Asks for a reconnect cycle without waiting for it.
    ///
    /// # Arguments
    ///
    /// * `generation` - The generation of the connection that failed.
    ///
    /// # Returns
    ///
    /// `true` if a cycle was started. The request is dropped when the client
    /// is destroyed, when `generation` has already been replaced, or when a
    /// running cycle is replacing it. A failure of the connection opened by
    /// the running cycle is remembered and served once that cycle ends.
    pub(crate) fn request_reconnect(self: &Arc<Self>, generation: u64) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let current = self.generation();
        if generation < current {
            debug!(generation, current, "Connection already replaced, ignoring reconnect request");
            return false;
        }
        {
            let mut cycle = self.cycle();
            if cycle.running {
                if generation > cycle.from {
                    debug!(generation, "New connection failed during reconnect, deferring");
                    cycle.pending = true;
                } else {
                    debug!(generation, "Reconnect already in progress");
                }
                return false;
            }
            *cycle = Cycle {
                running: true,
                from: current,
                pending: false,
            };
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconnect().await });
        true
    }

    /// Tears the connection down and optionally marks the manager destroyed.
    ///
    /// The change stream, if any, is closed before the connection. A second
    /// terminal call is a no-op.
    pub(crate) async fn destroy(&self, terminal: bool) -> Result<(), Error> {
        if terminal && self.destroyed.swap(true, Ordering::AcqRel) {
            debug!("Already destroyed");
            return Ok(());
        }
        if self.watch {
            self.dispatcher.close(terminal).await;
        }
        match self.connection().await {
            Some(live) => {
                live.connection.close().await?;
                info!(terminal, "Connection closed");
            }
            None => debug!("No live connection to close"),
        }
        Ok(())
    }

    /// Marks the manager destroyed and stops the change stream relay without
    /// waiting. The connection itself is left to the driver's own drop.
    pub(crate) fn abandon(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.dispatcher.abort();
    }

    /// Runs one reconnect cycle. The cycle guard must already be held.
    async fn reconnect(self: Arc<Self>) {
        if !self.is_destroyed() {
            info!("Reconnecting");
            if let Err(e) = self.destroy(false).await {
                warn!(error = %e, "Failed to close connection before reconnecting");
                self.report(&e);
            }
            let next = self.spawn_connect();
            self.replace_current(next.clone());
            // Hold the guard until the new connection settles so failures
            // against the outgoing connection do not start another cycle.
            match next.await {
                Some(live) => info!(generation = live.generation, "Reconnected"),
                None => warn!("Reconnect did not produce a connection"),
            }
        }
        let pending = {
            let mut cycle = self.cycle();
            cycle.running = false;
            std::mem::take(&mut cycle.pending)
        };
        if pending {
            info!("Connection opened by the reconnect already failed, reconnecting again");
            self.request_reconnect(self.generation());
        }
    }

    fn spawn_connect(self: &Arc<Self>) -> ConnectionFuture {
        // The first attempt is committed here; later attempts re-check the
        // destroyed flag before connecting.
        let committed = !self.is_destroyed();
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.connect_with_retry(committed).await })
            .map(|joined| joined.ok().flatten())
            .boxed()
            .shared()
    }

    async fn connect_with_retry(self: Arc<Self>, committed: bool) -> Option<Live> {
        let mut committed = committed;
        let result = (|| self.attempt(std::mem::take(&mut committed)))
            .retry(self.retry.backoff())
            .sleep(tokio::time::sleep)
            .when(Error::is_timeout)
            .notify(|e, delay| {
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Connect attempt timed out, retrying");
            })
            .await;

        match result {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Giving up on connecting");
                None
            }
        }
    }

    /// One connect attempt. `Ok(None)` means the manager was destroyed.
    async fn attempt(self: &Arc<Self>, committed: bool) -> Result<Option<Live>, Error> {
        if !committed && self.is_destroyed() {
            return Ok(None);
        }
        self.open().await.inspect_err(|e| self.report(e))
    }

    async fn open(self: &Arc<Self>) -> Result<Option<Live>, Error> {
        let connection = self.connector.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        if self.is_destroyed() {
            debug!(generation, "Destroyed while connecting, closing new connection");
            self.discard(connection.as_ref()).await;
            return Ok(None);
        }

        if self.watch {
            let stream = match connection.watch().await {
                Ok(stream) => stream,
                Err(e) => {
                    self.discard(connection.as_ref()).await;
                    return Err(e);
                }
            };
            if !self.dispatcher.arm(stream, generation, self.stream_error_hook(generation)).await {
                self.discard(connection.as_ref()).await;
                return Ok(None);
            }
        }

        info!(generation, "Connected");
        Ok(Some(Live { connection, generation }))
    }

    async fn discard(&self, connection: &dyn Connection) {
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close discarded connection");
        }
    }

    /// Reports stream errors and reconnects on topology loss.
    fn stream_error_hook(self: &Arc<Self>, generation: u64) -> StreamErrorHook {
        let manager: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |e: Error| {
            if let Some(manager) = manager.upgrade() {
                manager.report(&e);
                if e.is_reconnectable() {
                    manager.request_reconnect(generation);
                }
            }
        })
    }

    fn cycle(&self) -> MutexGuard<'_, Cycle> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_future(&self) -> ConnectionFuture {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace_current(&self, next: ConnectionFuture) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}
