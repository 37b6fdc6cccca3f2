use std::{fmt, future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use crate::{
    config::{ClientConfig, ClientSettings, RetryOptions},
    driver::Connector,
    error::Error,
    event::ChangeEvent,
    handle::CollectionHandle,
    manager::{ConnectionManager, ConnectionState, ErrorSink},
    mongo::MongoConnector,
    operation::AllowList,
    stream::{ChangeDispatcher, SubscriptionId},
};

/// Builder for constructing a [`ResilientClient`].
///
/// Use this to configure change watching, retry/backoff, driver settings and
/// extra operations.
pub struct ResilientClientBuilder {
    url: String,
    on_error: ErrorSink,
    watch: bool,
    retry: RetryOptions,
    settings: ClientSettings,
    to_wrap: Vec<String>,
    connector: Option<Arc<dyn Connector>>,
}

impl ResilientClientBuilder {
    /// Creates a builder with default settings.
    ///
    /// `on_error` receives every failure that has no caller to return to:
    /// connect failures, reconnect failures and change stream errors.
    #[must_use]
    pub fn new<F>(url: impl Into<String>, on_error: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        Self {
            url: url.into(),
            on_error: Arc::new(on_error),
            watch: true,
            retry: RetryOptions::default(),
            settings: ClientSettings::default(),
            to_wrap: Vec::new(),
            connector: None,
        }
    }

    /// Creates a builder from a deserialized [`ClientConfig`].
    #[must_use]
    pub fn from_config<F>(config: ClientConfig, on_error: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        Self::new(config.url, on_error)
            .watch(config.watch)
            .retry_options(config.retry)
            .client_settings(config.client)
            .to_wrap(config.to_wrap)
    }

    /// Enable or disable change stream dispatch. Enabled by default.
    #[must_use]
    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Set the backoff policy for establishing connections.
    #[must_use]
    pub fn retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Set driver settings applied over the options parsed from the URL.
    ///
    /// Ignored when a custom [`connector`](Self::connector) is set.
    #[must_use]
    pub fn client_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Enable operations on top of the defaults, by name.
    #[must_use]
    pub fn to_wrap<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to_wrap.extend(names.into_iter().map(Into::into));
        self
    }

    /// Use `connector` instead of the MongoDB driver.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Build the [`ResilientClient`] and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] - if the URL is empty.
    /// * [`Error::UnknownOperation`] - if a `to_wrap` name is not a known operation.
    pub fn build(self) -> Result<ResilientClient, Error> {
        if self.url.trim().is_empty() {
            return Err(Error::Config("url must not be empty".into()));
        }
        let allowed = Arc::new(AllowList::with_extensions(&self.to_wrap)?);
        debug!(
            watch = self.watch,
            retries = self.retry.retries,
            max_timeout_ms = self.retry.max_timeout_ms,
            operations = allowed.len(),
            "Building resilient client"
        );

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(MongoConnector::new(self.url, self.settings)),
        };
        let dispatcher = Arc::new(ChangeDispatcher::new());
        let manager = ConnectionManager::start(
            connector,
            self.retry,
            self.on_error,
            self.watch,
            Arc::clone(&dispatcher),
        );

        Ok(ResilientClient {
            manager,
            dispatcher,
            allowed,
        })
    }
}

/// A MongoDB client that keeps itself connected.
///
/// Connecting starts when the client is built. Operations wait for the
/// current connection attempt; failures caused by connection loss trigger a
/// reconnect in the background while still being returned to the caller.
pub struct ResilientClient {
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<ChangeDispatcher>,
    allowed: Arc<AllowList>,
}

impl ResilientClient {
    #[must_use]
    pub fn builder<F>(url: impl Into<String>, on_error: F) -> ResilientClientBuilder
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        ResilientClientBuilder::new(url, on_error)
    }

    /// Returns a handle to `collection` in `database`.
    ///
    /// Waits for any connect or reconnect in flight. Returns `Ok(None)` once
    /// the client is destroyed.
    ///
    /// # Arguments
    ///
    /// * `database` - The name of the database.
    /// * `collection` - The name of the collection within `database`.
    ///
    /// # Errors
    ///
    /// * [`Error::Unavailable`] - if the last connect sequence failed. A
    ///   reconnect is requested before returning.
    pub async fn operation_handle(&self, database: &str, collection: &str) -> Result<Option<CollectionHandle>, Error> {
        if self.manager.is_destroyed() {
            return Ok(None);
        }
        match self.manager.connection().await {
            Some(live) => Ok(Some(CollectionHandle::new(
                database,
                collection,
                live.connection.collection(database, collection),
                live.generation,
                Arc::clone(&self.allowed),
                Arc::clone(&self.manager),
            ))),
            None if self.manager.is_destroyed() => Ok(None),
            None => {
                warn!(database, collection, "No connection available, requesting reconnect");
                self.manager.request_reconnect(self.manager.generation());
                Err(Error::Unavailable)
            }
        }
    }

    /// Permanently shuts the client down.
    ///
    /// Closes the change stream, then the connection. Operations already in
    /// flight are not cancelled. Calling this again has no effect. A failure
    /// while closing is reported to the error sink.
    ///
    /// Dropping the client without calling this schedules the same shutdown
    /// on the current tokio runtime, without a way to wait for it.
    pub async fn destroy(&self) {
        if let Err(e) = self.manager.destroy(true).await {
            warn!(error = %e, "Failed to close connection");
            self.manager.report(&e);
        }
    }

    /// Returns `true` once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.manager.is_destroyed()
    }

    /// Reports the lifecycle state without waiting on any connection attempt.
    ///
    /// # Returns
    ///
    /// [`ConnectionState::Destroyed`] after destruction, otherwise
    /// [`ConnectionState::Reconnecting`] while a reconnect cycle runs, or the
    /// outcome of the current connection attempt.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Registers a callback for every change event, across reconnects.
    ///
    /// # Arguments
    ///
    /// * `callback` - The async function to call for each change event.
    ///
    /// # Returns
    ///
    /// The id to pass to [`unsubscribe`](Self::unsubscribe).
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let id = client.subscribe(|event| {
    ///     let event = event.clone();
    ///     Box::pin(async move {
    ///         println!("{} on {:?}", event.operation.event_type_str(), event.collection);
    ///     })
    /// });
    /// ```
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + 'static + Send + Sync,
    {
        self.dispatcher.subscribe(callback)
    }

    /// Removes a callback.
    ///
    /// # Arguments
    ///
    /// * `id` - The id returned by [`subscribe`](Self::subscribe).
    ///
    /// # Returns
    ///
    /// `false`, leaving the subscribers untouched, if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Returns the number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.dispatcher.subscriber_count()
    }

    /// The allow-listed operations.
    pub fn operations(&self) -> &AllowList {
        &self.allowed
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        if self.manager.is_destroyed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Client dropped without destroy, shutting down in the background");
                let manager = Arc::clone(&self.manager);
                runtime.spawn(async move {
                    if let Err(e) = manager.destroy(true).await {
                        warn!(error = %e, "Failed to close connection");
                        manager.report(&e);
                    }
                });
            }
            Err(_) => {
                warn!("Client dropped outside a tokio runtime, stopping change stream only");
                self.manager.abandon();
            }
        }
    }
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .field("operations", &self.allowed)
            .finish()
    }
}
