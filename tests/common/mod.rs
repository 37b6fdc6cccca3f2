#![allow(dead_code)]

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use rs_mongo_resilient::{
    mongodb::{
        bson::{doc, Bson, Document},
        options::{
            AggregateOptions, CountOptions, DeleteOptions, DistinctOptions, EstimatedDocumentCountOptions,
            FindOneAndDeleteOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions,
            InsertManyOptions, InsertOneOptions, ReplaceOptions, UpdateModifications, UpdateOptions,
        },
    },
    BulkWriteResult, ChangeEvent, ChangeStream, CollectionOps, Connection, Connector, DeleteResult, Error,
    InsertManyResult, InsertOneResult, ResilientClient, ResilientClientBuilder, RetryOptions, UpdateResult,
    WriteModel,
};

pub const TOPOLOGY_DESTROYED: &str = "Topology was destroyed";
pub const TOPOLOGY_CLOSED: &str = "Topology is closed, please connect";

type Feed = mpsc::UnboundedSender<Result<ChangeEvent, Error>>;

#[derive(Default)]
struct Script {
    connect_failures: Mutex<VecDeque<Error>>,
    watch_failures: Mutex<VecDeque<Error>>,
    stream_failures: Mutex<VecDeque<Error>>,
    op_failures: Mutex<VecDeque<Error>>,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    documents: Mutex<Vec<Document>>,
}

/// An in-process stand-in for a MongoDB deployment.
///
/// Cloning yields another control handle on the same deployment.
#[derive(Clone, Default)]
pub struct FakeDriver {
    script: Arc<Script>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            script: Arc::clone(&self.script),
        }
    }

    /// The next connect attempts fail with `errors`, in order.
    pub fn fail_connects(&self, errors: impl IntoIterator<Item = Error>) {
        self.script.connect_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_watches(&self, errors: impl IntoIterator<Item = Error>) {
        self.script.watch_failures.lock().unwrap().extend(errors);
    }

    /// The next change streams opened yield one of `errors` as their first item.
    pub fn break_next_streams(&self, errors: impl IntoIterator<Item = Error>) {
        self.script.stream_failures.lock().unwrap().extend(errors);
    }

    /// The next collection operations fail with `errors`, in order.
    pub fn fail_ops(&self, errors: impl IntoIterator<Item = Error>) {
        self.script.op_failures.lock().unwrap().extend(errors);
    }

    pub fn delay_connects(&self, delay: Duration) {
        *self.script.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn connect_attempts(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    /// Connections that opened successfully, oldest first.
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.script.connections.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Arc<FakeConnection> {
        self.connections().last().cloned().expect("no connection opened yet")
    }
}

pub struct FakeConnector {
    script: Arc<Script>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, Error> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.script.connect_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let mut connections = self.script.connections.lock().unwrap();
        let connection = Arc::new(FakeConnection {
            generation: connections.len() + 1,
            script: Arc::clone(&self.script),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            stream_open_at_close: AtomicBool::new(false),
            feed: Mutex::new(None),
        });
        connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct FakeConnection {
    pub generation: usize,
    script: Arc<Script>,
    closed: AtomicBool,
    closes: AtomicUsize,
    watches: AtomicUsize,
    stream_open_at_close: AtomicBool,
    feed: Mutex<Option<Feed>>,
}

impl FakeConnection {
    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the change stream was still being consumed when `close` ran.
    pub fn stream_open_at_close(&self) -> bool {
        self.stream_open_at_close.load(Ordering::SeqCst)
    }

    /// Whether a change stream is open and its consumer still alive.
    pub fn has_live_stream(&self) -> bool {
        self.feed.lock().unwrap().as_ref().is_some_and(|feed| !feed.is_closed())
    }

    /// Pushes an event into this connection's change stream.
    pub fn emit(&self, event: ChangeEvent) {
        let feed = self.feed.lock().unwrap();
        feed.as_ref()
            .expect("no change stream open")
            .unbounded_send(Ok(event))
            .expect("change stream consumer gone");
    }

    /// Makes this connection's change stream yield `error`.
    pub fn break_stream(&self, error: Error) {
        let feed = self.feed.lock().unwrap();
        feed.as_ref()
            .expect("no change stream open")
            .unbounded_send(Err(error))
            .expect("change stream consumer gone");
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn collection(&self, _database: &str, _collection: &str) -> Arc<dyn CollectionOps> {
        Arc::new(FakeCollection {
            script: Arc::clone(&self.script),
            generation: self.generation,
        })
    }

    async fn watch(&self) -> Result<ChangeStream, Error> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.script.watch_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded();
        if let Some(e) = self.script.stream_failures.lock().unwrap().pop_front() {
            tx.unbounded_send(Err(e)).expect("receiver is held here");
        }
        *self.feed.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.stream_open_at_close.store(self.has_live_stream(), Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Collection backed by one document list shared by every connection.
pub struct FakeCollection {
    script: Arc<Script>,
    generation: usize,
}

impl FakeCollection {
    fn check(&self) -> Result<(), Error> {
        if let Some(e) = self.script.op_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let closed = self.script.connections.lock().unwrap()[self.generation - 1].is_closed();
        if closed {
            return Err(Error::Database(TOPOLOGY_CLOSED.into()));
        }
        Ok(())
    }

    fn documents(&self) -> Vec<Document> {
        self.script.documents.lock().unwrap().clone()
    }

    fn insert(&self, document: Document) -> Bson {
        let mut documents = self.script.documents.lock().unwrap();
        let id = Bson::Int64(documents.len() as i64 + 1);
        let mut document = document;
        document.insert("_id", id.clone());
        documents.push(document);
        id
    }
}

#[async_trait]
impl CollectionOps for FakeCollection {
    async fn count_documents(&self, _filter: Document, _options: Option<CountOptions>) -> Result<u64, Error> {
        self.check()?;
        Ok(self.documents().len() as u64)
    }

    async fn estimated_document_count(&self, _options: Option<EstimatedDocumentCountOptions>) -> Result<u64, Error> {
        self.check()?;
        Ok(self.documents().len() as u64)
    }

    async fn find(&self, _filter: Document, _options: Option<FindOptions>) -> Result<Vec<Document>, Error> {
        self.check()?;
        Ok(self.documents())
    }

    async fn find_one(&self, _filter: Document, _options: Option<FindOneOptions>) -> Result<Option<Document>, Error> {
        self.check()?;
        Ok(self.documents().into_iter().next())
    }

    async fn insert_one(
        &self,
        document: Document,
        _options: Option<InsertOneOptions>,
    ) -> Result<InsertOneResult, Error> {
        self.check()?;
        Ok(InsertOneResult {
            inserted_id: self.insert(document),
        })
    }

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        _options: Option<InsertManyOptions>,
    ) -> Result<InsertManyResult, Error> {
        self.check()?;
        let inserted_ids = documents
            .into_iter()
            .enumerate()
            .map(|(index, document)| (index, self.insert(document)))
            .collect();
        Ok(InsertManyResult { inserted_ids })
    }

    async fn update_one(
        &self,
        _filter: Document,
        _update: UpdateModifications,
        _options: Option<UpdateOptions>,
    ) -> Result<UpdateResult, Error> {
        self.check()?;
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: 1,
            upserted_id: None,
        })
    }

    async fn update_many(
        &self,
        _filter: Document,
        _update: UpdateModifications,
        _options: Option<UpdateOptions>,
    ) -> Result<UpdateResult, Error> {
        self.check()?;
        let count = self.documents().len() as u64;
        Ok(UpdateResult {
            matched_count: count,
            modified_count: count,
            upserted_id: None,
        })
    }

    async fn replace_one(
        &self,
        _filter: Document,
        _replacement: Document,
        _options: Option<ReplaceOptions>,
    ) -> Result<UpdateResult, Error> {
        self.check()?;
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: 1,
            upserted_id: None,
        })
    }

    async fn delete_one(&self, _filter: Document, _options: Option<DeleteOptions>) -> Result<DeleteResult, Error> {
        self.check()?;
        let mut documents = self.script.documents.lock().unwrap();
        let deleted_count = if documents.is_empty() { 0 } else { 1 };
        let keep = documents.len().saturating_sub(1);
        documents.truncate(keep);
        Ok(DeleteResult { deleted_count })
    }

    async fn delete_many(&self, _filter: Document, _options: Option<DeleteOptions>) -> Result<DeleteResult, Error> {
        self.check()?;
        let mut documents = self.script.documents.lock().unwrap();
        let deleted_count = documents.len() as u64;
        documents.clear();
        Ok(DeleteResult { deleted_count })
    }

    async fn bulk_write(&self, models: Vec<WriteModel>) -> Result<BulkWriteResult, Error> {
        self.check()?;
        let mut result = BulkWriteResult::default();
        for (index, model) in models.into_iter().enumerate() {
            match model {
                WriteModel::InsertOne { document } => {
                    let inserted_id = self.insert(document);
                    result.record_insert(index, InsertOneResult { inserted_id });
                }
                WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => {
                    result.record_delete(DeleteResult { deleted_count: 1 });
                }
                _ => result.record_update(
                    index,
                    UpdateResult {
                        matched_count: 1,
                        modified_count: 1,
                        upserted_id: None,
                    },
                ),
            }
        }
        Ok(result)
    }

    async fn aggregate(
        &self,
        _pipeline: Vec<Document>,
        _options: Option<AggregateOptions>,
    ) -> Result<Vec<Document>, Error> {
        self.check()?;
        Ok(vec![doc! { "count": self.documents().len() as i64 }])
    }

    async fn distinct(
        &self,
        field_name: String,
        _filter: Document,
        _options: Option<DistinctOptions>,
    ) -> Result<Vec<Bson>, Error> {
        self.check()?;
        let mut values: Vec<Bson> = Vec::new();
        for document in self.documents() {
            if let Some(value) = document.get(&field_name) {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }

    async fn find_one_and_update(
        &self,
        _filter: Document,
        _update: UpdateModifications,
        _options: Option<FindOneAndUpdateOptions>,
    ) -> Result<Option<Document>, Error> {
        self.check()?;
        Ok(self.documents().into_iter().next())
    }

    async fn find_one_and_replace(
        &self,
        _filter: Document,
        _replacement: Document,
        _options: Option<FindOneAndReplaceOptions>,
    ) -> Result<Option<Document>, Error> {
        self.check()?;
        Ok(self.documents().into_iter().next())
    }

    async fn find_one_and_delete(
        &self,
        _filter: Document,
        _options: Option<FindOneAndDeleteOptions>,
    ) -> Result<Option<Document>, Error> {
        self.check()?;
        let mut documents = self.script.documents.lock().unwrap();
        Ok(if documents.is_empty() { None } else { Some(documents.remove(0)) })
    }
}

/// Collects the messages of every error handed to the sink.
#[derive(Clone, Default)]
pub struct ErrorLog {
    errors: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    pub fn sink(&self) -> impl Fn(&Error) + Send + Sync + 'static {
        let errors = Arc::clone(&self.errors);
        move |e: &Error| errors.lock().unwrap().push(e.to_string())
    }

    pub fn count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

pub fn fast_retry() -> RetryOptions {
    RetryOptions::new(100, Duration::from_millis(40)).min_timeout(Duration::from_millis(10))
}

/// A builder wired to `driver` with short backoff.
pub fn builder(driver: &FakeDriver, log: &ErrorLog) -> ResilientClientBuilder {
    ResilientClient::builder("mongodb://fake:27017", log.sink())
        .connector(driver.connector())
        .retry_options(fast_retry())
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Lets spawned tasks run for a while without expecting anything.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Awaits `future`, failing the test after five seconds.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Subscribes a callback that forwards every event into a channel.
pub fn record_events(
    client: &ResilientClient,
) -> (
    rs_mongo_resilient::SubscriptionId,
    tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let id = client.subscribe(move |event| {
        let tx = tx.clone();
        let event = event.clone();
        Box::pin(async move {
            let _ = tx.send(event);
        })
    });
    (id, rx)
}

pub async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    within(rx.recv()).await.expect("subscriber channel closed")
}
