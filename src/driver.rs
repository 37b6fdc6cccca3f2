//! The seam between the lifecycle core and a database driver.
//!
//! [`crate::mongo`] implements these traits on the MongoDB driver. Other
//! implementations (an in-process fake in tests, a proxy) plug in through
//! [`crate::ResilientClientBuilder::connector`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use mongodb::{
    bson::{Bson, Document},
    options::{
        AggregateOptions, CountOptions, DeleteOptions, DistinctOptions, EstimatedDocumentCountOptions,
        FindOneAndDeleteOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions,
        InsertManyOptions, InsertOneOptions, ReplaceOptions, UpdateModifications, UpdateOptions,
    },
};

use crate::{
    error::Error,
    event::ChangeEvent,
    model::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, WriteModel},
};

/// A live feed of change events bound to one connection.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, Error>>;

/// Creates and opens fresh connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Creates a new low-level connection object and opens it.
    async fn connect(&self) -> Result<Arc<dyn Connection>, Error>;
}

/// An established connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn collection(&self, database: &str, collection: &str) -> Arc<dyn CollectionOps>;

    /// Opens a change stream over the whole deployment.
    async fn watch(&self) -> Result<ChangeStream, Error>;

    /// Shuts the connection down, waiting for in-use resources to be released.
    async fn close(&self) -> Result<(), Error>;
}

/// Driver operations on a single collection.
#[async_trait]
pub trait CollectionOps: Send + Sync {
    async fn count_documents(&self, filter: Document, options: Option<CountOptions>) -> Result<u64, Error>;

    async fn estimated_document_count(&self, options: Option<EstimatedDocumentCountOptions>) -> Result<u64, Error>;

    async fn find(&self, filter: Document, options: Option<FindOptions>) -> Result<Vec<Document>, Error>;

    async fn find_one(&self, filter: Document, options: Option<FindOneOptions>) -> Result<Option<Document>, Error>;

    async fn insert_one(&self, document: Document, options: Option<InsertOneOptions>)
        -> Result<InsertOneResult, Error>;

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: Option<InsertManyOptions>,
    ) -> Result<InsertManyResult, Error>;

    async fn update_one(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: Option<UpdateOptions>,
    ) -> Result<UpdateResult, Error>;

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: Option<UpdateOptions>,
    ) -> Result<UpdateResult, Error>;

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: Option<ReplaceOptions>,
    ) -> Result<UpdateResult, Error>;

    async fn delete_one(&self, filter: Document, options: Option<DeleteOptions>) -> Result<DeleteResult, Error>;

    async fn delete_many(&self, filter: Document, options: Option<DeleteOptions>) -> Result<DeleteResult, Error>;

    async fn bulk_write(&self, models: Vec<WriteModel>) -> Result<BulkWriteResult, Error>;

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
    ) -> Result<Vec<Document>, Error>;

    async fn distinct(
        &self,
        field_name: String,
        filter: Document,
        options: Option<DistinctOptions>,
    ) -> Result<Vec<Bson>, Error>;

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: Option<FindOneAndUpdateOptions>,
    ) -> Result<Option<Document>, Error>;

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: Option<FindOneAndReplaceOptions>,
    ) -> Result<Option<Document>, Error>;

    async fn find_one_and_delete(
        &self,
        filter: Document,
        options: Option<FindOneAndDeleteOptions>,
    ) -> Result<Option<Document>, Error>;
}
