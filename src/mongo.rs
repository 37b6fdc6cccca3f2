//! The driver seam implemented on the MongoDB driver.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::{
    bson::{doc, Bson, Document},
    options::{
        AggregateOptions, ClientOptions, CountOptions, DeleteOptions, DistinctOptions, EstimatedDocumentCountOptions,
        FindOneAndDeleteOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions,
        InsertManyOptions, InsertOneOptions, ReplaceOptions, UpdateModifications, UpdateOptions,
    },
    Client, Collection,
};
use tracing::debug;

use crate::{
    config::ClientSettings,
    driver::{ChangeStream, CollectionOps, Connection, Connector},
    error::Error,
    event::ChangeEvent,
    model::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, WriteModel},
};

/// Opens MongoDB clients for one connection string.
#[derive(Debug, Clone)]
pub struct MongoConnector {
    url: String,
    settings: ClientSettings,
}

impl MongoConnector {
    pub fn new(url: impl Into<String>, settings: ClientSettings) -> Self {
        Self {
            url: url.into(),
            settings,
        }
    }
}

#[async_trait]
impl Connector for MongoConnector {
    /// Builds a new client and pings the deployment, so a success means a
    /// server was actually selected.
    async fn connect(&self) -> Result<Arc<dyn Connection>, Error> {
        let mut options = ClientOptions::parse(&self.url).await?;
        self.settings.apply(&mut options);
        let client = Client::with_options(options)?;
        client.database("admin").run_command(doc! { "ping": 1 }, None).await?;
        debug!("MongoDB ping succeeded");
        Ok(Arc::new(MongoConnection { client }))
    }
}

pub struct MongoConnection {
    client: Client,
}

impl MongoConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Connection for MongoConnection {
    fn collection(&self, database: &str, collection: &str) -> Arc<dyn CollectionOps> {
        Arc::new(MongoCollection {
            inner: self.client.database(database).collection::<Document>(collection),
        })
    }

    async fn watch(&self) -> Result<ChangeStream, Error> {
        let stream = self.client.watch(None, None).await?;
        Ok(stream
            .map(|event| event.map(ChangeEvent::from).map_err(Error::from))
            .boxed())
    }

    async fn close(&self) -> Result<(), Error> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

pub struct MongoCollection {
    inner: Collection<Document>,
}

#[async_trait]
impl CollectionOps for MongoCollection {
    async fn count_documents(&self, filter: Document, options: Option<CountOptions>) -> Result<u64, Error> {
        Ok(self.inner.count_documents(filter, options).await?)
    }

    async fn estimated_document_count(&self, options: Option<EstimatedDocumentCountOptions>) -> Result<u64, Error> {
        Ok(self.inner.estimated_document_count(options).await?)
    }

    async fn find(&self, filter: Document, options: Option<FindOptions>) -> Result<Vec<Document>, Error> {
        let cursor = self.inner.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_one(&self, filter: Document, options: Option<FindOneOptions>) -> Result<Option<Document>, Error> {
        Ok(self.inner.find_one(filter, options).await?)
    }

    async fn insert_one(
        &self,
        document: Document,
        options: Option<InsertOneOptions>,
    ) -> Result<InsertOneResult, Error> {
        Ok(self.inner.insert_one(document, options).await?.into())
    }

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: Option<InsertManyOptions>,
    ) -> Result<InsertManyResult, Error> {
        Ok(self.inner.insert_many(documents, options).await?.into())
    }

    async fn update_one(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: Option<UpdateOptions>,
    ) -> Result<UpdateResult, Error> {
        Ok(self.inner.update_one(filter, update, options).await?.into())
    }

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: Option<UpdateOptions>,
    ) -> Result<UpdateResult, Error> {
        Ok(self.inner.update_many(filter, update, options).await?.into())
    }

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: Option<ReplaceOptions>,
    ) -> Result<UpdateResult, Error> {
        Ok(self.inner.replace_one(filter, replacement, options).await?.into())
    }

    async fn delete_one(&self, filter: Document, options: Option<DeleteOptions>) -> Result<DeleteResult, Error> {
        Ok(self.inner.delete_one(filter, options).await?.into())
    }

    async fn delete_many(&self, filter: Document, options: Option<DeleteOptions>) -> Result<DeleteResult, Error> {
        Ok(self.inner.delete_many(filter, options).await?.into())
    }

    async fn bulk_write(&self, models: Vec<WriteModel>) -> Result<BulkWriteResult, Error> {
        let mut result = BulkWriteResult::default();
        for (index, model) in models.into_iter().enumerate() {
            match model {
                WriteModel::InsertOne { document } => {
                    let inserted = self.inner.insert_one(document, None).await?;
                    result.record_insert(index, inserted.into());
                }
                WriteModel::UpdateOne { filter, update, upsert } => {
                    let updated = self.inner.update_one(filter, update, upsert_options(upsert)).await?;
                    result.record_update(index, updated.into());
                }
                WriteModel::UpdateMany { filter, update, upsert } => {
                    let updated = self.inner.update_many(filter, update, upsert_options(upsert)).await?;
                    result.record_update(index, updated.into());
                }
                WriteModel::ReplaceOne {
                    filter,
                    replacement,
                    upsert,
                } => {
                    let mut options = ReplaceOptions::default();
                    options.upsert = upsert;
                    let replaced = self.inner.replace_one(filter, replacement, options).await?;
                    result.record_update(index, replaced.into());
                }
                WriteModel::DeleteOne { filter } => {
                    let deleted = self.inner.delete_one(filter, None).await?;
                    result.record_delete(deleted.into());
                }
                WriteModel::DeleteMany { filter } => {
                    let deleted = self.inner.delete_many(filter, None).await?;
                    result.record_delete(deleted.into());
                }
            }
        }
        Ok(result)
    }

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: Option<AggregateOptions>,
    ) -> Result<Vec<Document>, Error> {
        let cursor = self.inner.aggregate(pipeline, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn distinct(
        &self,
        field_name: String,
        filter: Document,
        options: Option<DistinctOptions>,
    ) -> Result<Vec<Bson>, Error> {
        Ok(self.inner.distinct(field_name, filter, options).await?)
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: Option<FindOneAndUpdateOptions>,
    ) -> Result<Option<Document>, Error> {
        Ok(self.inner.find_one_and_update(filter, update, options).await?)
    }

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: Option<FindOneAndReplaceOptions>,
    ) -> Result<Option<Document>, Error> {
        Ok(self.inner.find_one_and_replace(filter, replacement, options).await?)
    }

    async fn find_one_and_delete(
        &self,
        filter: Document,
        options: Option<FindOneAndDeleteOptions>,
    ) -> Result<Option<Document>, Error> {
        Ok(self.inner.find_one_and_delete(filter, options).await?)
    }
}

fn upsert_options(upsert: Option<bool>) -> UpdateOptions {
    let mut options = UpdateOptions::default();
    options.upsert = upsert;
    options
}
