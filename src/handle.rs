//! Per-collection operation handles.

use std::{fmt, sync::Arc};

use mongodb::{
    bson::{Bson, Document},
    options::{
        AggregateOptions, CountOptions, DeleteOptions, DistinctOptions, EstimatedDocumentCountOptions,
        FindOneAndDeleteOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions,
        InsertManyOptions, InsertOneOptions, ReplaceOptions, UpdateModifications, UpdateOptions,
    },
};
use tracing::{debug, warn};

use crate::{
    driver::CollectionOps,
    error::Error,
    manager::ConnectionManager,
    model::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, WriteModel},
    operation::{AllowList, Operation},
};

/// Generates a handle method that checks the allow-list, delegates to the
/// driver and watches the outcome for connection loss.
///
/// ```ignore
/// delegate!(
///     /// Short description of the method.
///     InsertOne => fn insert_one(document: Document, options: impl Into<Option<InsertOneOptions>> + Send) -> InsertOneResult
/// );
/// ```
///
/// Every argument is passed through `Into::into`, so argument types may be
/// `impl Into<T>` of the driver's parameter type.
macro_rules! delegate {
    (
        $(#[$meta:meta])*
        $op:ident => fn $method:ident($($arg:ident: $arg_ty:ty),* $(,)?) -> $ret:ty
    ) => {
        $(#[$meta])*
        ///
        /// # Errors
        ///
        #[doc = concat!("* [`Error::NotAllowed`] - if `", stringify!($op), "` is not enabled for this client.")]
        /// * Any driver error, unchanged. Connection-loss errors additionally trigger a
        ///   background reconnect.
        pub async fn $method(&self, $($arg: $arg_ty),*) -> Result<$ret, Error> {
            self.permit(Operation::$op)?;
            let result = self.collection.$method($($arg.into()),*).await;
            self.observe(Operation::$op, result)
        }
    };
}

/// Allow-listed operations on one collection, bound to the connection that
/// was live when the handle was created.
///
/// Handles are cheap to clone. Request a fresh one after a reconnect; a handle
/// bound to a replaced connection keeps failing, without asking for another
/// reconnect, until replaced.
#[derive(Clone)]
pub struct CollectionHandle {
    database: String,
    name: String,
    collection: Arc<dyn CollectionOps>,
    generation: u64,
    allowed: Arc<AllowList>,
    manager: Arc<ConnectionManager>,
}

impl CollectionHandle {
    pub(crate) fn new(
        database: &str,
        name: &str,
        collection: Arc<dyn CollectionOps>,
        generation: u64,
        allowed: Arc<AllowList>,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            database: database.to_string(),
            name: name.to_string(),
            collection,
            generation,
            allowed,
            manager,
        }
    }

    /// Returns the name of the database this handle operates on.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the name of the collection this handle operates on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the generation of the connection this handle is bound to.
    ///
    /// Generations start at 1 and grow by one with every connection opened.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `operation` may be called on this handle.
    pub fn allows(&self, operation: Operation) -> bool {
        self.allowed.contains(operation)
    }

    /// The enabled operations, in declaration order.
    pub fn operations(&self) -> impl Iterator<Item = Operation> + '_ {
        self.allowed.iter()
    }

    fn permit(&self, operation: Operation) -> Result<(), Error> {
        if self.allows(operation) {
            Ok(())
        } else {
            Err(Error::NotAllowed(operation))
        }
    }

    fn observe<T>(&self, operation: Operation, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_reconnectable() {
                warn!(
                    operation = %operation,
                    database = %self.database,
                    collection = %self.name,
                    generation = self.generation,
                    error = %e,
                    "Operation lost the connection, requesting reconnect"
                );
                self.manager.request_reconnect(self.generation);
            } else {
                debug!(operation = %operation, error = %e, "Operation failed");
            }
        }
        result
    }

    delegate!(
        /// Counts the documents matching `filter`.
        CountDocuments => fn count_documents(
            filter: Document,
            options: impl Into<Option<CountOptions>> + Send,
        ) -> u64
    );

    delegate!(
        /// Estimates the collection size from its metadata.
        EstimatedDocumentCount => fn estimated_document_count(
            options: impl Into<Option<EstimatedDocumentCountOptions>> + Send,
        ) -> u64
    );

    delegate!(
        /// Returns every document matching `filter`.
        Find => fn find(filter: Document, options: impl Into<Option<FindOptions>> + Send) -> Vec<Document>
    );

    delegate!(
        /// Returns the first document matching `filter`, if any.
        FindOne => fn find_one(
            filter: Document,
            options: impl Into<Option<FindOneOptions>> + Send,
        ) -> Option<Document>
    );

    delegate!(
        InsertOne => fn insert_one(
            document: Document,
            options: impl Into<Option<InsertOneOptions>> + Send,
        ) -> InsertOneResult
    );

    delegate!(
        InsertMany => fn insert_many(
            documents: Vec<Document>,
            options: impl Into<Option<InsertManyOptions>> + Send,
        ) -> InsertManyResult
    );

    delegate!(
        UpdateOne => fn update_one(
            filter: Document,
            update: impl Into<UpdateModifications> + Send,
            options: impl Into<Option<UpdateOptions>> + Send,
        ) -> UpdateResult
    );

    delegate!(
        UpdateMany => fn update_many(
            filter: Document,
            update: impl Into<UpdateModifications> + Send,
            options: impl Into<Option<UpdateOptions>> + Send,
        ) -> UpdateResult
    );

    delegate!(
        ReplaceOne => fn replace_one(
            filter: Document,
            replacement: Document,
            options: impl Into<Option<ReplaceOptions>> + Send,
        ) -> UpdateResult
    );

    delegate!(
        DeleteOne => fn delete_one(
            filter: Document,
            options: impl Into<Option<DeleteOptions>> + Send,
        ) -> DeleteResult
    );

    delegate!(
        DeleteMany => fn delete_many(
            filter: Document,
            options: impl Into<Option<DeleteOptions>> + Send,
        ) -> DeleteResult
    );

    delegate!(
        /// Executes `models` in order, stopping at the first failure.
        BulkWrite => fn bulk_write(models: Vec<WriteModel>) -> BulkWriteResult
    );

    delegate!(
        /// Runs an aggregation pipeline and collects its output.
        Aggregate => fn aggregate(
            pipeline: Vec<Document>,
            options: impl Into<Option<AggregateOptions>> + Send,
        ) -> Vec<Document>
    );

    delegate!(
        /// Returns the distinct values of `field_name` among documents matching `filter`.
        Distinct => fn distinct(
            field_name: impl Into<String> + Send,
            filter: Document,
            options: impl Into<Option<DistinctOptions>> + Send,
        ) -> Vec<Bson>
    );

    delegate!(
        FindOneAndUpdate => fn find_one_and_update(
            filter: Document,
            update: impl Into<UpdateModifications> + Send,
            options: impl Into<Option<FindOneAndUpdateOptions>> + Send,
        ) -> Option<Document>
    );

    delegate!(
        FindOneAndReplace => fn find_one_and_replace(
            filter: Document,
            replacement: Document,
            options: impl Into<Option<FindOneAndReplaceOptions>> + Send,
        ) -> Option<Document>
    );

    delegate!(
        FindOneAndDelete => fn find_one_and_delete(
            filter: Document,
            options: impl Into<Option<FindOneAndDeleteOptions>> + Send,
        ) -> Option<Document>
    );
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("database", &self.database)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}
