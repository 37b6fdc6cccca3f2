//! Write models and operation results.
//!
//! Results are plain data so that any [`crate::driver::CollectionOps`]
//! implementation can produce them.

use std::collections::HashMap;

use mongodb::{
    bson::{Bson, Document},
    options::UpdateModifications,
    results,
};

/// One write inside a [`crate::CollectionHandle::bulk_write`] call.
#[derive(Debug, Clone)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
    },
    UpdateMany {
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: Option<bool>,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertManyResult {
    /// Inserted ids keyed by the index of the document in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Aggregated outcome of a bulk write.
///
/// Index keys refer to the position of the model in the submitted list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserted_count: u64,
    pub inserted_ids: HashMap<usize, Bson>,
    pub upserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteResult {
    pub fn record_insert(&mut self, index: usize, result: InsertOneResult) {
        self.inserted_count += 1;
        self.inserted_ids.insert(index, result.inserted_id);
    }

    pub fn record_update(&mut self, index: usize, result: UpdateResult) {
        self.matched_count += result.matched_count;
        self.modified_count += result.modified_count;
        if let Some(id) = result.upserted_id {
            self.upserted_count += 1;
            self.upserted_ids.insert(index, id);
        }
    }

    pub fn record_delete(&mut self, result: DeleteResult) {
        self.deleted_count += result.deleted_count;
    }
}

impl From<results::InsertOneResult> for InsertOneResult {
    fn from(result: results::InsertOneResult) -> Self {
        Self {
            inserted_id: result.inserted_id,
        }
    }
}

impl From<results::InsertManyResult> for InsertManyResult {
    fn from(result: results::InsertManyResult) -> Self {
        Self {
            inserted_ids: result.inserted_ids,
        }
    }
}

impl From<results::UpdateResult> for UpdateResult {
    fn from(result: results::UpdateResult) -> Self {
        Self {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        }
    }
}

impl From<results::DeleteResult> for DeleteResult {
    fn from(result: results::DeleteResult) -> Self {
        Self {
            deleted_count: result.deleted_count,
        }
    }
}
