//! Event types for MongoDB change stream operations.
//!
//! This module defines the change events delivered to subscribers.

use mongodb::{
    bson::Document,
    change_stream::event::{ChangeStreamEvent, OperationType},
};

/// Represents the types of events that can occur in a MongoDB deployment.
///
/// These event types correspond to the MongoDB change stream operation types.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy)]
pub enum Event {
    /// Document insertion event
    Insert,
    /// Document update event
    Update,
    /// Document replacement event
    Replace,
    /// Document deletion event
    Delete,
    /// Collection dropped
    Drop,
    /// Collection renamed
    Rename,
    /// Database dropped
    DropDatabase,
    /// The stream was invalidated by the server
    Invalidate,
    /// Any operation type this crate does not model
    Other,
}

impl Event {
    /// Returns a string representation of the event type.
    ///
    /// This is useful for logging and debugging purposes.
    pub fn event_type_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Drop => "drop",
            Self::Rename => "rename",
            Self::DropDatabase => "dropDatabase",
            Self::Invalidate => "invalidate",
            Self::Other => "other",
        }
    }
}

// Conversion from MongoDB's OperationType
impl From<OperationType> for Event {
    fn from(op_type: OperationType) -> Self {
        match op_type {
            OperationType::Insert => Event::Insert,
            OperationType::Update => Event::Update,
            OperationType::Replace => Event::Replace,
            OperationType::Delete => Event::Delete,
            OperationType::Drop => Event::Drop,
            OperationType::Rename => Event::Rename,
            OperationType::DropDatabase => Event::DropDatabase,
            OperationType::Invalidate => Event::Invalidate,
            _ => Event::Other,
        }
    }
}

/// A single change notification as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: Event,
    pub database: Option<String>,
    pub collection: Option<String>,
    /// The `_id` (and shard key, if any) of the changed document.
    pub document_key: Option<Document>,
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    /// Creates an event with no namespace or document payload.
    pub fn new(operation: Event) -> Self {
        Self {
            operation,
            database: None,
            collection: None,
            document_key: None,
            full_document: None,
        }
    }

    pub fn with_namespace(mut self, database: impl Into<String>, collection: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self.collection = Some(collection.into());
        self
    }

    pub fn with_document_key(mut self, key: Document) -> Self {
        self.document_key = Some(key);
        self
    }

    pub fn with_full_document(mut self, document: Document) -> Self {
        self.full_document = Some(document);
        self
    }
}

impl From<ChangeStreamEvent<Document>> for ChangeEvent {
    fn from(event: ChangeStreamEvent<Document>) -> Self {
        let (database, collection) = match event.ns {
            Some(ns) => (Some(ns.db), ns.coll),
            None => (None, None),
        };
        Self {
            operation: Event::from(event.operation_type),
            database,
            collection,
            document_key: event.document_key,
            full_document: event.full_document,
        }
    }
}
