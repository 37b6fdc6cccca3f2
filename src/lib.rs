//! # Resilient MongoDB Client
//!
//! This crate wraps a MongoDB connection so application code never has to
//! reason about connection lifecycle.
//!
//! ## Features
//!
//! - Initial connection retried with exponential backoff on timeouts
//! - Automatic reconnection when an operation or the change stream reports a
//!   lost topology
//! - Change events broadcast to subscribers that stay registered across
//!   reconnects
//! - Per-collection handles exposing an allow-listed set of operations
//! - Explicit, idempotent shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use mongodb::bson::doc;
//! use rs_mongo_resilient::ResilientClient;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ResilientClient::builder("mongodb://localhost:27017", |err| {
//!         eprintln!("mongo: {err}");
//!     })
//!     .to_wrap(["replaceOne"])
//!     .build()?;
//!
//!     // Receive every change, across reconnects
//!     let id = client.subscribe(|event| {
//!         let event = event.clone();
//!         Box::pin(async move {
//!             println!("{} event received", event.operation.event_type_str());
//!         })
//!     });
//!
//!     if let Some(users) = client.operation_handle("app", "users").await? {
//!         users.insert_one(doc! { "name": "ada" }, None).await?;
//!         let count = users.count_documents(doc! {}, None).await?;
//!         println!("{count} users");
//!     }
//!
//!     client.unsubscribe(id);
//!     client.destroy().await;
//!     Ok(())
//! }
//! ```
mod client;
mod config;
mod driver;
mod error;
mod event;
mod handle;
mod manager;
mod model;
mod mongo;
mod operation;
mod stream;

pub use mongodb;

pub use client::{ResilientClient, ResilientClientBuilder};
pub use config::{
    ClientConfig, ClientSettings, RetryOptions, DEFAULT_FACTOR, DEFAULT_MAX_TIMEOUT, DEFAULT_MIN_TIMEOUT,
    DEFAULT_RETRIES,
};
pub use driver::{ChangeStream, CollectionOps, Connection, Connector};
pub use error::Error;
pub use event::{ChangeEvent, Event};
pub use handle::CollectionHandle;
pub use manager::{ConnectionState, ErrorSink};
pub use model::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, WriteModel};
pub use mongo::{MongoCollection, MongoConnection, MongoConnector};
pub use operation::{AllowList, Operation};
pub use stream::{ChangeDispatcher, SubscriptionId};
