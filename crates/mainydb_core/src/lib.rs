//! # MainyDB Core
//!
//! The document engine behind MainyDB: an embedded, single-file document
//! database with a MongoDB-style surface.
//!
//! - Schema-free documents in named collections inside named databases,
//!   all persisted in one file with atomic-rename checkpoints.
//! - Rich query predicates (`$eq`/`$gt`/`$in`/`$elemMatch`/…) with a
//!   deterministic planner over ordered and hashed secondary indexes.
//! - Field-level update operators (`$set`/`$inc`/`$push`/…) applied
//!   copy-on-write and atomically per document.
//! - A lazy aggregation pipeline (`$match`/`$group`/`$sort`/`$lookup`/…).
//! - Designed for concurrent callers: readers share per-collection
//!   locks, writers exclude, snapshot cursors see a fixed id set with
//!   live contents.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mainydb_core::{doc, FindOptions, MainyDb};
//!
//! let store = MainyDb::open("./app.mdb")?;
//! let users = store.db("app").collection("users");
//!
//! users.insert_one(doc! { "name": "John", "age": 30i64 })?;
//! users.insert_one(doc! { "name": "Jane", "age": 25i64 })?;
//!
//! let adults = users
//!     .find_with_options(
//!         &doc! { "age": doc! { "$gt": 27i64 } },
//!         FindOptions::new().sort("age", 1),
//!     )?
//!     .to_vec()?;
//! assert_eq!(adults.len(), 1);
//! store.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
mod collection;
mod config;
pub mod crypto;
mod cursor;
mod database;
mod error;
pub mod index;
pub mod media;
pub mod path;
pub mod planner;
pub mod query;
mod stats;
pub mod store;
mod update;

pub use collection::{
    AggregateCursor, BulkWriteResult, Collection, DeleteResult, FindOptions, IndexOptions,
    InsertManyResult, InsertOneResult, UpdateResult, WriteOp,
};
pub use config::Config;
pub use crypto::{Aes256Cipher, EncryptionConfig, EncryptionKey, FieldCrypto, Sha256Hasher};
pub use cursor::{CancelToken, Cursor};
pub use database::{Database, MainyDb};
pub use error::{EngineError, EngineResult};
pub use media::{MediaCache, MediaKey, MediaValue};
pub use stats::CollectionStats;
pub use update::{PullCond, UpdateOp, UpdateSpec};

pub use mainydb_codec::{doc, Document, ObjectId, Value};
