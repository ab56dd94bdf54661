//! jqlstore - a multi-tenant JSON document store queried with JQL.
//!
//! Documents are JSON objects grouped in per-tenant collections. Queries are
//! parsed once by [`jql_core`] and executed by one of two backends selected
//! in [`StoreConfig`]: RocksDB with in-memory evaluation, or SQLite with
//! queries translated to SQL. Both return the same documents, in the same
//! order, with the same aggregate values.
//!
//! ```no_run
//! use jqlstore::{Store, StoreConfig};
//! use serde_json::json;
//!
//! let store = Store::open(StoreConfig::embedded("./data"))?;
//! store.insert(1, "people", json!([{"age": 25}, {"age": 18}]))?;
//!
//! let adults = store.select(1, "people", "age >= $1 order numeric(age) asc", &[json!(21)])?;
//! assert_eq!(adults.documents.len(), 1);
//! # Ok::<(), jqlstore::DbError>(())
//! ```

pub mod config;
pub mod error;
pub mod storage;

pub use config::{StorageMode, StoreConfig};
pub use error::{DbError, DbResult};
pub use storage::{
    Backend, BroadcastListener, ChangeEvent, ChangeKind, ChangeTable, EmbeddedBackend, Listener,
    ListenerId, ObjectId, RelationalBackend, Selection, Store, TenantId,
};
