//! Storage backends and the store façade.
//!
//! Two interchangeable backends execute the same parsed JQL queries:
//!
//! - [`EmbeddedBackend`]: RocksDB, one column family per collection,
//!   queries evaluated in memory against decoded documents
//! - [`RelationalBackend`]: SQLite, documents kept as JSON text and queries
//!   translated to SQL
//!
//! Backends never publish notifications themselves. Every mutation returns
//! the [`ChangeEvent`]s it committed and the [`Store`] hands them to the
//! listener registry after the commit succeeded.

pub mod document;
pub mod embedded;
pub mod engine;
pub mod notify;
pub mod relational;

use jql_core::{JqlError, Query};
use serde_json::{Map, Value};

use crate::error::{DbError, DbResult};

pub use embedded::EmbeddedBackend;
pub use engine::Store;
pub use notify::{
    BroadcastListener, ChangeEvent, ChangeKind, ChangeTable, Listener, ListenerId,
    ListenerRegistry,
};
pub use relational::RelationalBackend;

/// Account / organization namespace
pub type TenantId = i64;

/// Object id, assigned by the backend on insert
pub type ObjectId = i64;

/// Result of a committed mutation with the events it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    pub changes: Vec<ChangeEvent>,
}

impl<T> Committed<T> {
    pub fn new(value: T, changes: Vec<ChangeEvent>) -> Self {
        Self { value, changes }
    }

    /// A result that changed nothing
    pub fn unchanged(value: T) -> Self {
        Self {
            value,
            changes: Vec::new(),
        }
    }
}

/// Documents matched by a query plus the non-fatal errors met on the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub documents: Vec<Value>,
    pub errors: Vec<JqlError>,
}

impl Selection {
    /// Build a selection, keeping only the first occurrence of each error.
    pub fn new(documents: Vec<Value>, errors: Vec<JqlError>) -> Self {
        let mut unique: Vec<JqlError> = Vec::new();
        for error in errors {
            if !unique.contains(&error) {
                unique.push(error);
            }
        }
        Self {
            documents,
            errors: unique,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Object ids of the selected documents
    pub fn ids(&self) -> Vec<ObjectId> {
        self.documents
            .iter()
            .filter_map(document::id_of)
            .collect()
    }
}

/// Operations every storage backend implements.
///
/// Each call runs in its own transaction: committed on success, rolled back
/// (or never written) on any error.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the collection if missing; returns its id.
    fn create_collection(&self, tenant: TenantId, name: &str) -> DbResult<Committed<i64>>;

    /// Collection names of a tenant, sorted
    fn list_collections(&self, tenant: TenantId) -> DbResult<Vec<String>>;

    /// Drop a collection with its objects; returns the number of objects.
    fn drop_collection(&self, tenant: TenantId, name: &str) -> DbResult<Committed<usize>>;

    fn count(&self, tenant: TenantId, collection: &str) -> DbResult<usize>;

    /// Insert documents, creating the collection on first use.
    fn insert(
        &self,
        tenant: TenantId,
        collection: &str,
        documents: Vec<Map<String, Value>>,
    ) -> DbResult<Committed<Vec<Value>>>;

    fn get(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Value>;

    /// Replace the document stored under `id`.
    fn update(
        &self,
        tenant: TenantId,
        collection: &str,
        id: ObjectId,
        document: Map<String, Value>,
    ) -> DbResult<Committed<Value>>;

    /// Delete one object, returning it.
    fn remove(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Committed<Value>>;

    fn select(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &Query,
        params: &[Value],
    ) -> DbResult<Selection>;

    /// Delete everything `select` would return, in one transaction.
    fn delete(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &Query,
        params: &[Value],
    ) -> DbResult<Committed<Selection>>;

    /// Re-establish the underlying connection.
    fn reconnect(&self) -> DbResult<()>;

    fn shutdown(&self) -> DbResult<()>;
}

/// Delete-by-query has no meaning for an aggregate row.
pub(crate) fn reject_aggregate(query: &Query) -> DbResult<()> {
    if query.is_aggregate() {
        return Err(DbError::InvalidQuery(
            "aggregate queries cannot delete documents".to_string(),
        ));
    }
    Ok(())
}

/// Collection names are non-empty words of letters, digits, `_`, `-` and `.`.
pub fn validate_collection_name(name: &str) -> DbResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(DbError::InvalidName(format!(
            "'{}' must be between 1 and 128 characters",
            name
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(DbError::InvalidName(format!(
            "'{}' contains invalid character '{}'",
            name, c
        )));
    }
    if name.starts_with('_') {
        return Err(DbError::InvalidName(format!(
            "'{}' is reserved, names must not start with '_'",
            name
        )));
    }
    Ok(())
}
