use jql_core::{parse, translate, SqlQuery};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::document::into_object;
use super::{
    validate_collection_name, Backend, BroadcastListener, ChangeEvent, Committed,
    EmbeddedBackend, Listener, ListenerId, ListenerRegistry, ObjectId, RelationalBackend,
    Selection, TenantId,
};
use crate::config::{StorageMode, StoreConfig};
use crate::error::DbResult;

/// The document store.
///
/// Dispatches every call to the backend selected by [`StorageMode`] and
/// publishes the committed changes of each successful mutation to the
/// registered listeners.
pub struct Store {
    config: StoreConfig,
    backend: Box<dyn Backend>,
    listeners: ListenerRegistry,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("mode", &self.config.mode)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Store {
    /// Open the backend described by `config`
    pub fn open(config: StoreConfig) -> DbResult<Self> {
        let backend: Box<dyn Backend> = match config.mode {
            StorageMode::Embedded => Box::new(EmbeddedBackend::open(&config.data_dir)?),
            StorageMode::Relational => Box::new(RelationalBackend::open(config.sqlite_file())?),
        };
        Ok(Self::with_backend(config, backend))
    }

    /// Wrap an already opened backend
    pub fn with_backend(config: StoreConfig, backend: Box<dyn Backend>) -> Self {
        tracing::info!("Store ready ({} backend)", backend.name());
        let listeners = ListenerRegistry::new(config.max_listeners);
        Self {
            config,
            backend,
            listeners,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn mode(&self) -> StorageMode {
        self.config.mode
    }

    fn publish<T>(&self, committed: Committed<T>) -> T {
        self.listeners.publish(&committed.changes);
        committed.value
    }

    // ==================== Collections ====================

    pub fn create_collection(&self, tenant: TenantId, name: &str) -> DbResult<i64> {
        validate_collection_name(name)?;
        let committed = self.backend.create_collection(tenant, name)?;
        Ok(self.publish(committed))
    }

    pub fn list_collections(&self, tenant: TenantId) -> DbResult<Vec<String>> {
        self.backend.list_collections(tenant)
    }

    /// Drop a collection; returns how many objects it held.
    pub fn drop_collection(&self, tenant: TenantId, name: &str) -> DbResult<usize> {
        let committed = self.backend.drop_collection(tenant, name)?;
        Ok(self.publish(committed))
    }

    pub fn count(&self, tenant: TenantId, collection: &str) -> DbResult<usize> {
        self.backend.count(tenant, collection)
    }

    // ==================== Objects ====================

    /// Insert one document or an array of documents.
    ///
    /// Every document must be an object; a `$id` field in the input is
    /// ignored. Returns the stored documents with their assigned `$id`.
    pub fn insert(&self, tenant: TenantId, collection: &str, document: Value) -> DbResult<Vec<Value>> {
        validate_collection_name(collection)?;
        let documents = match document {
            Value::Array(items) => items
                .into_iter()
                .map(into_object)
                .collect::<DbResult<Vec<_>>>()?,
            single => vec![into_object(single)?],
        };
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let committed = self.backend.insert(tenant, collection, documents)?;
        Ok(self.publish(committed))
    }

    pub fn get(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Value> {
        self.backend.get(tenant, collection, id)
    }

    /// Replace the document stored under `id`.
    pub fn update(
        &self,
        tenant: TenantId,
        collection: &str,
        id: ObjectId,
        document: Value,
    ) -> DbResult<Value> {
        let committed = self
            .backend
            .update(tenant, collection, id, into_object(document)?)?;
        Ok(self.publish(committed))
    }

    /// Delete one object; a missing id is `DocumentNotFound`.
    pub fn remove(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Value> {
        let committed = self.backend.remove(tenant, collection, id)?;
        Ok(self.publish(committed))
    }

    // ==================== Queries ====================

    /// Run a JQL query.
    ///
    /// Parse errors and invalid constraints or aggregate clauses fail the
    /// call. Errors met while evaluating filter terms exclude the affected
    /// documents and are returned in [`Selection::errors`].
    pub fn select(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &str,
        params: &[Value],
    ) -> DbResult<Selection> {
        let parsed = parse(query)?;
        tracing::debug!("Select on '{}' via {}: {}", collection, self.backend.name(), query);

        let selection = self.backend.select(tenant, collection, &parsed, params)?;
        for error in &selection.errors {
            tracing::warn!("Query '{}' on '{}': {}", query, collection, error);
        }
        Ok(selection)
    }

    /// Delete every document the query selects, returning them.
    pub fn delete(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &str,
        params: &[Value],
    ) -> DbResult<Selection> {
        let parsed = parse(query)?;
        tracing::debug!("Delete on '{}' via {}: {}", collection, self.backend.name(), query);

        let committed = self.backend.delete(tenant, collection, &parsed, params)?;
        for error in &committed.value.errors {
            tracing::warn!("Query '{}' on '{}': {}", query, collection, error);
        }
        Ok(self.publish(committed))
    }

    /// The SQL a query translates to, in either storage mode.
    pub fn explain(&self, query: &str, params: &[Value]) -> DbResult<SqlQuery> {
        let parsed = parse(query)?;
        Ok(translate(&parsed, params)?)
    }

    // ==================== Notifications ====================

    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> DbResult<ListenerId> {
        self.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Register a channel-backed listener and return its receiving end.
    pub fn subscribe(
        &self,
        capacity: usize,
    ) -> DbResult<(ListenerId, broadcast::Receiver<ChangeEvent>)> {
        let (listener, receiver) = BroadcastListener::new(capacity);
        let id = self.listeners.register(Arc::new(listener))?;
        Ok((id, receiver))
    }

    /// Re-establish the backend connection, then tell listeners their
    /// cached state is stale.
    pub fn reconnect(&self) -> DbResult<()> {
        self.backend.reconnect()?;
        self.listeners.reconnect_all();
        Ok(())
    }

    pub fn shutdown(&self) -> DbResult<()> {
        tracing::info!("Shutting down store");
        self.backend.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::embedded(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_array() {
        let (_dir, store) = store();
        let docs = store
            .insert(1, "users", json!([{"a": 1}, {"a": 2, "$id": 77}]))
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["$id"], 2);
        assert!(store.insert(1, "users", json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_input() {
        let (_dir, store) = store();
        assert!(matches!(
            store.insert(1, "users", json!([{"a": 1}, 5])),
            Err(DbError::InvalidDocument(_))
        ));
        assert_eq!(store.list_collections(1).unwrap(), Vec::<String>::new());
        assert!(matches!(
            store.insert(1, "bad:name", json!({})),
            Err(DbError::InvalidName(_))
        ));
    }

    #[test]
    fn test_parse_error_is_fatal() {
        let (_dir, store) = store();
        store.insert(1, "users", json!({"a": 1})).unwrap();
        assert!(matches!(
            store.select(1, "users", "a = ", &[]),
            Err(DbError::Query(jql_core::JqlError::Parse(_)))
        ));
    }

    #[test]
    fn test_explain() {
        let (_dir, store) = store();
        let sql = store.explain("a = $1 limit 2", &[json!("x")]).unwrap();
        assert_eq!(sql.params, vec![json!("x"), json!(2)]);
        assert_eq!(sql.limit_sql, "LIMIT ?2");
    }

    #[test]
    fn test_subscribe() {
        let (_dir, store) = store();
        let (id, mut receiver) = store.subscribe(16).unwrap();
        store.insert(4, "c", json!({"a": 1})).unwrap();

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.table, crate::storage::ChangeTable::Collections);
        let second = receiver.try_recv().unwrap();
        assert_eq!((second.tenant, second.id), (4, 1));

        assert!(store.unregister_listener(id));
        store.insert(4, "c", json!({"a": 2})).unwrap();
        assert!(receiver.try_recv().is_err());
    }
}
