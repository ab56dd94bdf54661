use jql_core::{aggregate_specs, evaluate_document, extract_constraints, Aggregation, Query};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::document::{decode, encode, with_id};
use super::{
    reject_aggregate, Backend, ChangeEvent, ChangeKind, Committed, ObjectId, Selection, TenantId,
};
use crate::error::{DbError, DbResult};

/// Metadata column family name
const META_CF: &str = "_meta";

/// Last assigned collection id, in the metadata column family
const COLLECTION_SEQ_KEY: &str = "seq:collections";

/// Last assigned object id, in each collection's column family
const SEQ_KEY: &str = "_stats:seq";

const DOC_PREFIX: &str = "doc:";

fn cf_name(tenant: TenantId, collection: &str) -> String {
    format!("{}:{}", tenant, collection)
}

fn meta_prefix(tenant: TenantId) -> String {
    format!("coll:{}:", tenant)
}

fn meta_key(tenant: TenantId, collection: &str) -> String {
    format!("{}{}", meta_prefix(tenant), collection)
}

/// Zero-padded so keys iterate in id order
fn doc_key(id: ObjectId) -> String {
    format!("{}{:020}", DOC_PREFIX, id)
}

fn parse_id(bytes: &[u8]) -> DbResult<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DbError::Storage(format!("corrupt id '{}'", String::from_utf8_lossy(bytes))))
}

fn commit(db: &DB, batch: WriteBatch) -> DbResult<()> {
    db.write(batch)
        .map_err(|e| DbError::TransactionError(e.into_string()))
}

/// RocksDB backend: one column family per tenant collection, documents
/// stored as JSON under zero-padded id keys.
///
/// Mutations hold the write lock and commit one `WriteBatch`, so a writer
/// excludes readers and other writers. Queries scan the collection and
/// evaluate each document in memory.
pub struct EmbeddedBackend {
    db: Arc<RwLock<DB>>,
    path: PathBuf,
}

impl std::fmt::Debug for EmbeddedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedBackend")
            .field("path", &self.path)
            .finish()
    }
}

impl EmbeddedBackend {
    /// Open (or create) the store under `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> DbResult<Self> {
        let path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_keep_log_file_num(5);

        let mut cf_names = DB::list_cf(&opts, &path).unwrap_or_else(|_| vec!["default".to_string()]);
        if !cf_names.iter().any(|name| name == META_CF) {
            cf_names.push(META_CF.to_string());
        }

        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, descriptors)
            .map_err(|e| DbError::Storage(format!("Failed to open RocksDB: {}", e)))?;

        tracing::info!("Opened embedded store at {}", path.display());

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn meta(db: &DB) -> DbResult<&ColumnFamily> {
        db.cf_handle(META_CF)
            .ok_or_else(|| DbError::Storage("metadata column family missing".to_string()))
    }

    fn read_i64(db: &DB, cf: &ColumnFamily, key: &str) -> DbResult<Option<i64>> {
        db.get_cf(cf, key)?.map(|bytes| parse_id(&bytes)).transpose()
    }

    fn collection_id(db: &DB, tenant: TenantId, collection: &str) -> DbResult<Option<i64>> {
        Self::read_i64(db, Self::meta(db)?, &meta_key(tenant, collection))
    }

    /// Column family of an existing collection, with the collection id.
    fn collection<'a>(
        db: &'a DB,
        tenant: TenantId,
        collection: &str,
    ) -> DbResult<(i64, &'a ColumnFamily)> {
        let id = Self::collection_id(db, tenant, collection)?
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let cf = db.cf_handle(&cf_name(tenant, collection)).ok_or_else(|| {
            DbError::Storage(format!("column family for '{}' missing", collection))
        })?;
        Ok((id, cf))
    }

    /// Make sure the collection's column family exists and queue its
    /// metadata in `batch` when it is new. Returns `(id, created)`.
    ///
    /// A new collection always starts from an empty column family, so a
    /// family left behind without metadata is dropped first.
    fn prepare_collection(
        db: &mut DB,
        batch: &mut WriteBatch,
        tenant: TenantId,
        collection: &str,
    ) -> DbResult<(i64, bool)> {
        let name = cf_name(tenant, collection);
        if let Some(id) = Self::collection_id(db, tenant, collection)? {
            if db.cf_handle(&name).is_none() {
                tracing::warn!("Recreating missing column family for '{}'", collection);
                db.create_cf(&name, &Options::default())?;
            }
            return Ok((id, false));
        }

        if db.cf_handle(&name).is_some() {
            tracing::warn!("Dropping orphaned column family '{}'", name);
            db.drop_cf(&name)?;
        }
        db.create_cf(&name, &Options::default())?;

        let meta = Self::meta(db)?;
        let id = Self::read_i64(db, meta, COLLECTION_SEQ_KEY)?.unwrap_or(0) + 1;
        batch.put_cf(meta, COLLECTION_SEQ_KEY, id.to_string());
        batch.put_cf(meta, meta_key(tenant, collection), id.to_string());
        Ok((id, true))
    }

    /// Visit every document of a collection in id order.
    fn for_each_document<F>(db: &DB, cf: &ColumnFamily, mut visit: F) -> DbResult<()>
    where
        F: FnMut(ObjectId, Map<String, Value>) -> DbResult<()>,
    {
        let iter = db.iterator_cf(
            cf,
            IteratorMode::From(DOC_PREFIX.as_bytes(), rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            let Some(id) = key.strip_prefix(DOC_PREFIX.as_bytes()) else {
                break;
            };
            visit(parse_id(id)?, decode(&value)?)?;
        }
        Ok(())
    }

    fn count_documents(db: &DB, cf: &ColumnFamily) -> DbResult<usize> {
        let mut count = 0;
        Self::for_each_document(db, cf, |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn load(db: &DB, cf: &ColumnFamily, id: ObjectId) -> DbResult<Map<String, Value>> {
        match db.get_cf(cf, doc_key(id))? {
            Some(bytes) => decode(&bytes),
            None => Err(DbError::DocumentNotFound(id)),
        }
    }

    /// Filter, aggregate and constrain one collection.
    fn run_select(
        db: &DB,
        cf: &ColumnFamily,
        query: &Query,
        params: &[Value],
    ) -> DbResult<Selection> {
        // Fatal errors surface before the scan starts
        let constraints = extract_constraints(query, params)?;
        let specs = aggregate_specs(query)?;

        let filter = query.filter();
        let mut aggregation = (!specs.is_empty()).then(|| Aggregation::new(&specs));
        let mut matched = Vec::new();
        let mut errors = Vec::new();

        Self::for_each_document(db, cf, |id, data| {
            let document = with_id(data, id);
            let (hit, term_errors) = evaluate_document(filter, id, &document, params);
            errors.extend(term_errors);
            if hit {
                match aggregation.as_mut() {
                    Some(aggregation) => aggregation.accumulate(&document),
                    None => matched.push(document),
                }
            }
            Ok(())
        })?;

        let documents = match aggregation {
            Some(aggregation) => vec![aggregation.finish()],
            None => constraints.apply(matched),
        };
        Ok(Selection::new(documents, errors))
    }
}

impl Backend for EmbeddedBackend {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn create_collection(&self, tenant: TenantId, name: &str) -> DbResult<Committed<i64>> {
        let mut db = self.db.write();
        let mut batch = WriteBatch::default();
        let (id, created) = Self::prepare_collection(&mut db, &mut batch, tenant, name)?;
        if !created {
            return Ok(Committed::unchanged(id));
        }
        commit(&db, batch)?;
        tracing::info!("Created collection '{}' for tenant {}", name, tenant);
        Ok(Committed::new(
            id,
            vec![ChangeEvent::collection(tenant, id, ChangeKind::Insert)],
        ))
    }

    fn list_collections(&self, tenant: TenantId) -> DbResult<Vec<String>> {
        let db = self.db.read();
        let meta = Self::meta(&db)?;
        let prefix = meta_prefix(tenant);

        let mut names = Vec::new();
        let iter = db.iterator_cf(
            meta,
            IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            match key.strip_prefix(prefix.as_bytes()) {
                Some(name) => names.push(String::from_utf8_lossy(name).into_owned()),
                None => break,
            }
        }
        Ok(names)
    }

    fn drop_collection(&self, tenant: TenantId, name: &str) -> DbResult<Committed<usize>> {
        let mut db = self.db.write();
        let id = Self::collection_id(&db, tenant, name)?
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;

        // Family first: metadata without a family can still be dropped
        let family = cf_name(tenant, name);
        let count = match db.cf_handle(&family) {
            Some(cf) => Some(Self::count_documents(&db, cf)?),
            None => None,
        };
        if count.is_some() {
            db.drop_cf(&family)?;
        }
        let count = count.unwrap_or(0);

        let mut batch = WriteBatch::default();
        batch.delete_cf(Self::meta(&db)?, meta_key(tenant, name));
        commit(&db, batch)?;

        tracing::info!("Dropped collection '{}' for tenant {} ({} objects)", name, tenant, count);
        Ok(Committed::new(
            count,
            vec![ChangeEvent::collection(tenant, id, ChangeKind::Delete)],
        ))
    }

    fn count(&self, tenant: TenantId, collection: &str) -> DbResult<usize> {
        let db = self.db.read();
        let (_, cf) = Self::collection(&db, tenant, collection)?;
        Self::count_documents(&db, cf)
    }

    fn insert(
        &self,
        tenant: TenantId,
        collection: &str,
        documents: Vec<Map<String, Value>>,
    ) -> DbResult<Committed<Vec<Value>>> {
        let mut db = self.db.write();
        let mut batch = WriteBatch::default();
        let mut changes = Vec::with_capacity(documents.len() + 1);

        let (collection_id, created) =
            Self::prepare_collection(&mut db, &mut batch, tenant, collection)?;
        if created {
            changes.push(ChangeEvent::collection(tenant, collection_id, ChangeKind::Insert));
        }

        // Metadata of a new collection is still in the batch
        let cf = db.cf_handle(&cf_name(tenant, collection)).ok_or_else(|| {
            DbError::Storage(format!("column family for '{}' missing", collection))
        })?;

        let mut next = Self::read_i64(&db, cf, SEQ_KEY)?.unwrap_or(0);
        let mut inserted = Vec::with_capacity(documents.len());
        for data in documents {
            next += 1;
            batch.put_cf(cf, doc_key(next), encode(&data)?);
            changes.push(ChangeEvent::object(tenant, next, ChangeKind::Insert));
            inserted.push(with_id(data, next));
        }
        batch.put_cf(cf, SEQ_KEY, next.to_string());

        commit(&db, batch)?;
        tracing::debug!("Inserted {} objects into '{}'", inserted.len(), collection);
        Ok(Committed::new(inserted, changes))
    }

    fn get(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Value> {
        let db = self.db.read();
        let (_, cf) = Self::collection(&db, tenant, collection)?;
        Ok(with_id(Self::load(&db, cf, id)?, id))
    }

    fn update(
        &self,
        tenant: TenantId,
        collection: &str,
        id: ObjectId,
        document: Map<String, Value>,
    ) -> DbResult<Committed<Value>> {
        let db = self.db.write();
        let (_, cf) = Self::collection(&db, tenant, collection)?;
        if db.get_cf(cf, doc_key(id))?.is_none() {
            return Err(DbError::DocumentNotFound(id));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, doc_key(id), encode(&document)?);
        commit(&db, batch)?;

        Ok(Committed::new(
            with_id(document, id),
            vec![ChangeEvent::object(tenant, id, ChangeKind::Update)],
        ))
    }

    fn remove(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Committed<Value>> {
        let db = self.db.write();
        let (_, cf) = Self::collection(&db, tenant, collection)?;
        let existing = Self::load(&db, cf, id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, doc_key(id));
        commit(&db, batch)?;

        Ok(Committed::new(
            with_id(existing, id),
            vec![ChangeEvent::object(tenant, id, ChangeKind::Delete)],
        ))
    }

    fn select(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &Query,
        params: &[Value],
    ) -> DbResult<Selection> {
        let db = self.db.read();
        let (_, cf) = Self::collection(&db, tenant, collection)?;
        Self::run_select(&db, cf, query, params)
    }

    fn delete(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &Query,
        params: &[Value],
    ) -> DbResult<Committed<Selection>> {
        reject_aggregate(query)?;

        let db = self.db.write();
        let (_, cf) = Self::collection(&db, tenant, collection)?;
        let selection = Self::run_select(&db, cf, query, params)?;

        let ids = selection.ids();
        if ids.is_empty() {
            return Ok(Committed::unchanged(selection));
        }

        let mut batch = WriteBatch::default();
        for id in &ids {
            batch.delete_cf(cf, doc_key(*id));
        }
        commit(&db, batch)?;

        let changes = ids
            .into_iter()
            .map(|id| ChangeEvent::object(tenant, id, ChangeKind::Delete))
            .collect();
        Ok(Committed::new(selection, changes))
    }

    fn reconnect(&self) -> DbResult<()> {
        // The embedded store has no connection to re-establish
        tracing::debug!("Embedded store at {} keeps its handle on reconnect", self.path.display());
        Ok(())
    }

    fn shutdown(&self) -> DbResult<()> {
        self.db.read().flush_wal(true)?;
        tracing::info!("Closed embedded store at {}", self.path.display());
        Ok(())
    }
}
