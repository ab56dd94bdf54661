use jql_core::value::{coerce_number, number_from_f64};
use jql_core::{translate, AggregateFunction, Moments, Query, SqlQuery};
use parking_lot::Mutex;
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use super::document::with_id;
use super::{
    reject_aggregate, Backend, ChangeEvent, ChangeKind, Committed, ObjectId, Selection, TenantId,
};
use crate::error::{DbError, DbResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (account_id, name)
);
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    data TEXT NOT NULL CHECK (json_valid(data))
);
CREATE INDEX IF NOT EXISTS objects_by_collection ON objects(collection_id, id);
";

/// Statistic computed by a registered moments aggregate.
#[derive(Debug, Clone, Copy)]
enum Statistic {
    Sum,
    Mean,
    Variance,
    Stddev,
    Covariance,
    Correlation,
    Slope,
    Intercept,
}

impl Statistic {
    fn arity(&self) -> i32 {
        match self {
            Statistic::Sum | Statistic::Mean | Statistic::Variance | Statistic::Stddev => 1,
            _ => 2,
        }
    }
}

/// SQL aggregate over [`Moments`], so both backends share every formula.
///
/// Two-argument forms take `(y, x)` and skip rows where either is NULL.
struct MomentsAggregate(Statistic);

impl Aggregate<Moments, f64> for MomentsAggregate {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Moments> {
        Ok(Moments::default())
    }

    fn step(&self, ctx: &mut Context<'_>, moments: &mut Moments) -> rusqlite::Result<()> {
        if self.0.arity() == 1 {
            if let Some(x) = ctx.get::<Option<f64>>(0)? {
                moments.push(x);
            }
        } else if let (Some(y), Some(x)) = (ctx.get::<Option<f64>>(0)?, ctx.get::<Option<f64>>(1)?) {
            moments.push_pair(y, x);
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, moments: Option<Moments>) -> rusqlite::Result<f64> {
        let moments = moments.unwrap_or_default();
        Ok(match self.0 {
            Statistic::Sum => moments.sum_x,
            Statistic::Mean => moments.mean(),
            Statistic::Variance => moments.variance(),
            Statistic::Stddev => moments.stddev(),
            Statistic::Covariance => moments.covariance(),
            Statistic::Correlation => moments.correlation(),
            Statistic::Slope => moments.regression().0,
            Statistic::Intercept => moments.regression().1,
        })
    }
}

/// `jql_num(x)`: numeric coercion of a JSON value, NULL when not numeric.
fn jql_num(ctx: &Context<'_>) -> rusqlite::Result<Option<f64>> {
    Ok(match ctx.get_raw(0) {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(text) => std::str::from_utf8(text)
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .as_ref()
            .and_then(coerce_number),
        _ => None,
    })
}

/// Register the functions translated queries rely on.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("jql_num", 1, flags, jql_num)?;

    for (name, statistic) in [
        ("jql_sum", Statistic::Sum),
        ("jql_avg", Statistic::Mean),
        ("var_pop", Statistic::Variance),
        ("stddev_pop", Statistic::Stddev),
        ("covar_pop", Statistic::Covariance),
        ("corr", Statistic::Correlation),
        ("regr_slope", Statistic::Slope),
        ("regr_intercept", Statistic::Intercept),
    ] {
        conn.create_aggregate_function(name, statistic.arity(), flags, MomentsAggregate(statistic))?;
    }
    Ok(())
}

fn open_connection(path: &Path) -> DbResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA)?;
    register_functions(&conn)?;
    Ok(conn)
}

/// Bind a JSON parameter as an SQL value.
fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn parse_data(text: &str) -> DbResult<Map<String, Value>> {
    match serde_json::from_str(text)? {
        Value::Object(data) => Ok(data),
        _ => Err(DbError::Storage("stored document is not an object".to_string())),
    }
}

/// Decode one column of an aggregate row.
fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => number_from_f64(f),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
    }
}

/// Build the aggregate result object from its single row. `regr` spans
/// two columns, slope then intercept.
fn aggregate_row(row: &rusqlite::Row<'_>, sql: &SqlQuery) -> DbResult<Map<String, Value>> {
    let mut result = Map::new();
    let mut column = 0;
    for spec in &sql.aggregates {
        let value = if spec.function == AggregateFunction::Regr {
            json!({
                "a": column_value(row.get_ref(column)?),
                "b": column_value(row.get_ref(column + 1)?),
            })
        } else {
            column_value(row.get_ref(column)?)
        };
        result.insert(spec.name.clone(), value);
        column += spec.function.result_columns();
    }
    Ok(result)
}

/// SQLite backend: documents stored as JSON text in one `objects` table,
/// queries translated to SQL by `jql_core::translate`.
///
/// The connection sits behind a mutex and every call runs in its own
/// transaction, rolled back when dropped on an error path.
pub struct RelationalBackend {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for RelationalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalBackend")
            .field("path", &self.path)
            .finish()
    }
}

impl RelationalBackend {
    /// Open (or create) the database file
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(&path)?;
        tracing::info!("Opened relational store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn collection_id(tx: &Transaction<'_>, tenant: TenantId, name: &str) -> DbResult<Option<i64>> {
        Ok(tx
            .query_row(
                "SELECT id FROM collections WHERE account_id = ?1 AND name = ?2",
                params![tenant, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn existing_collection(tx: &Transaction<'_>, tenant: TenantId, name: &str) -> DbResult<i64> {
        Self::collection_id(tx, tenant, name)?
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    /// Returns `(id, created)`.
    fn ensure_collection(tx: &Transaction<'_>, tenant: TenantId, name: &str) -> DbResult<(i64, bool)> {
        if let Some(id) = Self::collection_id(tx, tenant, name)? {
            return Ok((id, false));
        }
        tx.execute(
            "INSERT INTO collections (account_id, name) VALUES (?1, ?2)",
            params![tenant, name],
        )?;
        Ok((tx.last_insert_rowid(), true))
    }

    fn load(tx: &Transaction<'_>, collection_id: i64, id: ObjectId) -> DbResult<Map<String, Value>> {
        let data: Option<String> = tx
            .query_row(
                "SELECT data FROM objects WHERE id = ?1 AND collection_id = ?2",
                params![id, collection_id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(text) => parse_data(&text),
            None => Err(DbError::DocumentNotFound(id)),
        }
    }

    fn run_select(tx: &Transaction<'_>, collection_id: i64, sql: &SqlQuery) -> DbResult<Vec<Value>> {
        let statement = sql.statement();
        tracing::debug!("JQL translated to: {}", statement);

        let bound: Vec<SqlValue> = sql.bound_params(collection_id).iter().map(sql_value).collect();
        let mut stmt = tx.prepare(&statement)?;
        let mut rows = stmt.query(params_from_iter(bound.iter()))?;

        let mut documents = Vec::new();
        if sql.is_aggregate() {
            let result = match rows.next()? {
                Some(row) => aggregate_row(row, sql)?,
                None => Map::new(),
            };
            documents.push(Value::Object(result));
            return Ok(documents);
        }

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let data: String = row.get(1)?;
            documents.push(with_id(parse_data(&data)?, id));
        }
        Ok(documents)
    }

    fn commit(tx: Transaction<'_>) -> DbResult<()> {
        tx.commit()
            .map_err(|e| DbError::TransactionError(e.to_string()))
    }
}

impl Backend for RelationalBackend {
    fn name(&self) -> &'static str {
        "relational"
    }

    fn create_collection(&self, tenant: TenantId, name: &str) -> DbResult<Committed<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let (id, created) = Self::ensure_collection(&tx, tenant, name)?;
        Self::commit(tx)?;

        if !created {
            return Ok(Committed::unchanged(id));
        }
        tracing::info!("Created collection '{}' for tenant {}", name, tenant);
        Ok(Committed::new(
            id,
            vec![ChangeEvent::collection(tenant, id, ChangeKind::Insert)],
        ))
    }

    fn list_collections(&self, tenant: TenantId) -> DbResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM collections WHERE account_id = ?1 ORDER BY name")?;
        let names = stmt
            .query_map([tenant], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn drop_collection(&self, tenant: TenantId, name: &str) -> DbResult<Committed<usize>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = Self::existing_collection(&tx, tenant, name)?;

        let count = tx.execute("DELETE FROM objects WHERE collection_id = ?1", [id])?;
        tx.execute("DELETE FROM collections WHERE id = ?1", [id])?;
        Self::commit(tx)?;

        tracing::info!("Dropped collection '{}' for tenant {} ({} objects)", name, tenant, count);
        Ok(Committed::new(
            count,
            vec![ChangeEvent::collection(tenant, id, ChangeKind::Delete)],
        ))
    }

    fn count(&self, tenant: TenantId, collection: &str) -> DbResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = Self::existing_collection(&tx, tenant, collection)?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM objects WHERE collection_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn insert(
        &self,
        tenant: TenantId,
        collection: &str,
        documents: Vec<Map<String, Value>>,
    ) -> DbResult<Committed<Vec<Value>>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changes = Vec::with_capacity(documents.len() + 1);

        let (collection_id, created) = Self::ensure_collection(&tx, tenant, collection)?;
        if created {
            changes.push(ChangeEvent::collection(tenant, collection_id, ChangeKind::Insert));
        }

        let mut inserted = Vec::with_capacity(documents.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO objects (account_id, collection_id, data) VALUES (?1, ?2, ?3)",
            )?;
            for data in documents {
                stmt.execute(params![tenant, collection_id, serde_json::to_string(&data)?])?;
                let id = tx.last_insert_rowid();
                changes.push(ChangeEvent::object(tenant, id, ChangeKind::Insert));
                inserted.push(with_id(data, id));
            }
        }

        Self::commit(tx)?;
        tracing::debug!("Inserted {} objects into '{}'", inserted.len(), collection);
        Ok(Committed::new(inserted, changes))
    }

    fn get(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Value> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let collection_id = Self::existing_collection(&tx, tenant, collection)?;
        Ok(with_id(Self::load(&tx, collection_id, id)?, id))
    }

    fn update(
        &self,
        tenant: TenantId,
        collection: &str,
        id: ObjectId,
        document: Map<String, Value>,
    ) -> DbResult<Committed<Value>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let collection_id = Self::existing_collection(&tx, tenant, collection)?;

        let changed = tx.execute(
            "UPDATE objects SET data = ?1 WHERE id = ?2 AND collection_id = ?3",
            params![serde_json::to_string(&document)?, id, collection_id],
        )?;
        if changed == 0 {
            return Err(DbError::DocumentNotFound(id));
        }
        Self::commit(tx)?;

        Ok(Committed::new(
            with_id(document, id),
            vec![ChangeEvent::object(tenant, id, ChangeKind::Update)],
        ))
    }

    fn remove(&self, tenant: TenantId, collection: &str, id: ObjectId) -> DbResult<Committed<Value>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let collection_id = Self::existing_collection(&tx, tenant, collection)?;
        let existing = Self::load(&tx, collection_id, id)?;

        tx.execute("DELETE FROM objects WHERE id = ?1", [id])?;
        Self::commit(tx)?;

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
        let sql = translate(query, params)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let collection_id = Self::existing_collection(&tx, tenant, collection)?;
        let documents = Self::run_select(&tx, collection_id, &sql)?;
        Self::commit(tx)?;

        Ok(Selection::new(documents, sql.errors))
    }

    fn delete(
        &self,
        tenant: TenantId,
        collection: &str,
        query: &Query,
        params: &[Value],
    ) -> DbResult<Committed<Selection>> {
        reject_aggregate(query)?;
        let sql = translate(query, params)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let collection_id = Self::existing_collection(&tx, tenant, collection)?;
        let selection = Selection::new(Self::run_select(&tx, collection_id, &sql)?, sql.errors);

        let ids = selection.ids();
        {
            let mut stmt = tx.prepare("DELETE FROM objects WHERE id = ?1")?;
            for id in &ids {
                stmt.execute([id])?;
            }
        }
        Self::commit(tx)?;

        let changes = ids
            .into_iter()
            .map(|id| ChangeEvent::object(tenant, id, ChangeKind::Delete))
            .collect();
        Ok(Committed::new(selection, changes))
    }

    fn reconnect(&self) -> DbResult<()> {
        let fresh = open_connection(&self.path)?;
        *self.conn.lock() = fresh;
        tracing::info!("Reconnected relational store at {}", self.path.display());
        Ok(())
    }

    fn shutdown(&self) -> DbResult<()> {
        self.conn.lock().execute_batch("PRAGMA optimize")?;
        tracing::info!("Closed relational store at {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jql_core::parse;
    use tempfile::TempDir;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn backend() -> (TempDir, RelationalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = RelationalBackend::open(dir.path().join("store.sqlite3")).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_sql_values() {
        assert_eq!(sql_value(&json!(3)), SqlValue::Integer(3));
        assert_eq!(sql_value(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(sql_value(&json!("x")), SqlValue::Text("x".to_string()));
        assert_eq!(sql_value(&json!(null)), SqlValue::Null);
    }

    #[test]
    fn test_registered_functions() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();

        let num: Option<f64> = conn
            .query_row("SELECT jql_num(json('\"12.5\"'))", [], |r| r.get(0))
            .unwrap();
        assert_eq!(num, Some(12.5));
        let num: Option<f64> = conn
            .query_row("SELECT jql_num('{\"a\":1}')", [], |r| r.get(0))
            .unwrap();
        assert_eq!(num, None);

        conn.execute_batch("CREATE TABLE t (x REAL, y REAL); INSERT INTO t VALUES (1, 2), (2, 4), (3, 6), (NULL, 1);")
            .unwrap();
        let (var, slope, intercept, corr): (f64, f64, f64, f64) = conn
            .query_row(
                "SELECT var_pop(x), regr_slope(y, x), regr_intercept(y, x), corr(y, x) FROM t",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert!((var - 2.0 / 3.0).abs() < 1e-9);
        assert!((slope - 2.0).abs() < 1e-9);
        assert!(intercept.abs() < 1e-9);
        assert!((corr - 1.0).abs() < 1e-9);

        let (sum, mean): (f64, f64) = conn
            .query_row("SELECT jql_sum(x), jql_avg(x) FROM t", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!((sum, mean), (6.0, 2.0));
    }

    #[test]
    fn test_empty_aggregates() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        conn.execute_batch("CREATE TABLE t (x REAL)").unwrap();
        let stddev: f64 = conn
            .query_row("SELECT stddev_pop(x) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stddev, 0.0);
    }

    #[test]
    fn test_crud() {
        let (_dir, backend) = backend();
        let inserted = backend
            .insert(1, "users", vec![object(json!({"name": "a"})), object(json!({"name": "b"}))])
            .unwrap();
        assert_eq!(inserted.value[0]["$id"], 1);
        assert_eq!(inserted.changes.len(), 3);

        assert_eq!(backend.get(1, "users", 2).unwrap()["name"], "b");
        backend.update(1, "users", 2, object(json!({"name": "c"}))).unwrap();
        assert_eq!(backend.get(1, "users", 2).unwrap()["name"], "c");

        backend.remove(1, "users", 2).unwrap();
        assert!(matches!(backend.get(1, "users", 2), Err(DbError::DocumentNotFound(2))));
        assert!(matches!(backend.remove(1, "users", 2), Err(DbError::DocumentNotFound(2))));
        assert!(matches!(backend.get(2, "users", 1), Err(DbError::CollectionNotFound(_))));
    }

    #[test]
    fn test_select_aggregate() {
        let (_dir, backend) = backend();
        let docs = [(25, 51), (21, 43), (18, 37)]
            .into_iter()
            .map(|(age, salary)| object(json!({"age": age, "salary": salary})))
            .collect();
        backend.insert(1, "people", docs).unwrap();

        let query = parse("| count(*) as n, sum(age) as total, regr(salary, age) as fit").unwrap();
        let selection = backend.select(1, "people", &query, &[]).unwrap();
        let row = &selection.documents[0];
        assert_eq!(row["n"], 3);
        assert_eq!(row["total"].as_f64(), Some(64.0));
        assert!(row["fit"]["a"].is_number());
        assert!(row["fit"]["b"].is_number());
    }

    #[test]
    fn test_aggregates_keep_full_precision() {
        let (_dir, backend) = backend();
        let pairs = [(25.0, 51.0), (21.0, 44.0), (18.0, 37.0)];
        let docs = pairs
            .iter()
            .map(|(age, salary)| object(json!({"age": age, "salary": salary})))
            .collect();
        backend.insert(1, "people", docs).unwrap();

        let mut moments = Moments::default();
        for (age, salary) in pairs {
            moments.push_pair(salary, age);
        }
        let (a, b) = moments.regression();

        let query = parse("| regr(salary, age) as fit, stddev(age) as sd, avg(salary) as mean").unwrap();
        let row = &backend.select(1, "people", &query, &[]).unwrap().documents[0];
        assert_eq!(row["fit"], json!({"a": a, "b": b}));
        assert_eq!(row["sd"].as_f64(), Some(moments.stddev()));

        let mut salaries = Moments::default();
        pairs.iter().for_each(|(_, salary)| salaries.push(*salary));
        assert_eq!(row["mean"].as_f64(), Some(salaries.mean()));
        assert_eq!(row.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_delete_rolls_into_one_transaction() {
        let (_dir, backend) = backend();
        let docs = (1..=4).map(|n| object(json!({"n": n}))).collect();
        backend.insert(1, "c", docs).unwrap();

        let query = parse("n > 2").unwrap();
        let deleted = backend.delete(1, "c", &query, &[]).unwrap();
        assert_eq!(deleted.value.ids(), vec![3, 4]);
        assert_eq!(backend.count(1, "c").unwrap(), 2);

        let aggregate = parse("| count(*) as n").unwrap();
        assert!(matches!(
            backend.delete(1, "c", &aggregate, &[]),
            Err(DbError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_reconnect() {
        let (_dir, backend) = backend();
        backend.insert(1, "c", vec![object(json!({"k": 1}))]).unwrap();
        backend.reconnect().unwrap();
        assert_eq!(backend.get(1, "c", 1).unwrap()["k"], 1);
        assert_eq!(backend.list_collections(1).unwrap(), vec!["c"]);
    }
}
