//! Common test utilities
//!
//! Provides shared helper functions for:
//! - Opening stores in either storage mode on temporary directories
//! - Seeding the sample `people` collection
//! - Comparing query results across backends

#![allow(dead_code)]

use jqlstore::{Selection, StorageMode, Store, StoreConfig};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const TENANT: i64 = 1;

pub fn config(mode: StorageMode, dir: &TempDir) -> StoreConfig {
    match mode {
        StorageMode::Embedded => StoreConfig::embedded(dir.path().join("rocksdb")),
        StorageMode::Relational => StoreConfig::relational(dir.path().join("store.sqlite3")),
    }
}

pub fn create_test_store(mode: StorageMode) -> (Store, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Store::open(config(mode, &tmp_dir)).expect("Failed to open store");
    (store, tmp_dir)
}

pub const MODES: [StorageMode; 2] = [StorageMode::Embedded, StorageMode::Relational];

/// Three people; salary = 2 * age + 1.
pub fn people() -> Value {
    json!([
        {"name": {"first": "John", "last": "Doe"}, "age": 25, "salary": 51, "active": true, "tags": "a"},
        {"name": {"first": "Jane"}, "age": 21, "salary": 43, "active": false},
        {"name": {"first": "Bob", "last": null}, "age": 18, "salary": 37, "active": true, "score": "12"}
    ])
}

pub fn create_seeded_store(mode: StorageMode) -> (Store, TempDir) {
    let (store, tmp) = create_test_store(mode);
    store.insert(TENANT, "people", people()).unwrap();
    (store, tmp)
}

pub fn select(store: &Store, query: &str, params: &[Value]) -> Selection {
    store
        .select(TENANT, "people", query, params)
        .unwrap_or_else(|e| panic!("query '{}' failed: {}", query, e))
}

pub fn ids(selection: &Selection) -> Vec<i64> {
    selection.ids()
}

/// Round to two decimal places
pub fn round2(value: &Value) -> f64 {
    let n = value
        .as_f64()
        .unwrap_or_else(|| panic!("expected a number, got {}", value));
    (n * 100.0).round() / 100.0
}
