//! Stored document helpers.
//!
//! Documents are JSON objects. The object id travels with returned documents
//! under the reserved `$id` field, which is never persisted.

use jql_core::ID_FIELD;
use serde_json::{Map, Value};

use crate::error::{DbError, DbResult};

use super::ObjectId;

/// Validate an incoming document and strip any caller-supplied `$id`.
pub fn into_object(document: Value) -> DbResult<Map<String, Value>> {
    match document {
        Value::Object(mut data) => {
            data.remove(ID_FIELD);
            Ok(data)
        }
        other => Err(DbError::InvalidDocument(format!(
            "expected a JSON object, got {}",
            jql_core::value::type_name(&other)
        ))),
    }
}

/// Attach the object id to stored data.
pub fn with_id(mut data: Map<String, Value>, id: ObjectId) -> Value {
    data.insert(ID_FIELD.to_string(), Value::from(id));
    Value::Object(data)
}

/// The `$id` of a returned document
pub fn id_of(document: &Value) -> Option<ObjectId> {
    document.get(ID_FIELD).and_then(Value::as_i64)
}

/// Serialize stored data
pub fn encode(data: &Map<String, Value>) -> DbResult<Vec<u8>> {
    Ok(serde_json::to_vec(data)?)
}

/// Deserialize stored data
pub fn decode(bytes: &[u8]) -> DbResult<Map<String, Value>> {
    match serde_json::from_slice(bytes)? {
        Value::Object(data) => Ok(data),
        other => Err(DbError::Storage(format!(
            "stored document is a {}, not an object",
            jql_core::value::type_name(&other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_object_strips_id() {
        let data = into_object(json!({"$id": 99, "name": "John"})).unwrap();
        assert!(!data.contains_key("$id"));
        assert_eq!(data["name"], "John");
    }

    #[test]
    fn test_into_object_rejects_scalars() {
        for value in [json!(1), json!("x"), json!([1, 2]), json!(null)] {
            assert!(matches!(into_object(value), Err(DbError::InvalidDocument(_))));
        }
    }

    #[test]
    fn test_with_id() {
        let data = into_object(json!({"a": 1})).unwrap();
        let doc = with_id(data, 7);
        assert_eq!(doc, json!({"a": 1, "$id": 7}));
        assert_eq!(id_of(&doc), Some(7));
    }

    #[test]
    fn test_decode() {
        let data = into_object(json!({"nested": {"x": [1, 2]}})).unwrap();
        let bytes = encode(&data).unwrap();
        assert_eq!(decode(&bytes).unwrap(), data);
        assert!(decode(b"[1]").is_err());
        assert!(decode(b"{not json").is_err());
    }
}
