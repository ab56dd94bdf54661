use jql_core::JqlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Document with id '{0}' not found")]
    DocumentNotFound(i64),

    #[error("Invalid collection name: {0}")]
    InvalidName(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Query(#[from] JqlError),

    #[error("Transaction failed: {0}")]
    TransactionError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// Whether the error means the target id or collection does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DbError::CollectionNotFound(_) | DbError::DocumentNotFound(_)
        )
    }
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for DbError {
    fn from(err: rocksdb::Error) -> Self {
        DbError::Storage(err.into_string())
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DbError::CollectionNotFound("users".to_string());
        assert_eq!(err.to_string(), "Collection 'users' not found");

        let err = DbError::DocumentNotFound(42);
        assert_eq!(err.to_string(), "Document with id '42' not found");

        let err = DbError::InvalidDocument("expected a JSON object".to_string());
        assert_eq!(err.to_string(), "Invalid document: expected a JSON object");

        let err = DbError::InvalidName("a:b".to_string());
        assert_eq!(err.to_string(), "Invalid collection name: a:b");

        let err = DbError::TransactionError("disk full".to_string());
        assert_eq!(err.to_string(), "Transaction failed: disk full");
    }

    #[test]
    fn test_query_errors_are_transparent() {
        let err: DbError = JqlError::TypeCoercion("bad limit".to_string()).into();
        assert_eq!(err.to_string(), "Type error: bad limit");
        assert!(matches!(err, DbError::Query(JqlError::TypeCoercion(_))));
    }

    #[test]
    fn test_not_found() {
        assert!(DbError::DocumentNotFound(1).is_not_found());
        assert!(DbError::CollectionNotFound("x".to_string()).is_not_found());
        assert!(!DbError::Storage("x".to_string()).is_not_found());
    }

    #[test]
    fn test_error_serialization() {
        let err = DbError::CollectionNotFound("users".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Collection 'users' not found\"");
    }
}
