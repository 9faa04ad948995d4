use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("database migration error: {0}")]
    Migration(String),
}

impl From<diesel::result::Error> for DatabaseError {
    fn from(value: diesel::result::Error) -> Self {
        DatabaseError::Query(value.to_string())
    }
}
