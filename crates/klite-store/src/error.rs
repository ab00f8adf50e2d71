use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The statement referenced a table that does not exist. Callers that
    /// read from lazily created partition tables match on this variant.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// An insert collided with an existing primary key.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Topic names are embedded into table identifiers; quote characters
    /// cannot be escaped safely and are rejected outright.
    #[error("invalid topic name {0:?}: quote characters are not allowed")]
    InvalidTopic(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Sort a driver error into the taxonomy above.
pub(crate) fn classify(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = error {
        let message = db.message().to_string();
        if message.contains("no such table") {
            return StoreError::NoSuchTable(message);
        }
        if db.is_unique_violation() {
            return StoreError::UniqueViolation(message);
        }
    }
    StoreError::Database(error)
}
