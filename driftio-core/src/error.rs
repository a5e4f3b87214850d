use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriftError>;

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Status object not found: {0}")]
    StatusNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Lock on {oid} is held by another owner")]
    LockBusy { oid: String },

    #[error("Invalid sync entry: {0}")]
    InvalidEntry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriftError {
    /// Not-found conditions are sentinels for "initialize from scratch" or
    /// "nothing to replay", never task failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DriftError::StatusNotFound(_) | DriftError::ObjectNotFound(_)
        )
    }
}
