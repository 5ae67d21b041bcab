//! Error types for blob store operations.

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Object not found at the specified key.
    #[error("blob not found: {key}")]
    NotFound { key: String },

    /// A conditional write or read lost against the object's current state.
    #[error("precondition failed for blob {key}")]
    Conflict { key: String },

    /// Network failures, throttling and other errors worth retrying.
    #[error("transient error on blob {key}: {source}")]
    Transient {
        key: String,
        #[source]
        source: BoxError,
    },

    /// The backing store does not implement the requested operation.
    #[error("operation {operation} is not supported by the blob store")]
    Unsupported { operation: String },

    /// Invalid key or store URL.
    #[error("invalid blob path {key}: {reason}")]
    InvalidPath { key: String, reason: String },

    #[error("blob store error on {key}: {source}")]
    Other {
        key: String,
        #[source]
        source: BoxError,
    },
}

impl BlobError {
    /// Classifies an `object_store` error raised while operating on `key`.
    pub fn from_object_store(key: &str, err: object_store::Error) -> Self {
        let key = key.to_string();
        match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound { key },
            object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
                BlobError::Conflict { key }
            }
            object_store::Error::NotImplemented => BlobError::Unsupported {
                operation: key,
            },
            object_store::Error::NotSupported { source } => BlobError::Unsupported {
                operation: format!("{key}: {source}"),
            },
            object_store::Error::InvalidPath { source } => BlobError::InvalidPath {
                key,
                reason: source.to_string(),
            },
            err @ (object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }) => {
                BlobError::Transient {
                    key,
                    source: Box::new(err),
                }
            }
            err => BlobError::Other {
                key,
                source: Box::new(err),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BlobError::Conflict { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, BlobError::Unsupported { .. })
    }
}
