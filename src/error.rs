use blob_store::BlobError;

pub type Result<T, E = DirectoryError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("file not found: {0}")]
    NotFound(String),

    /// A conditional write lost a race against another writer.
    #[error("conflicting update on {0}")]
    Conflict(String),

    /// The store kept failing after the retry budget was spent.
    #[error("blob store unavailable: {0}")]
    Transient(#[source] BlobError),

    /// The writer can no longer assume it is the only one. Fatal for the
    /// write session.
    #[error("write lease lost: {0}")]
    LeaseLost(String),

    #[error("index is locked by {holder} until {expires_at_ms}")]
    LockHeld { holder: String, expires_at_ms: u64 },

    #[error("corrupt object {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("output already open: {0}")]
    AlreadyOpen(String),

    #[error("commit failed after {attempts} attempts: {reason}")]
    CommitFailed { attempts: u32, reason: String },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("not supported by the blob store: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("blob store error: {0}")]
    Blob(#[source] BlobError),
}

impl DirectoryError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DirectoryError::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound(_))
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, DirectoryError::LeaseLost(_))
    }
}

impl From<BlobError> for DirectoryError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound { key } => DirectoryError::NotFound(key),
            BlobError::Conflict { key } => DirectoryError::Conflict(key),
            BlobError::Unsupported { operation } => DirectoryError::Unsupported(operation),
            err @ BlobError::Transient { .. } => DirectoryError::Transient(err),
            err => DirectoryError::Blob(err),
        }
    }
}

impl From<DirectoryError> for std::io::Error {
    fn from(err: DirectoryError) -> Self {
        let kind = match &err {
            DirectoryError::NotFound(_) => std::io::ErrorKind::NotFound,
            DirectoryError::AlreadyOpen(_) => std::io::ErrorKind::AlreadyExists,
            DirectoryError::InvalidName { .. } => std::io::ErrorKind::InvalidInput,
            DirectoryError::Corrupt { .. } => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
