//! Index directory on blob storage.
//!
//! Files written by a single lease-holding writer are uploaded as immutable
//! objects and published atomically, one generation at a time, through
//! manifests. Readers resolve the latest valid manifest and read through a
//! local cache.

pub mod cache;
pub mod commit;
pub mod config;
pub mod directory;
pub mod error;
pub mod gc;
pub mod lock;
pub mod manifest;
pub mod naming;
pub mod tracing;
pub mod utils;

#[cfg(test)]
mod testing;

pub use blob_store::{BlobStorage, BlobStorageConfig, VersionToken};
pub use config::DirectoryConfig;
pub use directory::{
    BlobDirectory,
    Directory,
    DirectoryEntry,
    IndexInput,
    IndexOutput,
    ReaderSession,
    WriterSession,
};
pub use error::{DirectoryError, Result};
