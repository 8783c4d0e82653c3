//! Side-effect stores written while producing child items.
//!
//! Writes here are best effort from the dispatcher's point of view: they are
//! not transactionally linked to the job counters.

pub mod blob;
pub mod document;

pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore, open_seekable};
pub use document::{DocumentStore, MemoryDocumentStore, PgDocumentStore};
