//! Persistent similarity index for requirement embeddings.
//!
//! # Architecture
//!
//! - `index`: in-memory vector map with cosine similarity search
//! - `storage`: checksummed binary file format for the index
//! - `store`: durable, lock-guarded face of the index shared across
//!   worker processes
//!
//! Mutations serialize through an exclusive file lock; searches are
//! lock-free against the last committed save (eventual consistency, a
//! search concurrent with an add may miss the new vector, never a torn
//! read thanks to atomic renames).

mod index;
mod storage;
mod store;

pub use index::{IndexError, SearchHit, VectorIndex};
pub use storage::{IndexFile, IndexFileError};
pub use store::{VectorStore, VectorStoreError};
