//! Durable key-value storage for Tether.
//!
//! The offline layer persists its mutation queue and response cache as
//! string blobs through the [`KeyValueStore`] trait. Two backends are
//! provided: a filesystem store for real use and an in-memory store for
//! tests.

pub mod file;
pub mod memory;
pub mod provider;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use provider::KeyValueStore;
