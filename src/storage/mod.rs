//! Storage layer: key-value adapter, capsule records, and blob access.

pub mod blob;
pub mod capsule;
pub mod kv;

pub use kv::{KvStore, StorageResult};
