//! Persistent response storage, one named store per cache generation.
//!
//! This module provides:
//! - canonical request identities with stable hashed keys
//! - a storage trait over named stores of request -> response pairs
//! - a SQLite backend that keeps response bodies as raw blobs

mod key;
mod storage;

pub use key::RequestKey;
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
